//! JSON-RPC client for the agent gateway running on each server.
//!
//! One WebSocket per call: connect, send `{id, method, params}`, wait for the
//! frame carrying the same id. The call timeout runs from the send; the
//! connect and handshake have their own bound. Transport failures are retried
//! through a [`RetryPolicy`]; application errors returned by the gateway are
//! not.

use std::time::Duration;

use agenthost_common::ProvisionError;
use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::retry::RetryPolicy;

pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type GatewaySocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Retry schedule for gateway calls: 5, 5, 10, 10, 15, 15 seconds.
pub fn default_retry_policy() -> RetryPolicy {
    RetryPolicy::new(
        [5, 5, 10, 10, 15, 15]
            .into_iter()
            .map(Duration::from_secs)
            .collect(),
        is_retryable,
    )
}

/// Transport-level failures worth another attempt.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    if let Some(ProvisionError::Rpc { retryable, .. }) = err.downcast_ref::<ProvisionError>() {
        return *retryable;
    }
    is_retryable_message(&err.to_string())
}

fn is_retryable_message(message: &str) -> bool {
    let m = message.to_ascii_lowercase();
    ["connection", "refused", "502", "503", "timeout", "timed out", "closed"]
        .iter()
        .any(|needle| m.contains(needle))
}

fn transport_error(message: String) -> anyhow::Error {
    let retryable = is_retryable_message(&message);
    ProvisionError::Rpc { message, retryable }.into()
}

/// Where to reach an instance's gateway.
pub fn gateway_endpoint(tunnel_hostname: Option<&str>, ip: Option<&str>, port: u16) -> Option<String> {
    match (tunnel_hostname, ip) {
        (Some(host), _) if !host.is_empty() => Some(format!("wss://{}/gateway", host)),
        (_, Some(ip)) if !ip.is_empty() => Some(format!("ws://{}:{}", ip, port)),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct GatewayClient {
    endpoint: String,
    token: Option<String>,
    connect_timeout: Duration,
    call_timeout: Duration,
    retry: RetryPolicy,
}

impl GatewayClient {
    pub fn new(endpoint: &str, token: Option<String>) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
            connect_timeout: CONNECT_TIMEOUT,
            call_timeout: CALL_TIMEOUT,
            retry: default_retry_policy(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let label = format!("gateway {}", method);
        self.retry
            .run(&label, || self.call_once(method, params.clone()))
            .await
    }

    pub async fn patch_config(&self, patch: Value) -> Result<Value> {
        self.call("config.patch", Some(json!({ "patch": patch }))).await
    }

    pub async fn set_env(&self, vars: Value) -> Result<Value> {
        self.call("env.set", Some(json!({ "vars": vars }))).await
    }

    pub async fn apply_config(&self) -> Result<Value> {
        self.call("config.apply", None).await
    }

    pub async fn get_config(&self) -> Result<Value> {
        self.call("config.get", None).await
    }

    async fn call_once(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let mut ws = self.connect().await?;

        let id = Uuid::new_v4().to_string();
        let mut frame = json!({ "id": id, "method": method });
        if let Some(p) = params {
            frame["params"] = p;
        }
        tracing::debug!("[gateway] -> {} {} ({})", self.endpoint, method, id);
        let exchange = self.exchange(&mut ws, method, &id, frame);
        let res = tokio::time::timeout(self.call_timeout, exchange)
            .await
            .unwrap_or_else(|_| {
                Err(ProvisionError::Rpc {
                    message: format!(
                        "{} timed out after {}s",
                        method,
                        self.call_timeout.as_secs_f32()
                    ),
                    retryable: true,
                }
                .into())
            });
        let _ = ws.close(None).await;
        res
    }

    async fn connect(&self) -> Result<GatewaySocket> {
        let mut request = self
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| ProvisionError::Configuration(format!("invalid gateway endpoint: {}", e)))?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| ProvisionError::Configuration(format!("invalid gateway token: {}", e)))?;
            request.headers_mut().insert("authorization", value);
        }

        let connect = tokio_tungstenite::connect_async(request);
        match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok((ws, _))) => Ok(ws),
            Ok(Err(e)) => Err(transport_error(format!("connect {}: {}", self.endpoint, e))),
            Err(_) => Err(ProvisionError::Rpc {
                message: format!("connect {} timed out", self.endpoint),
                retryable: true,
            }
            .into()),
        }
    }

    async fn exchange(
        &self,
        ws: &mut GatewaySocket,
        method: &str,
        id: &str,
        frame: Value,
    ) -> Result<Value> {
        ws.send(Message::Text(frame.to_string()))
            .await
            .map_err(|e| transport_error(format!("send {}: {}", method, e)))?;

        while let Some(msg) = ws.next().await {
            let msg = msg.map_err(|e| transport_error(format!("read {}: {}", method, e)))?;
            let text = match msg {
                Message::Text(t) => t,
                Message::Binary(b) => String::from_utf8_lossy(&b).into_owned(),
                Message::Close(_) => break,
                _ => continue,
            };
            let Ok(body) = serde_json::from_str::<Value>(&text) else {
                tracing::debug!("[gateway] ignoring non-json frame on {}", method);
                continue;
            };
            if body["id"].as_str() != Some(id) {
                continue;
            }

            if let Some(err) = body.get("error").filter(|e| !e.is_null()) {
                let message = err["message"].as_str().unwrap_or("unknown error");
                let code = match &err["code"] {
                    Value::Null => String::new(),
                    other => format!(" (code {})", other),
                };
                return Err(ProvisionError::Rpc {
                    message: format!("{} rejected: {}{}", method, message, code),
                    retryable: false,
                }
                .into());
            }
            tracing::debug!("[gateway] <- {} {} ok", self.endpoint, method);
            return Ok(body.get("result").cloned().unwrap_or(Value::Null));
        }

        Err(ProvisionError::Rpc {
            message: format!("{}: channel closed before response", method),
            retryable: true,
        }
        .into())
    }
}
