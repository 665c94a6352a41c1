use std::collections::HashMap;

use agenthost_common::{ProviderKind, ProvisionError, ServerCredentials, ServerInfo, ServerStatus};
use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::json;

use crate::readiness::{self, ReadinessPolicy};
use crate::{CreateServerOpts, ServerProvider};

pub const DEFAULT_BASE_URL: &str = "https://api.scaleway.com/instance/v1";

#[derive(Debug, Clone)]
pub struct ScalewayConfig {
    pub project_id: String,
    pub secret_key: String,
    pub zone: String,
    pub base_url: String,
    pub image: String,
    /// Plan id -> commercial type.
    pub commercial_types: HashMap<String, String>,
    pub default_commercial_type: String,
    pub credentials: Option<ServerCredentials>,
    pub readiness: ReadinessPolicy,
}

impl ScalewayConfig {
    pub fn new(project_id: String, secret_key: String) -> Self {
        let commercial_types = HashMap::from([
            ("linux-eu".to_string(), "DEV1-M".to_string()),
            ("linux-gpu".to_string(), "L4-1-24G".to_string()),
        ]);
        Self {
            project_id: project_id.trim().to_string(),
            secret_key: secret_key.trim().to_string(),
            zone: "fr-par-2".to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            image: "ubuntu_noble".to_string(),
            commercial_types,
            default_commercial_type: "DEV1-M".to_string(),
            credentials: None,
            readiness: ReadinessPolicy::default(),
        }
    }
}

pub struct ScalewayProvider {
    client: Client,
    config: ScalewayConfig,
}

impl ScalewayProvider {
    pub fn new(config: ScalewayConfig) -> Result<Self> {
        if config.project_id.is_empty() || config.secret_key.is_empty() {
            return Err(ProvisionError::Configuration(
                "SCALEWAY_PROJECT_ID and SCALEWAY_SECRET_KEY are required".into(),
            )
            .into());
        }
        Ok(Self {
            client: crate::http_client()?,
            config,
        })
    }

    fn headers(&self) -> Result<reqwest::header::HeaderMap> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "X-Auth-Token",
            reqwest::header::HeaderValue::from_str(&self.config.secret_key)?,
        );
        Ok(headers)
    }

    fn server_url(&self, server_id: &str) -> String {
        format!(
            "{}/zones/{}/servers/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.zone,
            server_id
        )
    }

    fn commercial_type(&self, plan_id: &str) -> &str {
        self.config
            .commercial_types
            .get(&plan_id.trim().to_ascii_lowercase())
            .map(|s| s.as_str())
            .unwrap_or(self.config.default_commercial_type.as_str())
    }

    fn map_state(state: &str) -> ServerStatus {
        match state {
            "starting" => ServerStatus::Creating,
            "running" => ServerStatus::Running,
            "stopped" | "stopped in place" | "stopping" => ServerStatus::Stopped,
            _ => ServerStatus::Error,
        }
    }

    fn parse_server(&self, server: &serde_json::Value) -> Result<ServerInfo> {
        let id = server["id"]
            .as_str()
            .ok_or_else(|| ProvisionError::Provider("No server id in Scaleway response".into()))?
            .to_string();
        // public_ip.address (dynamic IP), else first of public_ips (routed IPs).
        let ip = server["public_ip"]["address"]
            .as_str()
            .or_else(|| server["public_ips"][0]["address"].as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());
        Ok(ServerInfo {
            id,
            name: server["name"].as_str().unwrap_or_default().to_string(),
            ip,
            status: Self::map_state(server["state"].as_str().unwrap_or("unknown")),
            credentials: self.config.credentials.clone(),
        })
    }

    async fn set_cloud_init(&self, server_id: &str, cloud_init: &str) -> Result<()> {
        let url = format!("{}/user_data/cloud-init", self.server_url(server_id));
        let resp = self
            .client
            .patch(&url)
            .headers(self.headers()?)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(cloud_init.to_string())
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProvisionError::Provider(format!(
                "Scaleway set cloud-init failed: status={} body={}",
                status.as_u16(),
                text
            ))
            .into());
        }
        Ok(())
    }

    async fn boot(&self, server_id: &str, user_data: Option<&str>) -> Result<()> {
        if let Some(ud) = user_data.filter(|s| !s.trim().is_empty()) {
            self.set_cloud_init(server_id, ud).await?;
        }
        let resp = self.action(server_id, "poweron").await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProvisionError::Provider(format!(
                "Scaleway poweron failed: status={} body={}",
                status.as_u16(),
                text
            ))
            .into());
        }
        Ok(())
    }

    /// Best-effort removal of a server that never booted. A stopped server
    /// is deleted directly; `terminate` only applies to running ones.
    async fn discard(&self, server_id: &str) {
        let url = self.server_url(server_id);
        let res = match self.headers() {
            Ok(headers) => self.client.delete(&url).headers(headers).send().await,
            Err(e) => {
                tracing::warn!("[Scaleway API] cannot discard server {}: {:#}", server_id, e);
                return;
            }
        };
        match res {
            Ok(resp) if resp.status().is_success() || resp.status() == StatusCode::NOT_FOUND => {
                tracing::info!("[Scaleway API] discarded server {} after failed boot", server_id);
            }
            Ok(resp) => tracing::warn!(
                "[Scaleway API] discard of server {} failed: status={}",
                server_id,
                resp.status().as_u16()
            ),
            Err(e) => tracing::warn!("[Scaleway API] discard of server {} failed: {}", server_id, e),
        }
    }

    async fn action(&self, server_id: &str, action: &str) -> Result<reqwest::Response> {
        let url = format!("{}/action", self.server_url(server_id));
        tracing::info!("[Scaleway API] POST {} - action={}", url, action);
        Ok(self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&json!({ "action": action }))
            .send()
            .await?)
    }
}

#[async_trait]
impl ServerProvider for ScalewayProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Scaleway
    }

    async fn create_server(&self, opts: &CreateServerOpts) -> Result<ServerInfo> {
        let url = format!(
            "{}/zones/{}/servers",
            self.config.base_url.trim_end_matches('/'),
            self.config.zone
        );
        let mut tags = vec!["agenthost".to_string(), format!("plan={}", opts.plan_id)];
        tags.extend(opts.labels.iter().map(|(k, v)| format!("{}={}", k, v)));

        let body = json!({
            "name": opts.name,
            "commercial_type": self.commercial_type(&opts.plan_id),
            "project": self.config.project_id,
            "image": self.config.image,
            "tags": tags,
            "dynamic_ip_required": true,
        });

        tracing::info!(
            "[Scaleway API] POST {} - creating server name={} type={} zone={}",
            url,
            opts.name,
            self.commercial_type(&opts.plan_id),
            self.config.zone
        );

        let resp = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            tracing::error!(
                "[Scaleway API] POST {} failed: status={} response={}",
                url,
                status.as_u16(),
                text
            );
            return Err(ProvisionError::Provider(format!(
                "Scaleway create_server failed: status={} body={}",
                status.as_u16(),
                text
            ))
            .into());
        }

        let json_resp: serde_json::Value = resp.json().await?;
        let info = self.parse_server(&json_resp["server"])?;

        // Scaleway takes cloud-init through a separate endpoint and creates
        // servers powered off; both must happen before boot.
        if let Err(e) = self.boot(&info.id, opts.user_data.as_deref()).await {
            self.discard(&info.id).await;
            return Err(e);
        }

        tracing::info!("[Scaleway API] server created and powering on: id={}", info.id);
        Ok(ServerInfo {
            status: ServerStatus::Creating,
            ..info
        })
    }

    async fn wait_for_ready(&self, info: ServerInfo) -> Result<ServerInfo> {
        readiness::wait_for_ready(self, info, &self.config.readiness).await
    }

    async fn delete_server(&self, server_id: &str) -> Result<()> {
        // `terminate` powers off and deletes the server with its local volumes.
        let resp = self.action(server_id, "terminate").await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            tracing::info!(
                "[Scaleway API] server {} already absent, treating delete as done",
                server_id
            );
            return Ok(());
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProvisionError::Provider(format!(
                "Scaleway terminate failed: status={} body={}",
                status.as_u16(),
                text
            ))
            .into());
        }
        Ok(())
    }

    async fn get_server(&self, server_id: &str) -> Result<Option<ServerInfo>> {
        let url = self.server_url(server_id);
        let resp = self.client.get(&url).headers(self.headers()?).send().await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProvisionError::Provider(format!(
                "Scaleway get_server failed: status={} body={}",
                status.as_u16(),
                text
            ))
            .into());
        }
        let json_resp: serde_json::Value = resp.json().await?;
        Ok(Some(self.parse_server(&json_resp["server"])?))
    }
}
