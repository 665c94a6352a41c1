//! Per-server Cloudflare tunnels.
//!
//! A tunnel gives the server a stable public hostname without opening inbound
//! ports. Creation is four dependent API calls; a failure in any of them
//! rolls back what was already created before returning the original error.

use agenthost_common::{ProvisionError, TunnelConfig};
use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};

use crate::config::CloudflareSettings;

pub const DEFAULT_BASE_URL: &str = "https://api.cloudflare.com/client/v4";

#[async_trait]
pub trait TunnelService: Send + Sync {
    async fn create_tunnel(&self, name: &str) -> Result<TunnelConfig>;

    /// Delete connections (ignored on failure), then the tunnel itself
    /// (propagated), then its DNS record (best effort).
    async fn delete_tunnel(&self, tunnel_id: &str, dns_record_id: Option<&str>) -> Result<()>;
}

/// `<name>.<domain>`, where `name` must be a single DNS label.
pub fn tunnel_hostname(name: &str, domain: &str) -> Result<String, ProvisionError> {
    let name = name.trim();
    if name.contains('.') {
        return Err(ProvisionError::Configuration(format!(
            "tunnel name '{}' must be a single label (no dots)",
            name
        )));
    }
    let label: String = name
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let label = label.trim_matches('-');
    let label = &label[..label.len().min(63)];
    if label.is_empty() {
        return Err(ProvisionError::Configuration(
            "tunnel name is empty".to_string(),
        ));
    }
    Ok(format!("{}.{}", label.trim_end_matches('-'), domain))
}

pub struct CloudflareTunnelService {
    client: Client,
    settings: CloudflareSettings,
    terminal_port: u16,
    gateway_port: u16,
}

impl CloudflareTunnelService {
    pub fn new(settings: CloudflareSettings, terminal_port: u16, gateway_port: u16) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(5))
            .timeout(std::time::Duration::from_secs(20))
            .build()?;
        Ok(Self {
            client,
            settings,
            terminal_port,
            gateway_port,
        })
    }

    fn account_url(&self, path: &str) -> String {
        format!(
            "{}/accounts/{}{}",
            self.settings.base_url.trim_end_matches('/'),
            self.settings.account_id,
            path
        )
    }

    fn zone_url(&self, path: &str) -> String {
        format!(
            "{}/zones/{}{}",
            self.settings.base_url.trim_end_matches('/'),
            self.settings.zone_id,
            path
        )
    }

    /// Send a request and unwrap the `{success, errors, result}` envelope.
    async fn call(&self, req: RequestBuilder, what: &str) -> Result<Value> {
        let resp = req.bearer_auth(&self.settings.api_token).send().await?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
        let success = body["success"].as_bool().unwrap_or(status.is_success());
        if !status.is_success() || !success {
            let errors = body["errors"]
                .as_array()
                .map(|errs| {
                    errs.iter()
                        .filter_map(|e| e["message"].as_str())
                        .collect::<Vec<_>>()
                        .join("; ")
                })
                .filter(|s| !s.is_empty())
                .unwrap_or(text);
            tracing::error!(
                "[Cloudflare API] {} failed: status={} errors={}",
                what,
                status.as_u16(),
                errors
            );
            return Err(ProvisionError::Provider(format!(
                "Cloudflare {} failed: status={} {}",
                what,
                status.as_u16(),
                errors
            ))
            .into());
        }
        Ok(body["result"].clone())
    }

    async fn create_tunnel_object(&self, name: &str) -> Result<String> {
        let result = self
            .call(
                self.client
                    .post(self.account_url("/cfd_tunnel"))
                    .json(&json!({ "name": name, "config_src": "cloudflare" })),
                "create tunnel",
            )
            .await?;
        result["id"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| ProvisionError::Provider("Cloudflare tunnel response has no id".into()).into())
    }

    async fn fetch_token(&self, tunnel_id: &str) -> Result<String> {
        let result = self
            .call(
                self.client
                    .get(self.account_url(&format!("/cfd_tunnel/{}/token", tunnel_id))),
                "get tunnel token",
            )
            .await?;
        result
            .as_str()
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .ok_or_else(|| ProvisionError::Provider("Cloudflare returned an empty tunnel token".into()).into())
    }

    async fn configure_ingress(&self, tunnel_id: &str, hostname: &str) -> Result<()> {
        let config = json!({
            "config": {
                "ingress": [
                    {
                        "hostname": hostname,
                        "path": "^/gateway",
                        "service": format!("http://localhost:{}", self.gateway_port),
                    },
                    {
                        "hostname": hostname,
                        "service": format!("http://localhost:{}", self.terminal_port),
                    },
                    { "service": "http_status:404" }
                ]
            }
        });
        self.call(
            self.client
                .put(self.account_url(&format!("/cfd_tunnel/{}/configurations", tunnel_id)))
                .json(&config),
            "configure ingress",
        )
        .await?;
        Ok(())
    }

    async fn create_dns_record(&self, tunnel_id: &str, hostname: &str) -> Result<String> {
        let result = self
            .call(
                self.client.post(self.zone_url("/dns_records")).json(&json!({
                    "type": "CNAME",
                    "name": hostname,
                    "content": format!("{}.cfargotunnel.com", tunnel_id),
                    "proxied": true,
                })),
                "create dns record",
            )
            .await?;
        result["id"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| ProvisionError::Provider("Cloudflare dns response has no id".into()).into())
    }

    async fn delete_dns_record(&self, record_id: &str) -> Result<()> {
        self.call(
            self.client
                .delete(self.zone_url(&format!("/dns_records/{}", record_id))),
            "delete dns record",
        )
        .await?;
        Ok(())
    }

    async fn find_dns_records(&self, tunnel_id: &str) -> Result<Vec<String>> {
        let result = self
            .call(
                self.client.get(self.zone_url("/dns_records")).query(&[
                    ("type", "CNAME".to_string()),
                    ("content", format!("{}.cfargotunnel.com", tunnel_id)),
                ]),
                "list dns records",
            )
            .await?;
        Ok(result
            .as_array()
            .map(|records| {
                records
                    .iter()
                    .filter_map(|r| r["id"].as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_connections(&self, tunnel_id: &str) -> Result<()> {
        self.call(
            self.client
                .delete(self.account_url(&format!("/cfd_tunnel/{}/connections", tunnel_id))),
            "delete tunnel connections",
        )
        .await?;
        Ok(())
    }

    async fn delete_tunnel_object(&self, tunnel_id: &str) -> Result<()> {
        self.call(
            self.client
                .delete(self.account_url(&format!("/cfd_tunnel/{}", tunnel_id))),
            "delete tunnel",
        )
        .await?;
        Ok(())
    }

    /// Undo a partial creation and hand back the error that caused it.
    /// `dns_attempted` means the CNAME request was sent; it may have been
    /// committed even though no record id came back.
    async fn rollback(
        &self,
        tunnel_id: &str,
        dns_attempted: bool,
        cause: anyhow::Error,
    ) -> anyhow::Error {
        tracing::warn!(
            "[tunnel] creation of {} failed, rolling back: {}",
            tunnel_id,
            cause
        );
        if dns_attempted {
            let records = self.find_dns_records(tunnel_id).await.unwrap_or_else(|e| {
                tracing::warn!("[tunnel] rollback: cannot list dns records of {}: {}", tunnel_id, e);
                Vec::new()
            });
            for record_id in records {
                if let Err(e) = self.delete_dns_record(&record_id).await {
                    tracing::warn!("[tunnel] rollback: dns record {} not deleted: {}", record_id, e);
                }
            }
        }
        if let Err(e) = self.delete_connections(tunnel_id).await {
            tracing::debug!("[tunnel] rollback: connections of {} not deleted: {}", tunnel_id, e);
        }
        if let Err(e) = self.delete_tunnel_object(tunnel_id).await {
            tracing::warn!("[tunnel] rollback: tunnel {} not deleted: {}", tunnel_id, e);
        }
        cause
    }
}

#[async_trait]
impl TunnelService for CloudflareTunnelService {
    async fn create_tunnel(&self, name: &str) -> Result<TunnelConfig> {
        let hostname = tunnel_hostname(name, &self.settings.domain)?;
        tracing::info!("[tunnel] creating tunnel {} for {}", name, hostname);

        let tunnel_id = self.create_tunnel_object(name).await?;

        let token = match self.fetch_token(&tunnel_id).await {
            Ok(token) => token,
            Err(e) => return Err(self.rollback(&tunnel_id, false, e).await),
        };
        if let Err(e) = self.configure_ingress(&tunnel_id, &hostname).await {
            return Err(self.rollback(&tunnel_id, false, e).await);
        }
        let dns_record_id = match self.create_dns_record(&tunnel_id, &hostname).await {
            Ok(id) => id,
            Err(e) => return Err(self.rollback(&tunnel_id, true, e).await),
        };

        tracing::info!("[tunnel] tunnel {} ready at {}", tunnel_id, hostname);
        Ok(TunnelConfig {
            id: tunnel_id,
            token,
            hostname,
            dns_record_id: Some(dns_record_id),
        })
    }

    async fn delete_tunnel(&self, tunnel_id: &str, dns_record_id: Option<&str>) -> Result<()> {
        if let Err(e) = self.delete_connections(tunnel_id).await {
            tracing::debug!("[tunnel] connections of {} not deleted: {}", tunnel_id, e);
        }
        self.delete_tunnel_object(tunnel_id).await?;

        let records = match dns_record_id {
            Some(id) => vec![id.to_string()],
            None => self.find_dns_records(tunnel_id).await.unwrap_or_else(|e| {
                tracing::warn!("[tunnel] cannot list dns records of {}: {}", tunnel_id, e);
                Vec::new()
            }),
        };
        for record_id in records {
            if let Err(e) = self.delete_dns_record(&record_id).await {
                tracing::warn!("[tunnel] dns record {} not deleted: {}", record_id, e);
            }
        }
        tracing::info!("[tunnel] tunnel {} deleted", tunnel_id);
        Ok(())
    }
}
