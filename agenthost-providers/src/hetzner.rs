use std::collections::HashMap;

use agenthost_common::{
    ProviderKind, ProvisionError, ServerCredentials, ServerInfo, ServerSecret, ServerStatus,
};
use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::json;

use crate::readiness::{self, ReadinessPolicy};
use crate::{CreateServerOpts, ServerProvider};

pub const DEFAULT_BASE_URL: &str = "https://api.hetzner.cloud/v1";

#[derive(Debug, Clone)]
pub struct HetznerConfig {
    pub api_token: String,
    pub base_url: String,
    pub image: String,
    pub location: String,
    /// Plan id -> Hetzner server type.
    pub server_types: HashMap<String, String>,
    pub default_server_type: String,
    /// Names of SSH keys registered in the Hetzner project.
    pub ssh_key_names: Vec<String>,
    /// Login used when the create response carries no root password.
    pub credentials: Option<ServerCredentials>,
    pub readiness: ReadinessPolicy,
}

impl HetznerConfig {
    pub fn new(api_token: String) -> Self {
        let server_types = HashMap::from([
            ("linux".to_string(), "cx22".to_string()),
            ("linux-pro".to_string(), "cx32".to_string()),
        ]);
        Self {
            api_token: api_token.trim().to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            image: "ubuntu-24.04".to_string(),
            location: "nbg1".to_string(),
            server_types,
            default_server_type: "cx22".to_string(),
            ssh_key_names: Vec::new(),
            credentials: None,
            readiness: ReadinessPolicy::default(),
        }
    }
}

pub struct HetznerProvider {
    client: Client,
    config: HetznerConfig,
}

impl HetznerProvider {
    pub fn new(config: HetznerConfig) -> Result<Self> {
        if config.api_token.is_empty() {
            return Err(ProvisionError::Configuration("HETZNER_API_TOKEN is empty".into()).into());
        }
        Ok(Self {
            client: crate::http_client()?,
            config,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn server_type(&self, plan_id: &str) -> &str {
        self.config
            .server_types
            .get(&plan_id.trim().to_ascii_lowercase())
            .map(|s| s.as_str())
            .unwrap_or(self.config.default_server_type.as_str())
    }

    fn map_status(status: &str) -> ServerStatus {
        match status {
            "initializing" | "starting" | "rebuilding" | "migrating" => ServerStatus::Creating,
            "running" => ServerStatus::Running,
            "off" | "stopping" | "deleting" => ServerStatus::Stopped,
            _ => ServerStatus::Error,
        }
    }

    fn parse_server(&self, server: &serde_json::Value) -> Result<ServerInfo> {
        let id = match &server["id"] {
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::String(s) => s.clone(),
            _ => {
                return Err(
                    ProvisionError::Provider("Hetzner response has no server id".into()).into(),
                )
            }
        };
        let ip = server["public_net"]["ipv4"]["ip"]
            .as_str()
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());
        Ok(ServerInfo {
            id,
            name: server["name"].as_str().unwrap_or_default().to_string(),
            ip,
            status: Self::map_status(server["status"].as_str().unwrap_or("unknown")),
            credentials: self.config.credentials.clone(),
        })
    }
}

#[async_trait]
impl ServerProvider for HetznerProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Hetzner
    }

    async fn create_server(&self, opts: &CreateServerOpts) -> Result<ServerInfo> {
        let url = self.url("/servers");
        let mut labels: HashMap<String, String> = opts.labels.clone();
        labels.insert("managed-by".into(), "agenthost".into());
        labels.insert("plan".into(), opts.plan_id.clone());

        let mut body = json!({
            "name": opts.name,
            "server_type": self.server_type(&opts.plan_id),
            "image": self.config.image,
            "location": self.config.location,
            "labels": labels,
            "start_after_create": true,
        });
        if !self.config.ssh_key_names.is_empty() {
            body["ssh_keys"] = json!(self.config.ssh_key_names);
        }
        if let Some(ud) = opts.user_data.as_deref().filter(|s| !s.trim().is_empty()) {
            body["user_data"] = json!(ud);
        }

        tracing::info!(
            "[Hetzner API] POST {} - creating server name={} type={} location={}",
            url,
            opts.name,
            self.server_type(&opts.plan_id),
            self.config.location
        );

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_token)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            tracing::error!(
                "[Hetzner API] POST {} failed: status={} response={}",
                url,
                status.as_u16(),
                text
            );
            return Err(ProvisionError::Provider(format!(
                "Hetzner create_server failed: status={} body={}",
                status.as_u16(),
                text
            ))
            .into());
        }

        let json_resp: serde_json::Value = resp.json().await?;
        let mut info = self.parse_server(&json_resp["server"])?;

        // Without ssh keys Hetzner generates a root password and returns it once.
        if let Some(pw) = json_resp["root_password"].as_str().filter(|s| !s.is_empty()) {
            info.credentials = Some(ServerCredentials {
                username: "root".to_string(),
                secret: ServerSecret::Password(pw.to_string()),
            });
        }

        tracing::info!(
            "[Hetzner API] server created: id={} status={}",
            info.id,
            info.status.as_str()
        );
        Ok(info)
    }

    async fn wait_for_ready(&self, info: ServerInfo) -> Result<ServerInfo> {
        readiness::wait_for_ready(self, info, &self.config.readiness).await
    }

    async fn delete_server(&self, server_id: &str) -> Result<()> {
        let url = self.url(&format!("/servers/{}", server_id));
        tracing::info!("[Hetzner API] DELETE {} - deleting server", url);

        let resp = self
            .client
            .delete(&url)
            .bearer_auth(&self.config.api_token)
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            tracing::info!(
                "[Hetzner API] server {} already absent, treating delete as done",
                server_id
            );
            return Ok(());
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProvisionError::Provider(format!(
                "Hetzner delete_server failed: status={} body={}",
                status.as_u16(),
                text
            ))
            .into());
        }
        Ok(())
    }

    async fn get_server(&self, server_id: &str) -> Result<Option<ServerInfo>> {
        let url = self.url(&format!("/servers/{}", server_id));
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.config.api_token)
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProvisionError::Provider(format!(
                "Hetzner get_server failed: status={} body={}",
                status.as_u16(),
                text
            ))
            .into());
        }
        let json_resp: serde_json::Value = resp.json().await?;
        Ok(Some(self.parse_server(&json_resp["server"])?))
    }
}
