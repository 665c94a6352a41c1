use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ProviderKind, ServerMetadata};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CallbackStatus {
    Ready,
    Error,
}

/// Body of the outbound completion callback sent to the control plane.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CallbackPayload {
    pub instance_id: Uuid,
    pub status: CallbackStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_url: Option<String>,
}

impl CallbackPayload {
    pub fn ready(instance_id: Uuid, metadata: &ServerMetadata) -> Self {
        Self {
            instance_id,
            status: CallbackStatus::Ready,
            error: None,
            provider: metadata.provider,
            server_id: metadata.server_id.clone(),
            server_ip: metadata.server_ip.clone(),
            tunnel_id: metadata.tunnel_id.clone(),
            tunnel_url: metadata.tunnel_url.clone(),
            terminal_url: metadata.terminal_url.clone(),
        }
    }

    pub fn error(instance_id: Uuid, message: &str) -> Self {
        Self {
            instance_id,
            status: CallbackStatus::Error,
            error: Some(message.to_string()),
            provider: None,
            server_id: None,
            server_ip: None,
            tunnel_id: None,
            tunnel_url: None,
            terminal_url: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_payload_omits_connection_fields() {
        let id = Uuid::new_v4();
        let v = serde_json::to_value(CallbackPayload::error(id, "boom")).unwrap();
        assert_eq!(v["status"], "error");
        assert_eq!(v["error"], "boom");
        assert_eq!(v["instanceId"], id.to_string());
        assert!(v.get("serverId").is_none());
        assert!(v.get("terminalUrl").is_none());
    }

    #[test]
    fn ready_payload_carries_connection_metadata() {
        let id = Uuid::new_v4();
        let meta = ServerMetadata {
            provider: Some(ProviderKind::Hetzner),
            server_id: Some("4711".into()),
            terminal_url: Some("https://linux-1.agents.example.com".into()),
            ..Default::default()
        };
        let v = serde_json::to_value(CallbackPayload::ready(id, &meta)).unwrap();
        assert_eq!(v["status"], "ready");
        assert_eq!(v["provider"], "hetzner");
        assert_eq!(v["serverId"], "4711");
        assert_eq!(v["terminalUrl"], "https://linux-1.agents.example.com");
        assert!(v.get("error").is_none());
        assert!(v.get("tunnelId").is_none());
    }
}
