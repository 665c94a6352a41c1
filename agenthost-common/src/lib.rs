use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod callback;
pub mod error;
pub mod job;
pub mod plan;

pub use callback::{CallbackPayload, CallbackStatus};
pub use error::ProvisionError;
pub use job::{JobResult, ProvisionStep, ProvisioningJob};
pub use plan::provider_for_plan;

// --- Enums ---

#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type, utoipa::ToSchema,
)]
#[sqlx(type_name = "instance_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Pending,      // Created by the request layer
    Provisioning, // Pipeline running
    Configuring,  // Server up, configuration in progress or pending a retry
    Ready,        // Reachable and configured
    Error,        // Pipeline failed
    Terminated,   // Server deleted (final)
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Provisioning => "provisioning",
            InstanceStatus::Configuring => "configuring",
            InstanceStatus::Ready => "ready",
            InstanceStatus::Error => "error",
            InstanceStatus::Terminated => "terminated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(InstanceStatus::Pending),
            "provisioning" => Some(InstanceStatus::Provisioning),
            "configuring" => Some(InstanceStatus::Configuring),
            "ready" => Some(InstanceStatus::Ready),
            "error" => Some(InstanceStatus::Error),
            "terminated" => Some(InstanceStatus::Terminated),
            _ => None,
        }
    }

    /// A pipeline (provision or configure) currently owns the instance.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Provisioning | InstanceStatus::Configuring
        )
    }

    /// Allowed lifecycle edges.
    ///
    /// Forward-only, except that `error` is reachable from every non-terminal
    /// state and an errored instance may start a fresh pipeline.
    /// `terminated` is final and only reachable from `ready` or `error`.
    pub fn can_transition_to(&self, to: InstanceStatus) -> bool {
        use InstanceStatus::*;
        match (self, to) {
            (Terminated, _) => false,
            (_, Error) => true,
            (Pending, Provisioning) => true,
            (Provisioning, Configuring) | (Provisioning, Ready) => true,
            (Configuring, Ready) => true,
            (Ready, Configuring) => true,
            (Ready, Terminated) | (Error, Terminated) => true,
            (Error, Provisioning) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type, utoipa::ToSchema,
)]
#[sqlx(type_name = "provider_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Hetzner,
    Scaleway,
    Macos,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [
        ProviderKind::Hetzner,
        ProviderKind::Scaleway,
        ProviderKind::Macos,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Hetzner => "hetzner",
            ProviderKind::Scaleway => "scaleway",
            ProviderKind::Macos => "macos",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hetzner" => Some(ProviderKind::Hetzner),
            "scaleway" => Some(ProviderKind::Scaleway),
            "macos" => Some(ProviderKind::Macos),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Creating,
    Running,
    Stopped,
    Error,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Creating => "creating",
            ServerStatus::Running => "running",
            ServerStatus::Stopped => "stopped",
            ServerStatus::Error => "error",
        }
    }
}

// --- Provider-side values ---

#[derive(Clone, PartialEq, Eq)]
pub enum ServerSecret {
    Password(String),
    PrivateKey(String),
}

impl std::fmt::Debug for ServerSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerSecret::Password(_) => f.write_str("Password(***)"),
            ServerSecret::PrivateKey(_) => f.write_str("PrivateKey(***)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCredentials {
    pub username: String,
    pub secret: ServerSecret,
}

/// Provider-returned view of one virtual machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub id: String,
    pub name: String,
    pub ip: Option<String>,
    pub status: ServerStatus,
    pub credentials: Option<ServerCredentials>,
}

impl ServerInfo {
    /// IP without any CIDR suffix (some APIs return "1.2.3.4/32").
    pub fn clean_ip(&self) -> Option<&str> {
        self.ip
            .as_deref()
            .map(|ip| ip.split('/').next().unwrap_or(ip).trim())
            .filter(|ip| !ip.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub id: String,
    #[serde(skip_serializing)]
    pub token: String,
    pub hostname: String,
    pub dns_record_id: Option<String>,
}

// --- Entities (SQLx Mapped) ---

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct Instance {
    pub id: Uuid,
    pub status: InstanceStatus,
    pub provider: Option<ProviderKind>,
    pub plan_id: Option<String>,
    pub owner_email: String,
    pub owner_name: Option<String>,

    pub server_id: Option<String>,
    pub server_ip: Option<String>,
    pub tunnel_id: Option<String>,
    pub tunnel_url: Option<String>,
    pub terminal_url: Option<String>,

    #[serde(skip_serializing)]
    pub config: Option<serde_json::Value>,
    pub error_message: Option<String>,

    pub created_at: DateTime<Utc>,
    pub provisioned_at: Option<DateTime<Utc>>,
    pub ready_at: Option<DateTime<Utc>>,
    pub terminated_at: Option<DateTime<Utc>>,
}

impl Instance {
    pub fn new_pending(id: Uuid, owner_email: &str, owner_name: Option<&str>) -> Self {
        Self {
            id,
            status: InstanceStatus::Pending,
            provider: None,
            plan_id: None,
            owner_email: owner_email.to_string(),
            owner_name: owner_name.map(|s| s.to_string()),
            server_id: None,
            server_ip: None,
            tunnel_id: None,
            tunnel_url: None,
            terminal_url: None,
            config: None,
            error_message: None,
            created_at: Utc::now(),
            provisioned_at: None,
            ready_at: None,
            terminated_at: None,
        }
    }
}

/// Connection metadata written once the server is reachable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerMetadata {
    pub provider: Option<ProviderKind>,
    pub server_id: Option<String>,
    pub server_ip: Option<String>,
    pub tunnel_id: Option<String>,
    pub tunnel_url: Option<String>,
    pub terminal_url: Option<String>,
}
