//! Persistence seam for instance records.
//!
//! The record is the source of truth for lifecycle state. Every status write
//! goes through [`InstanceStore::transition`], which refuses edges that
//! [`InstanceStatus::can_transition_to`] does not allow.

use agenthost_common::{Instance, InstanceStatus, ProviderKind, ServerMetadata};
use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::MemoryInstanceStore;
pub use postgres::PgInstanceStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ErrorMessageUpdate {
    #[default]
    Keep,
    Clear,
    Set(String),
}

/// One requested status change plus the columns written with it.
#[derive(Debug, Clone)]
pub struct Transition {
    pub to: InstanceStatus,
    pub reason: String,
    pub plan_id: Option<String>,
    pub provider: Option<ProviderKind>,
    pub metadata: Option<ServerMetadata>,
    pub config: Option<serde_json::Value>,
    pub error_message: ErrorMessageUpdate,
}

impl Transition {
    pub fn to(status: InstanceStatus, reason: &str) -> Self {
        Self {
            to: status,
            reason: reason.to_string(),
            plan_id: None,
            provider: None,
            metadata: None,
            config: None,
            error_message: ErrorMessageUpdate::Keep,
        }
    }

    pub fn plan(mut self, plan_id: &str, provider: ProviderKind) -> Self {
        self.plan_id = Some(plan_id.to_string());
        self.provider = Some(provider);
        self
    }

    pub fn metadata(mut self, metadata: ServerMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn config(mut self, config: Option<serde_json::Value>) -> Self {
        self.config = config;
        self
    }

    pub fn error(mut self, message: &str) -> Self {
        self.error_message = ErrorMessageUpdate::Set(message.to_string());
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error_message = ErrorMessageUpdate::Clear;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied { from: InstanceStatus },
    /// Current status does not allow the edge; nothing was written.
    Rejected { current: InstanceStatus },
    Missing,
}

/// One row of the orchestrator action log.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionLogEntry {
    pub id: Uuid,
    pub action_type: String,
    pub status: String,
    pub instance_id: Option<Uuid>,
    pub error_message: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub duration_ms: Option<i32>,
}

#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<Instance>>;

    /// Most recent non-terminated instance bound to a provider server id.
    async fn find_by_server_id(&self, server_id: &str) -> Result<Option<Instance>>;

    /// An instance of this owner that is `provisioning` or `configuring`.
    async fn find_active_for_owner(&self, owner_email: &str) -> Result<Option<Instance>>;

    /// Insert a `pending` record unless the id already exists.
    async fn insert_if_absent(&self, instance: &Instance) -> Result<bool>;

    async fn transition(&self, id: Uuid, transition: &Transition) -> Result<TransitionOutcome>;

    /// Record an error message without touching the status.
    async fn record_error(&self, id: Uuid, message: &str) -> Result<()>;

    async fn log_action(&self, entry: &ActionLogEntry) -> Result<()>;

    async fn complete_action(
        &self,
        id: Uuid,
        status: &str,
        duration_ms: i32,
        error_message: Option<&str>,
    ) -> Result<()>;
}
