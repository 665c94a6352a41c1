use std::collections::HashMap;
use std::sync::Arc;

use agenthost_common::{ProviderKind, ProvisionError, ServerInfo};
use anyhow::Result;
use async_trait::async_trait;

pub mod readiness;
pub mod unimplemented;

pub use readiness::ReadinessPolicy;

/// Everything a backend needs to create one server.
#[derive(Debug, Clone, Default)]
pub struct CreateServerOpts {
    pub name: String,
    pub plan_id: String,
    /// cloud-init user data (already rendered).
    pub user_data: Option<String>,
    pub tunnel_token: Option<String>,
    pub tunnel_hostname: Option<String>,
    pub labels: HashMap<String, String>,
}

#[async_trait]
pub trait ServerProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Cheap local check run before any resource is created for a plan.
    fn ensure_available(&self) -> Result<(), ProvisionError> {
        Ok(())
    }

    async fn create_server(&self, opts: &CreateServerOpts) -> Result<ServerInfo>;

    /// Block until the readiness gate passes: provider reports `running`
    /// and the remote-shell port accepts TCP connections.
    async fn wait_for_ready(&self, info: ServerInfo) -> Result<ServerInfo>;

    /// Delete a server. Implementations must treat "not found" as success.
    async fn delete_server(&self, server_id: &str) -> Result<()>;

    /// `Ok(None)` when the backend does not know the id.
    async fn get_server(&self, server_id: &str) -> Result<Option<ServerInfo>>;
}

/// Closed set of backends, one adapter per `ProviderKind`.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn ServerProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn ServerProvider>) {
        self.providers.insert(provider.kind(), provider);
    }

    pub fn with(mut self, provider: Arc<dyn ServerProvider>) -> Self {
        self.register(provider);
        self
    }

    /// Adapter for a backend. A kind without a registered adapter means the
    /// orchestrator was started without its credentials.
    pub fn get(&self, kind: ProviderKind) -> Result<Arc<dyn ServerProvider>, ProvisionError> {
        self.providers.get(&kind).cloned().ok_or_else(|| {
            ProvisionError::Configuration(format!("{} provider is not configured", kind))
        })
    }

    /// Resolve the adapter for a plan. Pure lookup; no network calls.
    pub fn for_plan(&self, plan_id: &str) -> Result<Arc<dyn ServerProvider>, ProvisionError> {
        let kind = agenthost_common::provider_for_plan(plan_id)?;
        self.get(kind)
    }

    pub fn kinds(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<ProviderKind> = self.providers.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }
}

/// Shared HTTP client with bounded timeouts.
///
/// Default reqwest client has no overall timeout. If a backend stalls, a
/// pipeline can hang forever.
pub(crate) fn http_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(5))
        .timeout(std::time::Duration::from_secs(20))
        .build()?)
}

#[cfg(feature = "hetzner")]
pub mod hetzner;

#[cfg(feature = "scaleway")]
pub mod scaleway;

#[cfg(feature = "mock")]
pub mod mock;
