use agenthost_common::{ProviderKind, ProvisionError, ServerInfo};
use anyhow::Result;
use async_trait::async_trait;

use crate::{CreateServerOpts, ServerProvider};

/// Placeholder for a backend that is sold but not built yet.
///
/// Every operation fails with `NotImplemented` so callers can tell
/// "unimplemented" apart from a transient failure.
pub struct UnimplementedProvider {
    kind: ProviderKind,
}

impl UnimplementedProvider {
    pub fn new(kind: ProviderKind) -> Self {
        Self { kind }
    }

    fn fail<T>(&self, op: &str) -> Result<T> {
        tracing::warn!("[{}] {} called on unimplemented provider", self.kind, op);
        Err(ProvisionError::NotImplemented(self.kind.to_string()).into())
    }
}

#[async_trait]
impl ServerProvider for UnimplementedProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn ensure_available(&self) -> Result<(), ProvisionError> {
        Err(ProvisionError::NotImplemented(self.kind.to_string()))
    }

    async fn create_server(&self, _opts: &CreateServerOpts) -> Result<ServerInfo> {
        self.fail("create_server")
    }

    async fn wait_for_ready(&self, _info: ServerInfo) -> Result<ServerInfo> {
        self.fail("wait_for_ready")
    }

    async fn delete_server(&self, _server_id: &str) -> Result<()> {
        self.fail("delete_server")
    }

    async fn get_server(&self, _server_id: &str) -> Result<Option<ServerInfo>> {
        self.fail("get_server")
    }
}
