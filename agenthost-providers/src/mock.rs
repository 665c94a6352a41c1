use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use agenthost_common::{
    ProviderKind, ProvisionError, ServerCredentials, ServerInfo, ServerSecret, ServerStatus,
};
use anyhow::Result;
use async_trait::async_trait;

use crate::readiness::{self, ReadinessPolicy};
use crate::{CreateServerOpts, ServerProvider};

struct MockServerState {
    info: ServerInfo,
    /// `get_server` calls left before the server reports `running`.
    polls_until_running: u32,
}

/// In-memory backend for tests and local runs.
///
/// Servers become `running` after a configurable number of polls and always
/// report `ip` as their address, so pointing `ip` + `readiness.ssh_port` at a
/// local listener satisfies the readiness gate.
pub struct MockProvider {
    kind: ProviderKind,
    ip: String,
    polls_until_running: u32,
    create_error: Option<String>,
    readiness: ReadinessPolicy,
    servers: Mutex<HashMap<String, MockServerState>>,
    next_id: AtomicU64,
    created: AtomicUsize,
    deleted: AtomicUsize,
}

impl MockProvider {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            ip: "127.0.0.1".to_string(),
            polls_until_running: 1,
            create_error: None,
            readiness: ReadinessPolicy {
                poll_interval: Duration::from_millis(10),
                max_poll_attempts: 20,
                ssh_port: 22,
                probe_interval: Duration::from_millis(10),
                max_probe_attempts: 10,
                probe_timeout: Duration::from_millis(500),
            },
            servers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            created: AtomicUsize::new(0),
            deleted: AtomicUsize::new(0),
        }
    }

    pub fn with_ip(mut self, ip: &str) -> Self {
        self.ip = ip.to_string();
        self
    }

    pub fn with_ssh_port(mut self, port: u16) -> Self {
        self.readiness.ssh_port = port;
        self
    }

    pub fn with_readiness(mut self, readiness: ReadinessPolicy) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn with_polls_until_running(mut self, polls: u32) -> Self {
        self.polls_until_running = polls;
        self
    }

    pub fn failing_create(mut self, message: &str) -> Self {
        self.create_error = Some(message.to_string());
        self
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn deleted_count(&self) -> usize {
        self.deleted.load(Ordering::SeqCst)
    }

    pub fn live_servers(&self) -> usize {
        self.servers.lock().map(|s| s.len()).unwrap_or(0)
    }

    fn credentials() -> ServerCredentials {
        ServerCredentials {
            username: "root".to_string(),
            secret: ServerSecret::Password("mock-password".to_string()),
        }
    }
}

#[async_trait]
impl ServerProvider for MockProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn create_server(&self, opts: &CreateServerOpts) -> Result<ServerInfo> {
        if let Some(msg) = &self.create_error {
            return Err(ProvisionError::Provider(msg.clone()).into());
        }
        let id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let info = ServerInfo {
            id: id.clone(),
            name: opts.name.clone(),
            ip: Some(self.ip.clone()),
            status: ServerStatus::Creating,
            credentials: Some(Self::credentials()),
        };
        self.servers
            .lock()
            .map_err(|_| anyhow::anyhow!("mock provider state poisoned"))?
            .insert(
                id,
                MockServerState {
                    info: info.clone(),
                    polls_until_running: self.polls_until_running,
                },
            );
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(info)
    }

    async fn wait_for_ready(&self, info: ServerInfo) -> Result<ServerInfo> {
        readiness::wait_for_ready(self, info, &self.readiness).await
    }

    async fn delete_server(&self, server_id: &str) -> Result<()> {
        let removed = self
            .servers
            .lock()
            .map_err(|_| anyhow::anyhow!("mock provider state poisoned"))?
            .remove(server_id);
        if removed.is_some() {
            self.deleted.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn get_server(&self, server_id: &str) -> Result<Option<ServerInfo>> {
        let mut servers = self
            .servers
            .lock()
            .map_err(|_| anyhow::anyhow!("mock provider state poisoned"))?;
        let Some(state) = servers.get_mut(server_id) else {
            return Ok(None);
        };
        if state.polls_until_running > 0 {
            state.polls_until_running -= 1;
        }
        if state.polls_until_running == 0 {
            state.info.status = ServerStatus::Running;
        }
        Ok(Some(state.info.clone()))
    }
}
