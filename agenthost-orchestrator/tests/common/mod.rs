// Shared fakes for the end-to-end pipeline and HTTP tests.
// Servers come from the mock provider; the remote shell and the tunnel
// backend are in-process fakes that record what they were asked to do.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agenthost_common::{Instance, ProviderKind, ServerInfo, TunnelConfig};
use agenthost_orchestrator::coordinator::{Coordinator, CoordinatorOptions};
use agenthost_orchestrator::notifier::Notifier;
use agenthost_orchestrator::progress::ProgressCache;
use agenthost_orchestrator::remote::{
    CommandOutput, ConfiguratorOptions, RemoteConfigurator, RemoteShell, ShellConnector,
};
use agenthost_orchestrator::retry::RetryPolicy;
use agenthost_orchestrator::store::{InstanceStore, MemoryInstanceStore};
use agenthost_orchestrator::tunnel::{tunnel_hostname, TunnelService};
use agenthost_providers::mock::MockProvider;
use agenthost_providers::unimplemented::UnimplementedProvider;
use agenthost_providers::ProviderRegistry;
use anyhow::Result;
use async_trait::async_trait;
use tokio::net::TcpListener;
use uuid::Uuid;

pub const DOMAIN: &str = "agents.example.com";

/// Records every script; fails `systemctl restart` while `fail_start` is set.
#[derive(Default)]
pub struct FakeHost {
    pub scripts: Mutex<Vec<String>>,
    pub fail_start: AtomicBool,
}

impl FakeHost {
    pub fn failing_start() -> Self {
        let host = Self::default();
        host.fail_start.store(true, Ordering::SeqCst);
        host
    }

    pub fn scripts(&self) -> Vec<String> {
        self.scripts.lock().unwrap().clone()
    }
}

struct FakeShell(Arc<FakeHost>);

#[async_trait]
impl RemoteShell for FakeShell {
    async fn run(&mut self, script: &str, _timeout: Duration) -> Result<CommandOutput> {
        self.0.scripts.lock().unwrap().push(script.to_string());
        let fail = script.contains("systemctl restart") && self.0.fail_start.load(Ordering::SeqCst);
        Ok(CommandOutput {
            success: !fail,
            exit_code: Some(if fail { 3 } else { 0 }),
            stdout: String::new(),
            stderr: if fail {
                "Job for agenthost-agent.service failed".to_string()
            } else {
                String::new()
            },
        })
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct FakeConnector(pub Arc<FakeHost>);

#[async_trait]
impl ShellConnector for FakeConnector {
    async fn connect(&self, _server: &ServerInfo) -> Result<Box<dyn RemoteShell>> {
        Ok(Box::new(FakeShell(self.0.clone())))
    }
}

#[derive(Default)]
pub struct FakeTunnels {
    pub created: Mutex<Vec<TunnelConfig>>,
    pub deleted: Mutex<Vec<String>>,
}

impl FakeTunnels {
    pub fn live(&self) -> usize {
        self.created.lock().unwrap().len() - self.deleted.lock().unwrap().len()
    }
}

#[async_trait]
impl TunnelService for FakeTunnels {
    async fn create_tunnel(&self, name: &str) -> Result<TunnelConfig> {
        let mut created = self.created.lock().unwrap();
        let tunnel = TunnelConfig {
            id: format!("tun-{}", created.len() + 1),
            token: "tunnel-token".to_string(),
            hostname: tunnel_hostname(name, DOMAIN)?,
            dns_record_id: Some(format!("dns-{}", created.len() + 1)),
        };
        created.push(tunnel.clone());
        Ok(tunnel)
    }

    async fn delete_tunnel(&self, tunnel_id: &str, _dns_record_id: Option<&str>) -> Result<()> {
        self.deleted.lock().unwrap().push(tunnel_id.to_string());
        Ok(())
    }
}

pub struct Env {
    pub coordinator: Arc<Coordinator>,
    pub store: Arc<MemoryInstanceStore>,
    pub hetzner: Arc<MockProvider>,
    pub tunnels: Arc<FakeTunnels>,
    pub host: Arc<FakeHost>,
    /// Stands in for sshd on every mock server (they all live on 127.0.0.1).
    pub ssh: TcpListener,
}

impl Env {
    pub async fn new(host: FakeHost, callback_url: Option<String>) -> Self {
        Self::with_hetzner(host, callback_url, |p| p).await
    }

    /// Like `new`, with the mock Hetzner backend adjusted by `tweak`.
    pub async fn with_hetzner(
        host: FakeHost,
        callback_url: Option<String>,
        tweak: impl FnOnce(MockProvider) -> MockProvider,
    ) -> Self {
        let ssh = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = ssh.local_addr().unwrap().port();
        let hetzner = Arc::new(tweak(
            MockProvider::new(ProviderKind::Hetzner).with_ssh_port(port),
        ));
        let store = Arc::new(MemoryInstanceStore::new());
        let tunnels = Arc::new(FakeTunnels::default());
        let host = Arc::new(host);

        let registry = ProviderRegistry::new()
            .with(hetzner.clone())
            .with(Arc::new(UnimplementedProvider::new(ProviderKind::Macos)));
        let configurator = RemoteConfigurator::new(
            Arc::new(FakeConnector(host.clone())),
            ConfiguratorOptions {
                bootstrap_port: port,
                bootstrap_attempts: 5,
                bootstrap_interval: Duration::from_millis(10),
                probe_timeout: Duration::from_millis(500),
                ..Default::default()
            },
        );
        let coordinator = Arc::new(Coordinator::new(
            store.clone(),
            registry,
            Some(tunnels.clone()),
            Arc::new(configurator),
            Arc::new(Notifier::new(callback_url, None, "test-secret".to_string()).unwrap()),
            Arc::new(ProgressCache::new(Duration::from_secs(600), 64)),
            CoordinatorOptions {
                ssh_public_key: Some("ssh-ed25519 AAAA orchestrator".to_string()),
                gateway_retry: RetryPolicy::none(),
                gateway_call_timeout: Duration::from_secs(1),
                ..Default::default()
            },
        ));

        Self {
            coordinator,
            store,
            hetzner,
            tunnels,
            host,
            ssh,
        }
    }

    /// Wait for the background pipeline to release the instance.
    pub async fn settle(&self, id: Uuid) -> Instance {
        for _ in 0..500 {
            if !self.coordinator.is_in_flight(id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.store.get(id).await.unwrap().expect("instance record")
    }
}
