//! Provisioning coordinator.
//!
//! Admits provision requests synchronously, then runs the pipeline on a
//! detached task: tunnel, server, readiness gate, remote configuration,
//! metadata, completion. Deprovision and configure run inline on the
//! request.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use agenthost_common::{
    CallbackPayload, Instance, InstanceStatus, JobResult, ProviderKind, ProvisionError,
    ProvisionStep, ServerInfo, ServerMetadata, TunnelConfig,
};
use agenthost_providers::{CreateServerOpts, ProviderRegistry, ServerProvider};
use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::cloud_init::build_cloud_init;
use crate::gateway::{self, GatewayClient};
use crate::logger::ActionLog;
use crate::notifier::Notifier;
use crate::progress::ProgressCache;
use crate::remote::{ConfigureRequest, RemoteConfigurator};
use crate::retry::RetryPolicy;
use crate::state_machine;
use crate::store::InstanceStore;
use crate::tunnel::TunnelService;

#[derive(Debug, Clone, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionRequest {
    pub instance_id: Uuid,
    pub plan_id: String,
    pub customer_email: String,
    pub customer_name: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub config: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeprovisionRequest {
    pub server_id: String,
    pub tunnel_id: Option<String>,
    pub provider: String,
    pub customer_email: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Deprovisioned {
    pub server_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel_id: Option<String>,
}

/// Result of admitting a provision request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accepted { instance_id: Uuid },
    /// Nothing was started; `status` is what the caller should report.
    Rejected {
        status: InstanceStatus,
        message: String,
    },
}

#[derive(Clone)]
pub struct CoordinatorOptions {
    pub terminal_port: u16,
    pub gateway_port: u16,
    pub ssh_public_key: Option<String>,
    pub gateway_retry: RetryPolicy,
    pub gateway_call_timeout: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            terminal_port: 7681,
            gateway_port: 18789,
            ssh_public_key: None,
            gateway_retry: gateway::default_retry_policy(),
            gateway_call_timeout: gateway::CALL_TIMEOUT,
        }
    }
}

pub struct Coordinator {
    store: Arc<dyn InstanceStore>,
    providers: ProviderRegistry,
    tunnels: Option<Arc<dyn TunnelService>>,
    configurator: Arc<RemoteConfigurator>,
    notifier: Arc<Notifier>,
    progress: Arc<ProgressCache>,
    options: CoordinatorOptions,
    in_flight: Mutex<HashSet<Uuid>>,
}

/// Claim on one instance id in the in-flight set, released on drop.
struct InFlight {
    coordinator: Arc<Coordinator>,
    instance_id: Uuid,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.coordinator.in_flight_set().remove(&self.instance_id);
    }
}

/// Everything the detached pipeline needs besides the coordinator.
struct PipelineContext {
    instance_id: Uuid,
    plan_id: String,
    provider: Arc<dyn ServerProvider>,
    request: ConfigureRequest,
}

/// Resources created so far, for rollback.
#[derive(Default)]
struct Created {
    tunnel: Option<TunnelConfig>,
    server_id: Option<String>,
}

struct Completed {
    metadata: ServerMetadata,
    warning: Option<String>,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        providers: ProviderRegistry,
        tunnels: Option<Arc<dyn TunnelService>>,
        configurator: Arc<RemoteConfigurator>,
        notifier: Arc<Notifier>,
        progress: Arc<ProgressCache>,
        options: CoordinatorOptions,
    ) -> Self {
        Self {
            store,
            providers,
            tunnels,
            configurator,
            notifier,
            progress,
            options,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> Arc<dyn InstanceStore> {
        self.store.clone()
    }

    pub fn progress(&self) -> Arc<ProgressCache> {
        self.progress.clone()
    }

    pub fn is_in_flight(&self, instance_id: Uuid) -> bool {
        self.in_flight_set().contains(&instance_id)
    }

    fn in_flight_set(&self) -> MutexGuard<'_, HashSet<Uuid>> {
        // The set stays consistent even if a holder panicked.
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn claim(self: &Arc<Self>, instance_id: Uuid) -> Option<InFlight> {
        if !self.in_flight_set().insert(instance_id) {
            return None;
        }
        Some(InFlight {
            coordinator: self.clone(),
            instance_id,
        })
    }

    // --- provision ---

    /// Admit a provision request and start its pipeline in the background.
    ///
    /// Unknown plans and unconfigured backends fail here, before anything is
    /// persisted or created.
    pub async fn provision(self: &Arc<Self>, req: ProvisionRequest) -> Result<Admission> {
        let provider = self.providers.for_plan(&req.plan_id)?;
        let id = req.instance_id;

        let Some(claim) = self.claim(id) else {
            let status = self
                .store
                .get(id)
                .await?
                .map(|i| i.status)
                .unwrap_or(InstanceStatus::Provisioning);
            return Ok(Admission::Rejected {
                status,
                message: format!("a pipeline for instance {} is already running", id),
            });
        };

        let pending = Instance::new_pending(id, &req.customer_email, req.customer_name.as_deref());
        self.store.insert_if_absent(&pending).await?;
        let instance = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| ProvisionError::NotFound(format!("instance {}", id)))?;

        if instance.status.is_in_flight() {
            return Ok(Admission::Rejected {
                status: instance.status,
                message: format!("instance {} is already {}", id, instance.status),
            });
        }
        if let Some(other) = self.store.find_active_for_owner(&req.customer_email).await? {
            if other.id != id {
                return Ok(Admission::Rejected {
                    status: other.status,
                    message: format!(
                        "owner already has instance {} {}",
                        other.id, other.status
                    ),
                });
            }
        }
        if !instance.status.can_transition_to(InstanceStatus::Provisioning) {
            return Ok(Admission::Rejected {
                status: instance.status,
                message: format!("instance {} is {} and cannot be provisioned", id, instance.status),
            });
        }

        let config = req.config.clone();
        if !state_machine::start_provisioning(
            self.store.as_ref(),
            id,
            &req.plan_id,
            provider.kind(),
            config.clone(),
        )
        .await?
        {
            let status = self
                .store
                .get(id)
                .await?
                .map(|i| i.status)
                .unwrap_or(instance.status);
            return Ok(Admission::Rejected {
                status,
                message: format!("instance {} changed state concurrently", id),
            });
        }

        self.progress.start(id).await;
        tracing::info!(
            "[coordinator] provision accepted: instance={} plan={} provider={}",
            id,
            req.plan_id,
            provider.kind()
        );

        let ctx = PipelineContext {
            instance_id: id,
            plan_id: req.plan_id.clone(),
            provider,
            request: ConfigureRequest {
                instance_id: id,
                owner_email: req.customer_email.clone(),
                owner_name: req.customer_name.clone(),
                plan_id: req.plan_id,
                config,
            },
        };
        let this = self.clone();
        tokio::spawn(async move {
            let worker = this.clone();
            let joined = tokio::spawn(async move { worker.run_pipeline(ctx).await }).await;
            if let Err(e) = joined {
                let message = format!("provisioning pipeline aborted: {}", e);
                tracing::error!("[coordinator] instance {}: {}", id, message);
                if let Err(e) = state_machine::mark_error(this.store.as_ref(), id, &message).await {
                    tracing::error!("[coordinator] failed to mark {} error: {}", id, e);
                }
                this.progress
                    .finish(id, JobResult::Error { message: message.clone() })
                    .await;
                this.notifier
                    .completion(&CallbackPayload::error(id, &message))
                    .await;
                this.notifier.alert(id, &message).await;
            }
            drop(claim);
        });

        Ok(Admission::Accepted { instance_id: id })
    }

    async fn run_pipeline(self: Arc<Self>, ctx: PipelineContext) {
        let id = ctx.instance_id;
        let log = ActionLog::start(
            self.store.as_ref(),
            "PROVISION",
            Some(id),
            Some(json!({ "plan_id": ctx.plan_id, "provider": ctx.provider.kind() })),
        )
        .await;

        let mut created = Created::default();
        match self.execute(&ctx, &mut created).await {
            Ok(done) => {
                log.success(self.store.as_ref()).await;
                self.progress
                    .finish(
                        id,
                        JobResult::Ready {
                            terminal_url: done.metadata.terminal_url.clone(),
                            instance_url: done.metadata.tunnel_url.clone(),
                            warning: done.warning.clone(),
                        },
                    )
                    .await;
                if let Some(w) = &done.warning {
                    tracing::warn!(
                        "[coordinator] instance {} is up but not configured: {}",
                        id,
                        w
                    );
                }
                self.notifier
                    .completion(&CallbackPayload::ready(id, &done.metadata))
                    .await;
            }
            Err(e) => {
                let message = e.to_string();
                log.failed(self.store.as_ref(), &message).await;
                self.fail(&ctx, created, &message).await;
            }
        }
    }

    async fn execute(&self, ctx: &PipelineContext, created: &mut Created) -> Result<Completed> {
        let id = ctx.instance_id;
        ctx.provider.ensure_available()?;

        let name = server_name(&ctx.plan_id, Utc::now().timestamp_millis());
        if let Some(tunnels) = &self.tunnels {
            self.progress.advance(id, ProvisionStep::CreatingTunnel).await;
            created.tunnel = Some(tunnels.create_tunnel(&name).await?);
        }

        self.progress.advance(id, ProvisionStep::CreatingServer).await;
        let tunnel = created.tunnel.clone();
        let opts = CreateServerOpts {
            name: name.clone(),
            plan_id: ctx.plan_id.clone(),
            user_data: Some(build_cloud_init(
                self.options.ssh_public_key.as_deref(),
                tunnel.as_ref().map(|t| t.token.as_str()),
            )),
            tunnel_token: tunnel.as_ref().map(|t| t.token.clone()),
            tunnel_hostname: tunnel.as_ref().map(|t| t.hostname.clone()),
            labels: HashMap::from([
                ("managed-by".to_string(), "agenthost".to_string()),
                ("instance-id".to_string(), id.to_string()),
            ]),
        };
        let server = ctx.provider.create_server(&opts).await?;
        created.server_id = Some(server.id.clone());
        tracing::info!(
            "[coordinator] instance {}: server {} ({}) created",
            id,
            server.id,
            name
        );

        self.progress.advance(id, ProvisionStep::WaitingForServer).await;
        let server = ctx.provider.wait_for_ready(server).await?;

        self.progress.advance(id, ProvisionStep::Configuring).await;
        let outcome = self.configurator.configure(&server, &ctx.request).await;

        self.progress.advance(id, ProvisionStep::Finalizing).await;
        let metadata = self.metadata_for(ctx.provider.kind(), &server, tunnel.as_ref());
        let applied = match &outcome.error {
            None => {
                state_machine::provisioning_to_ready(self.store.as_ref(), id, metadata.clone())
                    .await?
            }
            Some(warning) => {
                state_machine::provisioning_to_configuring(
                    self.store.as_ref(),
                    id,
                    metadata.clone(),
                    warning,
                )
                .await?
            }
        };
        if !applied {
            return Err(ProvisionError::Conflict(format!(
                "instance {} left provisioning before the pipeline finished",
                id
            ))
            .into());
        }

        Ok(Completed {
            metadata,
            warning: outcome.error,
        })
    }

    fn metadata_for(
        &self,
        kind: ProviderKind,
        server: &ServerInfo,
        tunnel: Option<&TunnelConfig>,
    ) -> ServerMetadata {
        let ip = server.clean_ip().map(str::to_string);
        ServerMetadata {
            provider: Some(kind),
            server_id: Some(server.id.clone()),
            terminal_url: terminal_url(
                tunnel.map(|t| t.hostname.as_str()),
                ip.as_deref(),
                self.options.terminal_port,
            ),
            server_ip: ip,
            tunnel_id: tunnel.map(|t| t.id.clone()),
            tunnel_url: tunnel.map(|t| format!("https://{}", t.hostname)),
        }
    }

    /// Record the failure, roll back what was created, report it.
    async fn fail(&self, ctx: &PipelineContext, created: Created, message: &str) {
        let id = ctx.instance_id;
        tracing::error!("[coordinator] provisioning {} failed: {}", id, message);

        if let Err(e) = state_machine::mark_error(self.store.as_ref(), id, message).await {
            tracing::error!("[coordinator] failed to mark {} error: {}", id, e);
        }
        if let (Some(tunnel), Some(tunnels)) = (&created.tunnel, &self.tunnels) {
            if let Err(e) = tunnels
                .delete_tunnel(&tunnel.id, tunnel.dns_record_id.as_deref())
                .await
            {
                tracing::warn!(
                    "[coordinator] cleanup: tunnel {} not deleted: {}",
                    tunnel.id,
                    e
                );
            }
        }
        if let Some(server_id) = &created.server_id {
            if let Err(e) = ctx.provider.delete_server(server_id).await {
                tracing::warn!(
                    "[coordinator] cleanup: server {} not deleted: {}",
                    server_id,
                    e
                );
            }
        }

        self.progress
            .finish(
                id,
                JobResult::Error {
                    message: message.to_string(),
                },
            )
            .await;
        self.notifier
            .completion(&CallbackPayload::error(id, message))
            .await;
        self.notifier.alert(id, message).await;
    }

    // --- deprovision ---

    pub async fn deprovision(self: &Arc<Self>, req: DeprovisionRequest) -> Result<Deprovisioned> {
        let kind = ProviderKind::parse(&req.provider).ok_or_else(|| {
            ProvisionError::Configuration(format!("unknown provider '{}'", req.provider))
        })?;
        let provider = self.providers.get(kind)?;

        let instance = self.store.find_by_server_id(&req.server_id).await?;
        let _claim = match &instance {
            Some(inst) => Some(self.claim(inst.id).ok_or_else(|| {
                ProvisionError::Conflict(format!(
                    "a pipeline for instance {} is in flight",
                    inst.id
                ))
            })?),
            None => None,
        };
        if let Some(inst) = &instance {
            if !inst.owner_email.eq_ignore_ascii_case(&req.customer_email) {
                tracing::warn!(
                    "[coordinator] deprovision of {} requested for {} but owned by {}",
                    req.server_id,
                    req.customer_email,
                    inst.owner_email
                );
            }
        }

        let log = ActionLog::start(
            self.store.as_ref(),
            "DEPROVISION",
            instance.as_ref().map(|i| i.id),
            Some(json!({ "server_id": req.server_id, "provider": kind, "reason": req.reason })),
        )
        .await;

        if let Err(e) = provider.delete_server(&req.server_id).await {
            log.failed(self.store.as_ref(), &e.to_string()).await;
            return Err(e);
        }
        tracing::info!("[coordinator] server {} deleted ({})", req.server_id, kind);

        let tunnel_id = req
            .tunnel_id
            .clone()
            .or_else(|| instance.as_ref().and_then(|i| i.tunnel_id.clone()));
        if let Some(tunnel_id) = &tunnel_id {
            match &self.tunnels {
                Some(tunnels) => {
                    if let Err(e) = tunnels.delete_tunnel(tunnel_id, None).await {
                        tracing::warn!(
                            "[coordinator] tunnel {} not deleted: {}",
                            tunnel_id,
                            e
                        );
                    }
                }
                None => tracing::warn!(
                    "[coordinator] tunnel {} left in place: no tunnel backend configured",
                    tunnel_id
                ),
            }
        }

        if let Some(inst) = &instance {
            let reason = req.reason.as_deref().unwrap_or("deprovisioned");
            if let Err(e) =
                state_machine::mark_terminated(self.store.as_ref(), inst.id, inst.status, reason).await
            {
                tracing::error!("[coordinator] failed to mark {} terminated: {}", inst.id, e);
            }
            self.progress.remove(inst.id).await;
        }
        log.success(self.store.as_ref()).await;

        Ok(Deprovisioned {
            server_id: req.server_id,
            tunnel_id,
        })
    }

    // --- configure ---

    /// Push a new configuration to a `ready` instance, or retry bring-up
    /// configuration of a `configuring` one.
    pub async fn configure(self: &Arc<Self>, instance_id: Uuid, config: Value) -> Result<InstanceStatus> {
        let instance = self
            .store
            .get(instance_id)
            .await?
            .ok_or_else(|| ProvisionError::NotFound(format!("instance {}", instance_id)))?;
        let _claim = self.claim(instance_id).ok_or_else(|| {
            ProvisionError::Conflict(format!(
                "a pipeline for instance {} is in flight",
                instance_id
            ))
        })?;

        let log = ActionLog::start(
            self.store.as_ref(),
            "CONFIGURE",
            Some(instance_id),
            Some(json!({ "from": instance.status })),
        )
        .await;
        let res = match instance.status {
            InstanceStatus::Ready => self.push_config(&instance, config).await,
            InstanceStatus::Configuring => self.retry_bring_up(&instance, config).await,
            other => Err(ProvisionError::Conflict(format!(
                "instance {} is {}; only ready or configuring instances accept configuration",
                instance_id, other
            ))
            .into()),
        };
        match &res {
            Ok(_) => log.success(self.store.as_ref()).await,
            Err(e) => log.failed(self.store.as_ref(), &e.to_string()).await,
        }
        // The bring-up job result is stale now; status reads fall back to
        // the record.
        self.progress.remove(instance_id).await;
        res
    }

    async fn push_config(&self, instance: &Instance, config: Value) -> Result<InstanceStatus> {
        let host = instance
            .tunnel_url
            .as_deref()
            .map(|u| u.trim_start_matches("https://"));
        let endpoint = gateway::gateway_endpoint(
            host,
            instance.server_ip.as_deref(),
            self.options.gateway_port,
        )
        .ok_or_else(|| {
            ProvisionError::Configuration(format!(
                "instance {} has no tunnel or server address",
                instance.id
            ))
        })?;
        let merged = merge_config(instance.config.clone(), &config);
        let token = merged
            .pointer("/gateway/token")
            .and_then(Value::as_str)
            .map(str::to_string);

        if !state_machine::ready_to_configuring(self.store.as_ref(), instance.id).await? {
            return Err(ProvisionError::Conflict(format!(
                "instance {} changed state concurrently",
                instance.id
            ))
            .into());
        }

        let client = GatewayClient::new(&endpoint, token)
            .with_retry(self.options.gateway_retry.clone())
            .with_call_timeout(self.options.gateway_call_timeout);
        match push_via_gateway(&client, &config).await {
            Ok(()) => {
                state_machine::configuring_to_ready(self.store.as_ref(), instance.id, Some(merged))
                    .await?;
                Ok(InstanceStatus::Ready)
            }
            Err(e) => {
                state_machine::restore_ready(self.store.as_ref(), instance.id, &e.to_string())
                    .await?;
                Err(e)
            }
        }
    }

    async fn retry_bring_up(&self, instance: &Instance, config: Value) -> Result<InstanceStatus> {
        let kind = instance.provider.ok_or_else(|| {
            ProvisionError::Configuration(format!("instance {} has no provider", instance.id))
        })?;
        let server_id = instance.server_id.as_deref().ok_or_else(|| {
            ProvisionError::Configuration(format!("instance {} has no server", instance.id))
        })?;
        let provider = self.providers.get(kind)?;
        let server = provider
            .get_server(server_id)
            .await?
            .ok_or_else(|| ProvisionError::NotFound(format!("server {}", server_id)))?;

        let merged = merge_config(instance.config.clone(), &config);
        let request = ConfigureRequest {
            instance_id: instance.id,
            owner_email: instance.owner_email.clone(),
            owner_name: instance.owner_name.clone(),
            plan_id: instance.plan_id.clone().unwrap_or_default(),
            config: Some(merged.clone()),
        };
        let outcome = self.configurator.configure(&server, &request).await;
        if let Some(err) = outcome.error {
            self.store.record_error(instance.id, &err).await?;
            return Err(ProvisionError::Provider(format!("remote configuration failed: {}", err)).into());
        }
        state_machine::configuring_to_ready(self.store.as_ref(), instance.id, Some(merged)).await?;
        Ok(InstanceStatus::Ready)
    }
}

async fn push_via_gateway(client: &GatewayClient, config: &Value) -> Result<()> {
    let mut patch = config.clone();
    let env = patch.as_object_mut().and_then(|o| o.remove("env"));
    client.patch_config(patch).await?;
    if let Some(env) = env.filter(|e| !e.is_null()) {
        client.set_env(env).await?;
    }
    client.apply_config().await?;
    Ok(())
}

/// JSON merge patch: objects merge recursively, `null` removes a key, any
/// other value replaces.
pub fn merge_config(base: Option<Value>, patch: &Value) -> Value {
    let mut base = base.unwrap_or(Value::Null);
    merge_into(&mut base, patch);
    base
}

fn merge_into(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    if let Value::Object(target_map) = target {
        for (k, v) in patch_map {
            if v.is_null() {
                target_map.remove(k);
            } else {
                merge_into(target_map.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
    }
}

/// `<plan>-<unix millis>`, lowercased, non-alphanumerics replaced by `-`.
pub fn server_name(plan_id: &str, unix_millis: i64) -> String {
    format!("{}-{}", plan_id, unix_millis)
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

pub fn terminal_url(tunnel_hostname: Option<&str>, ip: Option<&str>, port: u16) -> Option<String> {
    match (tunnel_hostname, ip) {
        (Some(host), _) => Some(format!("https://{}", host)),
        (None, Some(ip)) => Some(format!("http://{}:{}", ip, port)),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{CommandOutput, ConfiguratorOptions, RemoteShell, ShellConnector};
    use crate::store::MemoryInstanceStore;
    use agenthost_providers::mock::MockProvider;
    use agenthost_providers::unimplemented::UnimplementedProvider;
    use async_trait::async_trait;
    use tokio::net::TcpListener;

    struct OkShell;

    #[async_trait]
    impl RemoteShell for OkShell {
        async fn run(&mut self, _script: &str, _timeout: Duration) -> Result<CommandOutput> {
            Ok(CommandOutput {
                success: true,
                exit_code: Some(0),
                stdout: String::new(),
                stderr: String::new(),
            })
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct OkConnector;

    #[async_trait]
    impl ShellConnector for OkConnector {
        async fn connect(&self, _server: &ServerInfo) -> Result<Box<dyn RemoteShell>> {
            Ok(Box::new(OkShell))
        }
    }

    struct Harness {
        coordinator: Arc<Coordinator>,
        store: Arc<MemoryInstanceStore>,
        provider: Arc<MockProvider>,
        _ssh: TcpListener,
    }

    async fn harness() -> Harness {
        let ssh = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = ssh.local_addr().unwrap().port();
        let provider = Arc::new(MockProvider::new(ProviderKind::Hetzner).with_ssh_port(port));
        let store = Arc::new(MemoryInstanceStore::new());
        let registry = ProviderRegistry::new()
            .with(provider.clone())
            .with(Arc::new(UnimplementedProvider::new(ProviderKind::Macos)));
        let configurator = RemoteConfigurator::new(
            Arc::new(OkConnector),
            ConfiguratorOptions {
                bootstrap_port: port,
                bootstrap_attempts: 3,
                bootstrap_interval: Duration::from_millis(10),
                probe_timeout: Duration::from_millis(500),
                ..Default::default()
            },
        );
        let coordinator = Arc::new(Coordinator::new(
            store.clone(),
            registry,
            None,
            Arc::new(configurator),
            Arc::new(Notifier::disabled().unwrap()),
            Arc::new(ProgressCache::new(Duration::from_secs(60), 16)),
            CoordinatorOptions {
                gateway_retry: RetryPolicy::none(),
                gateway_call_timeout: Duration::from_secs(1),
                ..Default::default()
            },
        ));
        Harness {
            coordinator,
            store,
            provider,
            _ssh: ssh,
        }
    }

    fn request(plan: &str) -> ProvisionRequest {
        ProvisionRequest {
            instance_id: Uuid::new_v4(),
            plan_id: plan.to_string(),
            customer_email: format!("{}@example.com", Uuid::new_v4()),
            customer_name: Some("Ada".into()),
            config: None,
        }
    }

    async fn settle(h: &Harness, id: Uuid) -> Instance {
        for _ in 0..200 {
            if !h.coordinator.is_in_flight(id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        h.store.get(id).await.unwrap().unwrap()
    }

    #[test]
    fn server_name_is_dns_safe() {
        assert_eq!(server_name("macos-m1", 1700000000000), "macos-m1-1700000000000");
        assert_eq!(server_name("Linux_XL", 5), "linux-xl-5");
    }

    #[test]
    fn terminal_url_prefers_tunnel() {
        assert_eq!(
            terminal_url(Some("a.example.com"), Some("1.2.3.4"), 7681).as_deref(),
            Some("https://a.example.com")
        );
        assert_eq!(
            terminal_url(None, Some("1.2.3.4"), 7681).as_deref(),
            Some("http://1.2.3.4:7681")
        );
        assert_eq!(terminal_url(None, None, 7681), None);
    }

    #[test]
    fn merge_patch_semantics() {
        let base = json!({"model": "a", "gateway": {"token": "t", "port": 1}, "drop": true});
        let merged = merge_config(
            Some(base),
            &json!({"model": "b", "gateway": {"port": 2}, "drop": null}),
        );
        assert_eq!(merged, json!({"model": "b", "gateway": {"token": "t", "port": 2}}));
        assert_eq!(merge_config(None, &json!({"a": 1})), json!({"a": 1}));
    }

    #[tokio::test]
    async fn unknown_plan_is_rejected_before_any_side_effect() {
        let h = harness().await;
        let req = request("windows-xl");
        let id = req.instance_id;
        let err = h.coordinator.provision(req).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProvisionError>(),
            Some(ProvisionError::Configuration(_))
        ));
        assert!(h.store.get(id).await.unwrap().is_none());
        assert_eq!(h.provider.created_count(), 0);
    }

    #[tokio::test]
    async fn linux_without_tunnel_reaches_ready() {
        let h = harness().await;
        let req = request("linux");
        let id = req.instance_id;
        assert_eq!(
            h.coordinator.provision(req).await.unwrap(),
            Admission::Accepted { instance_id: id }
        );

        let inst = settle(&h, id).await;
        assert_eq!(inst.status, InstanceStatus::Ready);
        assert_eq!(inst.provider, Some(ProviderKind::Hetzner));
        assert_eq!(inst.server_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(inst.terminal_url.as_deref(), Some("http://127.0.0.1:7681"));
        assert_eq!(h.provider.live_servers(), 1);

        let job = h.coordinator.progress().get(id).await.unwrap();
        assert_eq!(job.progress, 100);
    }

    #[tokio::test]
    async fn create_failure_marks_error_and_cleans_up() {
        let h = harness().await;
        let failing = Arc::new(MockProvider::new(ProviderKind::Hetzner).failing_create("quota exceeded"));
        let coordinator = Arc::new(Coordinator::new(
            h.store.clone(),
            ProviderRegistry::new().with(failing.clone()),
            None,
            h.coordinator.configurator.clone(),
            Arc::new(Notifier::disabled().unwrap()),
            h.coordinator.progress(),
            CoordinatorOptions::default(),
        ));
        let req = request("linux");
        let id = req.instance_id;
        coordinator.provision(req).await.unwrap();
        for _ in 0..200 {
            if !coordinator.is_in_flight(id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let inst = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(inst.status, InstanceStatus::Error);
        assert_eq!(
            inst.error_message.as_deref(),
            Some("provider error: quota exceeded")
        );
        assert_eq!(failing.live_servers(), 0);
        let actions = h.store.actions().await;
        assert!(actions
            .iter()
            .any(|a| a.action_type == "PROVISION" && a.status == "failed"));
    }

    #[tokio::test]
    async fn second_request_for_running_instance_is_rejected() {
        let h = harness().await;
        let req = request("linux");
        let id = req.instance_id;
        h.coordinator.provision(req.clone()).await.unwrap();

        match h.coordinator.provision(req).await.unwrap() {
            Admission::Rejected { status, .. } => assert_eq!(status, InstanceStatus::Provisioning),
            other => panic!("duplicate admitted: {:?}", other),
        }
        settle(&h, id).await;
        assert_eq!(h.provider.created_count(), 1);
    }

    #[tokio::test]
    async fn ready_instance_cannot_be_provisioned_again() {
        let h = harness().await;
        let req = request("linux");
        let id = req.instance_id;
        h.coordinator.provision(req.clone()).await.unwrap();
        settle(&h, id).await;

        match h.coordinator.provision(req).await.unwrap() {
            Admission::Rejected { status, .. } => assert_eq!(status, InstanceStatus::Ready),
            other => panic!("re-provision admitted: {:?}", other),
        }
        assert_eq!(h.provider.created_count(), 1);
    }

    #[tokio::test]
    async fn deprovision_terminates_and_tolerates_unknown_servers() {
        let h = harness().await;
        let req = request("linux");
        let id = req.instance_id;
        let email = req.customer_email.clone();
        h.coordinator.provision(req).await.unwrap();
        let inst = settle(&h, id).await;
        let server_id = inst.server_id.clone().unwrap();

        let out = h
            .coordinator
            .deprovision(DeprovisionRequest {
                server_id: server_id.clone(),
                tunnel_id: None,
                provider: "hetzner".into(),
                customer_email: email.clone(),
                reason: Some("subscription cancelled".into()),
            })
            .await
            .unwrap();
        assert_eq!(out.server_id, server_id);
        assert_eq!(
            h.store.get(id).await.unwrap().unwrap().status,
            InstanceStatus::Terminated
        );
        assert_eq!(h.provider.live_servers(), 0);

        // Already gone at the backend: still a success.
        h.coordinator
            .deprovision(DeprovisionRequest {
                server_id: "mock-404".into(),
                tunnel_id: None,
                provider: "hetzner".into(),
                customer_email: email,
                reason: None,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn deprovision_with_unknown_provider_is_configuration_error() {
        let h = harness().await;
        let err = h
            .coordinator
            .deprovision(DeprovisionRequest {
                server_id: "1".into(),
                tunnel_id: None,
                provider: "azure".into(),
                customer_email: "a@example.com".into(),
                reason: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProvisionError>(),
            Some(ProvisionError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn failed_push_restores_ready_with_error() {
        let h = harness().await;
        let req = request("linux");
        let id = req.instance_id;
        h.coordinator.provision(req).await.unwrap();
        settle(&h, id).await;

        // Nothing listens on the gateway port of 127.0.0.1 in this test.
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let gateway_port = unused.local_addr().unwrap().port();
        drop(unused);
        let coordinator = Arc::new(Coordinator::new(
            h.store.clone(),
            ProviderRegistry::new().with(h.provider.clone()),
            None,
            h.coordinator.configurator.clone(),
            Arc::new(Notifier::disabled().unwrap()),
            h.coordinator.progress(),
            CoordinatorOptions {
                gateway_port,
                gateway_retry: RetryPolicy::none(),
                gateway_call_timeout: Duration::from_secs(1),
                ..Default::default()
            },
        ));

        assert!(coordinator
            .configure(id, json!({"model": "b"}))
            .await
            .is_err());
        let inst = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(inst.status, InstanceStatus::Ready);
        assert!(inst.error_message.is_some());
        assert_eq!(
            h.store.history(id).await.last(),
            Some(&(InstanceStatus::Configuring, InstanceStatus::Ready))
        );
    }

    #[tokio::test]
    async fn configure_rejects_idle_states() {
        let h = harness().await;
        let inst = Instance::new_pending(Uuid::new_v4(), "p@example.com", None);
        h.store.insert_if_absent(&inst).await.unwrap();
        let err = h
            .coordinator
            .configure(inst.id, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProvisionError>(),
            Some(ProvisionError::Conflict(_))
        ));

        let err = h
            .coordinator
            .configure(Uuid::new_v4(), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProvisionError>(),
            Some(ProvisionError::NotFound(_))
        ));
    }
}
