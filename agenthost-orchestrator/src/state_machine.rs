use agenthost_common::{InstanceStatus, ProviderKind, ServerMetadata};
use anyhow::Result;
use uuid::Uuid;

use crate::store::{InstanceStore, Transition, TransitionOutcome};

/// Apply one transition. Returns `false` (and logs) when the current status
/// does not allow the edge or the instance is unknown.
pub async fn apply(store: &dyn InstanceStore, instance_id: Uuid, t: Transition) -> Result<bool> {
    match store.transition(instance_id, &t).await? {
        TransitionOutcome::Applied { from } => {
            tracing::info!(
                "[state_machine] {} {} -> {} ({})",
                instance_id,
                from,
                t.to,
                t.reason
            );
            Ok(true)
        }
        TransitionOutcome::Rejected { current } => {
            tracing::warn!(
                "[state_machine] {} rejected {} -> {} ({})",
                instance_id,
                current,
                t.to,
                t.reason
            );
            Ok(false)
        }
        TransitionOutcome::Missing => {
            tracing::warn!(
                "[state_machine] {} not found for -> {} ({})",
                instance_id,
                t.to,
                t.reason
            );
            Ok(false)
        }
    }
}

/// PENDING/ERROR -> PROVISIONING. Clears any previous error.
pub async fn start_provisioning(
    store: &dyn InstanceStore,
    instance_id: Uuid,
    plan_id: &str,
    provider: ProviderKind,
    config: Option<serde_json::Value>,
) -> Result<bool> {
    apply(
        store,
        instance_id,
        Transition::to(InstanceStatus::Provisioning, "provision accepted")
            .plan(plan_id, provider)
            .config(config)
            .clear_error(),
    )
    .await
}

/// PROVISIONING -> READY with connection metadata.
pub async fn provisioning_to_ready(
    store: &dyn InstanceStore,
    instance_id: Uuid,
    metadata: ServerMetadata,
) -> Result<bool> {
    apply(
        store,
        instance_id,
        Transition::to(InstanceStatus::Ready, "server configured").metadata(metadata),
    )
    .await
}

/// PROVISIONING -> CONFIGURING: server is reachable but bring-up
/// configuration failed. Metadata is persisted so a later configure call can
/// reach the server.
pub async fn provisioning_to_configuring(
    store: &dyn InstanceStore,
    instance_id: Uuid,
    metadata: ServerMetadata,
    warning: &str,
) -> Result<bool> {
    apply(
        store,
        instance_id,
        Transition::to(InstanceStatus::Configuring, "remote configuration failed")
            .metadata(metadata)
            .error(warning),
    )
    .await
}

/// READY -> CONFIGURING before pushing a new configuration.
pub async fn ready_to_configuring(store: &dyn InstanceStore, instance_id: Uuid) -> Result<bool> {
    apply(
        store,
        instance_id,
        Transition::to(InstanceStatus::Configuring, "configuration update"),
    )
    .await
}

/// CONFIGURING -> READY after a successful configuration.
pub async fn configuring_to_ready(
    store: &dyn InstanceStore,
    instance_id: Uuid,
    config: Option<serde_json::Value>,
) -> Result<bool> {
    apply(
        store,
        instance_id,
        Transition::to(InstanceStatus::Ready, "configuration applied")
            .config(config)
            .clear_error(),
    )
    .await
}

/// CONFIGURING -> READY after a failed push: the previous configuration is
/// still running, the failure is kept in `error_message`.
pub async fn restore_ready(store: &dyn InstanceStore, instance_id: Uuid, error: &str) -> Result<bool> {
    apply(
        store,
        instance_id,
        Transition::to(InstanceStatus::Ready, "configuration push failed").error(error),
    )
    .await
}

pub async fn mark_error(store: &dyn InstanceStore, instance_id: Uuid, message: &str) -> Result<bool> {
    apply(
        store,
        instance_id,
        Transition::to(InstanceStatus::Error, "pipeline failed").error(message),
    )
    .await
}

/// Mark an instance terminated after its server was deleted.
///
/// `terminated` is only reachable from `ready` or `error`; any other idle
/// status passes through `error` first so the history shows why.
pub async fn mark_terminated(
    store: &dyn InstanceStore,
    instance_id: Uuid,
    current: InstanceStatus,
    reason: &str,
) -> Result<bool> {
    if current == InstanceStatus::Terminated {
        return Ok(true);
    }
    if !current.can_transition_to(InstanceStatus::Terminated) {
        apply(
            store,
            instance_id,
            Transition::to(InstanceStatus::Error, "deprovisioned before ready")
                .error(&format!("deprovisioned while {}", current)),
        )
        .await?;
    }
    apply(
        store,
        instance_id,
        Transition::to(InstanceStatus::Terminated, reason),
    )
    .await
}
