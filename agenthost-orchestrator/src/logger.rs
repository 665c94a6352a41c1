use std::time::Instant;

use uuid::Uuid;

use crate::store::{ActionLogEntry, InstanceStore};

/// Timed entry in the orchestrator action log.
///
/// Logging failures are reported through tracing and never abort the
/// action being logged.
pub struct ActionLog {
    id: Uuid,
    action_type: &'static str,
    started: Instant,
}

impl ActionLog {
    pub async fn start(
        store: &dyn InstanceStore,
        action_type: &'static str,
        instance_id: Option<Uuid>,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        let entry = ActionLogEntry {
            id: Uuid::new_v4(),
            action_type: action_type.to_string(),
            status: "in_progress".to_string(),
            instance_id,
            error_message: None,
            metadata,
            duration_ms: None,
        };
        if let Err(e) = store.log_action(&entry).await {
            tracing::warn!("[action_log] failed to log {}: {}", action_type, e);
        } else {
            tracing::debug!("[action_log] {} started ({})", action_type, entry.id);
        }
        Self {
            id: entry.id,
            action_type,
            started: Instant::now(),
        }
    }

    pub async fn success(self, store: &dyn InstanceStore) {
        self.complete(store, "success", None).await
    }

    pub async fn failed(self, store: &dyn InstanceStore, error: &str) {
        self.complete(store, "failed", Some(error)).await
    }

    async fn complete(self, store: &dyn InstanceStore, status: &str, error: Option<&str>) {
        let duration_ms = i32::try_from(self.started.elapsed().as_millis()).unwrap_or(i32::MAX);
        if let Err(e) = store
            .complete_action(self.id, status, duration_ms, error)
            .await
        {
            tracing::warn!(
                "[action_log] failed to complete {} ({}): {}",
                self.action_type,
                self.id,
                e
            );
        }
    }
}
