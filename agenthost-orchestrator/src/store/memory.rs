use std::collections::HashMap;

use agenthost_common::{Instance, InstanceStatus};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{ActionLogEntry, ErrorMessageUpdate, InstanceStore, Transition, TransitionOutcome};

/// Process-local store for tests and `STORE=memory` runs.
#[derive(Default)]
pub struct MemoryInstanceStore {
    instances: RwLock<HashMap<Uuid, Instance>>,
    history: RwLock<Vec<(Uuid, InstanceStatus, InstanceStatus, String)>>,
    actions: RwLock<Vec<ActionLogEntry>>,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applied transitions for one instance, oldest first.
    pub async fn history(&self, id: Uuid) -> Vec<(InstanceStatus, InstanceStatus)> {
        self.history
            .read()
            .await
            .iter()
            .filter(|(i, ..)| *i == id)
            .map(|(_, from, to, _)| (*from, *to))
            .collect()
    }

    pub async fn actions(&self) -> Vec<ActionLogEntry> {
        self.actions.read().await.clone()
    }
}

#[async_trait]
impl InstanceStore for MemoryInstanceStore {
    async fn get(&self, id: Uuid) -> Result<Option<Instance>> {
        Ok(self.instances.read().await.get(&id).cloned())
    }

    async fn find_by_server_id(&self, server_id: &str) -> Result<Option<Instance>> {
        Ok(self
            .instances
            .read()
            .await
            .values()
            .filter(|i| i.server_id.as_deref() == Some(server_id))
            .filter(|i| i.status != InstanceStatus::Terminated)
            .max_by_key(|i| i.created_at)
            .cloned())
    }

    async fn find_active_for_owner(&self, owner_email: &str) -> Result<Option<Instance>> {
        Ok(self
            .instances
            .read()
            .await
            .values()
            .find(|i| i.owner_email.eq_ignore_ascii_case(owner_email) && i.status.is_in_flight())
            .cloned())
    }

    async fn insert_if_absent(&self, instance: &Instance) -> Result<bool> {
        let mut instances = self.instances.write().await;
        if instances.contains_key(&instance.id) {
            return Ok(false);
        }
        instances.insert(instance.id, instance.clone());
        Ok(true)
    }

    async fn transition(&self, id: Uuid, t: &Transition) -> Result<TransitionOutcome> {
        let mut instances = self.instances.write().await;
        let Some(instance) = instances.get_mut(&id) else {
            return Ok(TransitionOutcome::Missing);
        };
        let from = instance.status;
        if !from.can_transition_to(t.to) {
            return Ok(TransitionOutcome::Rejected { current: from });
        }

        let now = Utc::now();
        instance.status = t.to;
        if let Some(plan_id) = &t.plan_id {
            instance.plan_id = Some(plan_id.clone());
        }
        if let Some(provider) = t.provider {
            instance.provider = Some(provider);
        }
        if let Some(meta) = &t.metadata {
            if meta.provider.is_some() {
                instance.provider = meta.provider;
            }
            if meta.server_id.is_some() {
                instance.server_id = meta.server_id.clone();
                instance.provisioned_at.get_or_insert(now);
            }
            if meta.server_ip.is_some() {
                instance.server_ip = meta.server_ip.clone();
            }
            if meta.tunnel_id.is_some() {
                instance.tunnel_id = meta.tunnel_id.clone();
            }
            if meta.tunnel_url.is_some() {
                instance.tunnel_url = meta.tunnel_url.clone();
            }
            if meta.terminal_url.is_some() {
                instance.terminal_url = meta.terminal_url.clone();
            }
        }
        if t.config.is_some() {
            instance.config = t.config.clone();
        }
        match &t.error_message {
            ErrorMessageUpdate::Keep => {}
            ErrorMessageUpdate::Clear => instance.error_message = None,
            ErrorMessageUpdate::Set(msg) => instance.error_message = Some(msg.clone()),
        }
        match t.to {
            InstanceStatus::Ready => {
                instance.ready_at.get_or_insert(now);
            }
            InstanceStatus::Terminated => instance.terminated_at = Some(now),
            _ => {}
        }
        drop(instances);

        self.history
            .write()
            .await
            .push((id, from, t.to, t.reason.clone()));
        Ok(TransitionOutcome::Applied { from })
    }

    async fn record_error(&self, id: Uuid, message: &str) -> Result<()> {
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(&id)
            .ok_or_else(|| anyhow!("instance {} not found", id))?;
        instance.error_message = Some(message.to_string());
        Ok(())
    }

    async fn log_action(&self, entry: &ActionLogEntry) -> Result<()> {
        self.actions.write().await.push(entry.clone());
        Ok(())
    }

    async fn complete_action(
        &self,
        id: Uuid,
        status: &str,
        duration_ms: i32,
        error_message: Option<&str>,
    ) -> Result<()> {
        let mut actions = self.actions.write().await;
        if let Some(entry) = actions.iter_mut().find(|a| a.id == id) {
            entry.status = status.to_string();
            entry.duration_ms = Some(duration_ms);
            if error_message.is_some() {
                entry.error_message = error_message.map(|s| s.to_string());
            }
        }
        Ok(())
    }
}
