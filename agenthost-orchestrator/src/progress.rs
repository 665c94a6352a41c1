//! Provisioning progress for pollers.
//!
//! Running pipelines publish into a bounded, TTL-expiring cache. Status reads
//! prefer that cache and fall back to the persisted record once the entry is
//! gone (restart, eviction, expiry).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use agenthost_common::{Instance, InstanceStatus, JobResult, ProvisionStep, ProvisioningJob};
use anyhow::Result;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

use crate::store::InstanceStore;

struct Entry {
    job: ProvisioningJob,
    touched: Instant,
}

pub struct ProgressCache {
    entries: RwLock<HashMap<Uuid, Entry>>,
    ttl: Duration,
    capacity: usize,
}

impl ProgressCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub async fn start(&self, instance_id: Uuid) {
        self.put(ProvisioningJob::new(instance_id)).await;
    }

    pub async fn advance(&self, instance_id: Uuid, step: ProvisionStep) {
        let mut job = self
            .get(instance_id)
            .await
            .unwrap_or_else(|| ProvisioningJob::new(instance_id));
        job.advance(step);
        self.put(job).await;
    }

    pub async fn finish(&self, instance_id: Uuid, result: JobResult) {
        let mut job = self
            .get(instance_id)
            .await
            .unwrap_or_else(|| ProvisioningJob::new(instance_id));
        job.finish(result);
        self.put(job).await;
    }

    pub async fn get(&self, instance_id: Uuid) -> Option<ProvisioningJob> {
        let entries = self.entries.read().await;
        entries
            .get(&instance_id)
            .filter(|e| e.touched.elapsed() < self.ttl)
            .map(|e| e.job.clone())
    }

    pub async fn remove(&self, instance_id: Uuid) {
        self.entries.write().await.remove(&instance_id);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    async fn put(&self, job: ProvisioningJob) {
        let mut entries = self.entries.write().await;
        let ttl = self.ttl;
        entries.retain(|_, e| e.touched.elapsed() < ttl);
        if !entries.contains_key(&job.instance_id) && entries.len() >= self.capacity {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.touched)
                .map(|(id, _)| *id)
            {
                entries.remove(&oldest);
            }
        }
        entries.insert(
            job.instance_id,
            Entry {
                job,
                touched: Instant::now(),
            },
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    pub status: String,
    pub current_step: String,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_url: Option<String>,
}

impl StatusView {
    fn from_job(job: &ProvisioningJob) -> Self {
        match &job.result {
            None => Self {
                status: InstanceStatus::Provisioning.to_string(),
                current_step: job.step.as_str().to_string(),
                progress: job.progress,
                message: None,
                terminal_url: None,
                instance_url: None,
            },
            Some(JobResult::Ready {
                terminal_url,
                instance_url,
                warning,
            }) => Self {
                status: if warning.is_some() {
                    InstanceStatus::Configuring.to_string()
                } else {
                    InstanceStatus::Ready.to_string()
                },
                current_step: job.step.as_str().to_string(),
                progress: job.progress,
                message: warning.clone(),
                terminal_url: terminal_url.clone(),
                instance_url: instance_url.clone(),
            },
            Some(JobResult::Error { message }) => Self {
                status: InstanceStatus::Error.to_string(),
                current_step: job.step.as_str().to_string(),
                progress: job.progress,
                message: Some(message.clone()),
                terminal_url: None,
                instance_url: None,
            },
        }
    }

    fn from_instance(instance: &Instance) -> Self {
        let (step, progress) = match instance.status {
            InstanceStatus::Ready => (ProvisionStep::Done.as_str(), 100),
            InstanceStatus::Error => (ProvisionStep::Failed.as_str(), 0),
            InstanceStatus::Terminated => ("terminated", 0),
            _ => ("in_progress", 50),
        };
        let message = match instance.status {
            InstanceStatus::Error | InstanceStatus::Configuring => instance.error_message.clone(),
            _ => None,
        };
        Self {
            status: instance.status.to_string(),
            current_step: step.to_string(),
            progress,
            message,
            terminal_url: instance.terminal_url.clone(),
            instance_url: instance.tunnel_url.clone(),
        }
    }
}

pub struct StatusBridge {
    cache: Arc<ProgressCache>,
    store: Arc<dyn InstanceStore>,
}

impl StatusBridge {
    pub fn new(cache: Arc<ProgressCache>, store: Arc<dyn InstanceStore>) -> Self {
        Self { cache, store }
    }

    /// `Ok(None)` when neither the cache nor the store knows the instance.
    pub async fn get_status(&self, instance_id: Uuid) -> Result<Option<StatusView>> {
        if let Some(job) = self.cache.get(instance_id).await {
            return Ok(Some(StatusView::from_job(&job)));
        }
        Ok(self
            .store
            .get(instance_id)
            .await?
            .map(|i| StatusView::from_instance(&i)))
    }
}
