use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pipeline steps, in execution order.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionStep {
    Queued,
    CreatingTunnel,
    CreatingServer,
    WaitingForServer,
    Configuring,
    Finalizing,
    Done,
    Failed,
}

impl ProvisionStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionStep::Queued => "queued",
            ProvisionStep::CreatingTunnel => "creating_tunnel",
            ProvisionStep::CreatingServer => "creating_server",
            ProvisionStep::WaitingForServer => "waiting_for_server",
            ProvisionStep::Configuring => "configuring",
            ProvisionStep::Finalizing => "finalizing",
            ProvisionStep::Done => "done",
            ProvisionStep::Failed => "failed",
        }
    }

    pub fn percent(&self) -> u8 {
        match self {
            ProvisionStep::Queued => 5,
            ProvisionStep::CreatingTunnel => 10,
            ProvisionStep::CreatingServer => 25,
            ProvisionStep::WaitingForServer => 40,
            ProvisionStep::Configuring => 70,
            ProvisionStep::Finalizing => 90,
            ProvisionStep::Done => 100,
            ProvisionStep::Failed => 0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum JobResult {
    Ready {
        terminal_url: Option<String>,
        instance_url: Option<String>,
        /// Set when the server is up but bring-up configuration failed.
        warning: Option<String>,
    },
    Error {
        message: String,
    },
}

/// In-memory progress of one provisioning attempt. Never persisted.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ProvisioningJob {
    pub instance_id: Uuid,
    pub step: ProvisionStep,
    pub progress: u8,
    pub result: Option<JobResult>,
    pub updated_at: DateTime<Utc>,
}

impl ProvisioningJob {
    pub fn new(instance_id: Uuid) -> Self {
        Self {
            instance_id,
            step: ProvisionStep::Queued,
            progress: ProvisionStep::Queued.percent(),
            result: None,
            updated_at: Utc::now(),
        }
    }

    pub fn advance(&mut self, step: ProvisionStep) {
        self.step = step;
        self.progress = step.percent();
        self.updated_at = Utc::now();
    }

    pub fn finish(&mut self, result: JobResult) {
        let step = match result {
            JobResult::Ready { .. } => ProvisionStep::Done,
            JobResult::Error { .. } => ProvisionStep::Failed,
        };
        self.advance(step);
        self.result = Some(result);
    }

    pub fn is_finished(&self) -> bool {
        self.result.is_some()
    }
}
