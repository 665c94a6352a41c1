use std::time::Duration;

use agenthost_common::CallbackPayload;
use anyhow::Result;
use reqwest::Client;
use serde_json::json;
use uuid::Uuid;

/// Outbound completion callback and admin alerts.
///
/// Both are fire-and-report: a failed delivery is logged, never raised into
/// the pipeline that produced the outcome.
pub struct Notifier {
    client: Client,
    callback_url: Option<String>,
    alert_url: Option<String>,
    shared_secret: String,
}

impl Notifier {
    pub fn new(
        callback_url: Option<String>,
        alert_url: Option<String>,
        shared_secret: String,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            callback_url,
            alert_url,
            shared_secret,
        })
    }

    pub fn disabled() -> Result<Self> {
        Self::new(None, None, String::new())
    }

    pub async fn completion(&self, payload: &CallbackPayload) {
        let Some(url) = &self.callback_url else {
            tracing::debug!(
                "[notifier] no CALLBACK_URL, skipping completion for {}",
                payload.instance_id
            );
            return;
        };
        let res = self
            .client
            .post(url)
            .bearer_auth(&self.shared_secret)
            .json(payload)
            .send()
            .await;
        match res {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(
                    "[notifier] completion {:?} delivered for {}",
                    payload.status,
                    payload.instance_id
                );
            }
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                tracing::error!(
                    "[notifier] completion for {} rejected: status={} body={}",
                    payload.instance_id,
                    status.as_u16(),
                    body
                );
            }
            Err(e) => {
                tracing::error!(
                    "[notifier] completion for {} not delivered: {}",
                    payload.instance_id,
                    e
                );
            }
        }
    }

    pub async fn alert(&self, instance_id: Uuid, message: &str) {
        tracing::error!("[alert] instance {}: {}", instance_id, message);
        let Some(url) = &self.alert_url else {
            return;
        };
        let body = json!({
            "text": format!("agenthost: provisioning failed for {}: {}", instance_id, message)
        });
        if let Err(e) = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
        {
            tracing::warn!("[alert] webhook delivery failed: {}", e);
        }
    }
}
