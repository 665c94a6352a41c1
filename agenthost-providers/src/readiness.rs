//! Readiness gate shared by the real backends.
//!
//! A server is usable only when the provider reports it `running` AND its
//! remote-shell port accepts a TCP connection. Each half runs on its own
//! bounded loop; exceeding either bound is a `Timeout`, never a `Provider`
//! error.

use std::time::Duration;

use agenthost_common::{ProvisionError, ServerInfo, ServerStatus};
use anyhow::Result;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use crate::ServerProvider;

#[derive(Debug, Clone)]
pub struct ReadinessPolicy {
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
    pub ssh_port: u16,
    pub probe_interval: Duration,
    pub max_probe_attempts: u32,
    pub probe_timeout: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        // ~5 minutes for the provider, ~2 minutes for sshd.
        Self {
            poll_interval: Duration::from_secs(5),
            max_poll_attempts: 60,
            ssh_port: 22,
            probe_interval: Duration::from_secs(5),
            max_probe_attempts: 24,
            probe_timeout: Duration::from_secs(3),
        }
    }
}

/// Single TCP connect attempt bounded by `connect_timeout`.
pub async fn probe_tcp(ip: &str, port: u16, connect_timeout: Duration) -> bool {
    let clean_ip = ip.split('/').next().unwrap_or(ip).trim();
    let addr = format!("{}:{}", clean_ip, port);
    matches!(timeout(connect_timeout, TcpStream::connect(&addr)).await, Ok(Ok(_)))
}

/// Probe `ip:port` until it accepts a connection or `max_attempts` is spent.
pub async fn wait_for_port(
    ip: &str,
    port: u16,
    max_attempts: u32,
    interval: Duration,
    connect_timeout: Duration,
) -> Result<()> {
    for attempt in 1..=max_attempts {
        if probe_tcp(ip, port, connect_timeout).await {
            tracing::debug!(
                "[readiness] {}:{} reachable (attempt {}/{})",
                ip,
                port,
                attempt,
                max_attempts
            );
            return Ok(());
        }
        if attempt % 5 == 0 {
            tracing::debug!(
                "[readiness] {}:{} still unreachable ({}/{})",
                ip,
                port,
                attempt,
                max_attempts
            );
        }
        sleep(interval).await;
    }
    Err(ProvisionError::Timeout(format!(
        "port {} on {} not reachable after {} attempts",
        port, ip, max_attempts
    ))
    .into())
}

/// Poll `get_server` until `running`, then gate on the ssh port.
///
/// Credentials are only known at creation time on some backends, so the ones
/// carried by `info` are kept when the polled view has none.
pub async fn wait_for_ready<P: ServerProvider + ?Sized>(
    provider: &P,
    info: ServerInfo,
    policy: &ReadinessPolicy,
) -> Result<ServerInfo> {
    let mut running: Option<ServerInfo> = None;

    for attempt in 1..=policy.max_poll_attempts {
        match provider.get_server(&info.id).await? {
            Some(current) if current.status == ServerStatus::Running && current.clean_ip().is_some() => {
                tracing::info!(
                    "[readiness] server {} running after {} poll(s)",
                    info.id,
                    attempt
                );
                running = Some(current);
                break;
            }
            Some(current) if current.status == ServerStatus::Error => {
                return Err(ProvisionError::Provider(format!(
                    "server {} entered error state",
                    info.id
                ))
                .into());
            }
            Some(current) => {
                tracing::debug!(
                    "[readiness] server {} status={} ({}/{})",
                    info.id,
                    current.status.as_str(),
                    attempt,
                    policy.max_poll_attempts
                );
            }
            None => {
                tracing::debug!(
                    "[readiness] server {} not visible yet ({}/{})",
                    info.id,
                    attempt,
                    policy.max_poll_attempts
                );
            }
        }
        sleep(policy.poll_interval).await;
    }

    let Some(mut ready) = running else {
        return Err(ProvisionError::Timeout(format!(
            "server {} did not reach running after {} attempts",
            info.id, policy.max_poll_attempts
        ))
        .into());
    };

    let ip = ready.clean_ip().unwrap_or_default().to_string();
    wait_for_port(
        &ip,
        policy.ssh_port,
        policy.max_probe_attempts,
        policy.probe_interval,
        policy.probe_timeout,
    )
    .await?;

    if ready.credentials.is_none() {
        ready.credentials = info.credentials;
    }
    Ok(ready)
}
