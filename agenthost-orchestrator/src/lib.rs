pub mod api;
pub mod api_docs;
pub mod cloud_init;
pub mod config;
pub mod coordinator;
pub mod gateway;
pub mod logger;
pub mod notifier;
pub mod progress;
pub mod remote;
pub mod retry;
pub mod state_machine;
pub mod store;
pub mod tunnel;

use std::sync::Arc;

use agenthost_common::ProviderKind;
use agenthost_providers::unimplemented::UnimplementedProvider;
use agenthost_providers::ProviderRegistry;
use anyhow::Result;

use crate::api::AppState;
use crate::config::Settings;
use crate::coordinator::{Coordinator, CoordinatorOptions};
use crate::notifier::Notifier;
use crate::progress::{ProgressCache, StatusBridge};
use crate::remote::{ConfiguratorOptions, RemoteConfigurator, ShellConnector, SshConnector};
use crate::store::InstanceStore;
use crate::tunnel::{CloudflareTunnelService, TunnelService};

/// One adapter per backend with credentials; macOS is always registered so
/// its plans fail with "not yet implemented" rather than "not configured".
pub fn build_registry(settings: &Settings) -> Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();

    #[cfg(feature = "provider-hetzner")]
    if let Some(h) = &settings.hetzner {
        use agenthost_providers::hetzner::{HetznerConfig, HetznerProvider};
        let mut cfg = HetznerConfig::new(h.api_token.clone());
        if let Some(base_url) = &h.base_url {
            cfg.base_url = base_url.clone();
        }
        if let Some(image) = &h.image {
            cfg.image = image.clone();
        }
        if let Some(location) = &h.location {
            cfg.location = location.clone();
        }
        cfg.ssh_key_names = h.ssh_key_names.clone();
        cfg.readiness.ssh_port = settings.bootstrap_port;
        registry.register(Arc::new(HetznerProvider::new(cfg)?));
        tracing::info!("[registry] hetzner enabled");
    }

    #[cfg(feature = "provider-scaleway")]
    if let Some(s) = &settings.scaleway {
        use agenthost_providers::scaleway::{ScalewayConfig, ScalewayProvider};
        let mut cfg = ScalewayConfig::new(s.project_id.clone(), s.secret_key.clone());
        if let Some(zone) = &s.zone {
            cfg.zone = zone.clone();
        }
        if let Some(base_url) = &s.base_url {
            cfg.base_url = base_url.clone();
        }
        cfg.readiness.ssh_port = settings.bootstrap_port;
        registry.register(Arc::new(ScalewayProvider::new(cfg)?));
        tracing::info!("[registry] scaleway enabled");
    }

    registry.register(Arc::new(UnimplementedProvider::new(ProviderKind::Macos)));
    Ok(registry)
}

/// Wire the coordinator and HTTP state from settings.
///
/// The store, registry and shell connector are passed in so tests can swap
/// them for in-process fakes.
pub fn build_state(
    settings: &Settings,
    store: Arc<dyn InstanceStore>,
    registry: ProviderRegistry,
    connector: Option<Arc<dyn ShellConnector>>,
) -> Result<Arc<AppState>> {
    let tunnels: Option<Arc<dyn TunnelService>> = match &settings.cloudflare {
        Some(cf) => Some(Arc::new(CloudflareTunnelService::new(
            cf.clone(),
            settings.terminal_port,
            settings.gateway_port,
        )?)),
        None => {
            tracing::warn!("[startup] no Cloudflare settings; servers get no tunnel");
            None
        }
    };

    let connector = connector.unwrap_or_else(|| {
        Arc::new(SshConnector::new(settings.ssh.clone(), settings.bootstrap_port))
    });
    let configurator = RemoteConfigurator::new(
        connector,
        ConfiguratorOptions {
            bootstrap_port: settings.bootstrap_port,
            command_timeout: settings.ssh.command_timeout,
            ..Default::default()
        },
    );
    let notifier = Notifier::new(
        settings.callback_url.clone(),
        settings.alert_webhook_url.clone(),
        settings.shared_secret.clone(),
    )?;
    if settings.callback_url.is_none() {
        tracing::warn!("[startup] CALLBACK_URL not set; completions are only logged");
    }
    let progress = Arc::new(ProgressCache::new(
        settings.progress_ttl,
        settings.progress_capacity,
    ));

    let coordinator = Arc::new(Coordinator::new(
        store.clone(),
        registry,
        tunnels,
        Arc::new(configurator),
        Arc::new(notifier),
        progress.clone(),
        CoordinatorOptions {
            terminal_port: settings.terminal_port,
            gateway_port: settings.gateway_port,
            ssh_public_key: settings.ssh.public_key.clone(),
            ..Default::default()
        },
    ));

    Ok(Arc::new(AppState {
        coordinator,
        status: StatusBridge::new(progress, store),
        shared_secret: settings.shared_secret.clone(),
    }))
}
