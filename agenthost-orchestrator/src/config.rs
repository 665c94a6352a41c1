//! Environment-driven settings.
//!
//! Secrets prefer a `*_FILE` variant (Docker/K8s secrets) and fall back to
//! the plain variable. Optional sections stay `None` when their credentials
//! are absent so the orchestrator can start with a subset of backends.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use agenthost_common::ProvisionError;
use anyhow::Result;

#[derive(Debug, Clone)]
pub struct HetznerSettings {
    pub api_token: String,
    pub base_url: Option<String>,
    pub image: Option<String>,
    pub location: Option<String>,
    pub ssh_key_names: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ScalewaySettings {
    pub project_id: String,
    pub secret_key: String,
    pub zone: Option<String>,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CloudflareSettings {
    pub api_token: String,
    pub account_id: String,
    pub zone_id: String,
    /// Public zone, e.g. `agents.example.com`.
    pub domain: String,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct SshSettings {
    pub user: String,
    pub private_key_file: Option<PathBuf>,
    /// Installed through cloud-init so the orchestrator can log in.
    pub public_key: Option<String>,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: SocketAddr,
    pub shared_secret: String,
    pub database_url: Option<String>,
    pub use_memory_store: bool,
    pub callback_url: Option<String>,
    pub alert_webhook_url: Option<String>,
    pub terminal_port: u16,
    pub gateway_port: u16,
    pub bootstrap_port: u16,
    pub progress_ttl: Duration,
    pub progress_capacity: usize,
    pub hetzner: Option<HetznerSettings>,
    pub scaleway: Option<ScalewaySettings>,
    pub cloudflare: Option<CloudflareSettings>,
    pub ssh: SshSettings,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| -> Option<String> {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let secret = |key: &str| -> Option<String> {
            let from_file = var(&format!("{}_FILE", key)).and_then(|path| {
                std::fs::read_to_string(&path)
                    .map_err(|e| {
                        tracing::warn!("[config] cannot read {}_FILE ({}): {}", key, path, e)
                    })
                    .ok()
            });
            from_file
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .or_else(|| var(key))
        };

        let shared_secret = secret("ORCHESTRATOR_SECRET").ok_or_else(|| {
            ProvisionError::Configuration("ORCHESTRATOR_SECRET (or _FILE) must be set".into())
        })?;

        let bind_addr: SocketAddr = var("BIND_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8001".to_string())
            .parse()
            .map_err(|e| ProvisionError::Configuration(format!("invalid BIND_ADDR: {}", e)))?;

        let use_memory_store = var("STORE")
            .map(|s| s.eq_ignore_ascii_case("memory"))
            .unwrap_or(false);
        let database_url = var("DATABASE_URL");
        if database_url.is_none() && !use_memory_store {
            return Err(ProvisionError::Configuration(
                "DATABASE_URL must be set (or STORE=memory)".into(),
            )
            .into());
        }

        let hetzner = secret("HETZNER_API_TOKEN").map(|api_token| HetznerSettings {
            api_token,
            base_url: var("HETZNER_BASE_URL"),
            image: var("HETZNER_IMAGE"),
            location: var("HETZNER_LOCATION"),
            ssh_key_names: var("HETZNER_SSH_KEYS")
                .map(|s| {
                    s.split(',')
                        .map(|k| k.trim().to_string())
                        .filter(|k| !k.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        });

        let scaleway = match (var("SCALEWAY_PROJECT_ID"), secret("SCALEWAY_SECRET_KEY")) {
            (Some(project_id), Some(secret_key)) => Some(ScalewaySettings {
                project_id,
                secret_key,
                zone: var("SCALEWAY_ZONE"),
                base_url: var("SCALEWAY_BASE_URL"),
            }),
            _ => None,
        };

        let cloudflare = match (
            secret("CLOUDFLARE_API_TOKEN"),
            var("CLOUDFLARE_ACCOUNT_ID"),
            var("CLOUDFLARE_ZONE_ID"),
            var("CLOUDFLARE_DOMAIN"),
        ) {
            (Some(api_token), Some(account_id), Some(zone_id), Some(domain)) => {
                Some(CloudflareSettings {
                    api_token,
                    account_id,
                    zone_id,
                    domain: domain.trim_matches('.').to_ascii_lowercase(),
                    base_url: var("CLOUDFLARE_BASE_URL")
                        .unwrap_or_else(|| crate::tunnel::DEFAULT_BASE_URL.to_string()),
                })
            }
            (None, None, None, None) => None,
            _ => {
                tracing::warn!(
                    "[config] partial Cloudflare settings; tunnels disabled (need CLOUDFLARE_API_TOKEN, CLOUDFLARE_ACCOUNT_ID, CLOUDFLARE_ZONE_ID, CLOUDFLARE_DOMAIN)"
                );
                None
            }
        };

        let public_key = var("SSH_PUBLIC_KEY_FILE")
            .and_then(|path| std::fs::read_to_string(path).ok())
            .or_else(|| var("SSH_PUBLIC_KEY"))
            .map(|s| s.trim().replace('\n', " "))
            .filter(|s| !s.is_empty());

        let ssh = SshSettings {
            user: var("SSH_USER").unwrap_or_else(|| "root".to_string()),
            private_key_file: var("SSH_PRIVATE_KEY_FILE").map(PathBuf::from),
            public_key,
            connect_timeout: Duration::from_secs(parse_or(&var, "SSH_CONNECT_TIMEOUT_SECS", 10)?),
            command_timeout: Duration::from_secs(parse_or(&var, "SSH_COMMAND_TIMEOUT_SECS", 120)?),
        };

        Ok(Self {
            bind_addr,
            shared_secret,
            database_url,
            use_memory_store,
            callback_url: var("CALLBACK_URL"),
            alert_webhook_url: var("ALERT_WEBHOOK_URL"),
            terminal_port: parse_or(&var, "TERMINAL_PORT", 7681)?,
            gateway_port: parse_or(&var, "GATEWAY_PORT", 18789)?,
            bootstrap_port: parse_or(&var, "BOOTSTRAP_PORT", 22)?,
            progress_ttl: Duration::from_secs(parse_or(&var, "PROGRESS_TTL_SECS", 3600)?),
            progress_capacity: parse_or(&var, "PROGRESS_CAPACITY", 1024)?,
            hetzner,
            scaleway,
            cloudflare,
            ssh,
        })
    }
}

fn parse_or<T, F>(var: &F, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        None => Ok(default),
        Some(raw) => raw.parse::<T>().map_err(|e| {
            ProvisionError::Configuration(format!("invalid {}='{}': {}", key, raw, e)).into()
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn secret_is_required() {
        let err = Settings::from_lookup(lookup(&[("STORE", "memory")])).unwrap_err();
        assert!(err.to_string().contains("ORCHESTRATOR_SECRET"));
    }

    #[test]
    fn database_or_memory_store_is_required() {
        let err = Settings::from_lookup(lookup(&[("ORCHESTRATOR_SECRET", "s")])).unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));
    }

    #[test]
    fn defaults_and_optional_sections() {
        let s = Settings::from_lookup(lookup(&[
            ("ORCHESTRATOR_SECRET", " s3cret "),
            ("STORE", "memory"),
            ("HETZNER_API_TOKEN", "tok"),
            ("HETZNER_SSH_KEYS", "a, b,"),
        ]))
        .unwrap();
        assert_eq!(s.shared_secret, "s3cret");
        assert!(s.use_memory_store);
        assert_eq!(s.bind_addr.port(), 8001);
        assert_eq!(s.terminal_port, 7681);
        assert_eq!(s.ssh.user, "root");
        let h = s.hetzner.unwrap();
        assert_eq!(h.ssh_key_names, vec!["a".to_string(), "b".to_string()]);
        assert!(s.scaleway.is_none());
        assert!(s.cloudflare.is_none());
    }

    #[test]
    fn file_secret_wins_over_plain_variable() {
        let path = std::env::temp_dir().join(format!("agenthost-secret-{}", uuid::Uuid::new_v4()));
        std::fs::write(&path, "from-file\n").unwrap();
        let s = Settings::from_lookup(lookup(&[
            ("ORCHESTRATOR_SECRET", "from-env"),
            ("ORCHESTRATOR_SECRET_FILE", path.to_str().unwrap()),
            ("STORE", "memory"),
        ]))
        .unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(s.shared_secret, "from-file");
    }

    #[test]
    fn bad_port_is_configuration_error() {
        let err = Settings::from_lookup(lookup(&[
            ("ORCHESTRATOR_SECRET", "s"),
            ("STORE", "memory"),
            ("TERMINAL_PORT", "http"),
        ]))
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProvisionError>(),
            Some(ProvisionError::Configuration(_))
        ));
    }

    #[test]
    fn cloudflare_needs_every_field() {
        let s = Settings::from_lookup(lookup(&[
            ("ORCHESTRATOR_SECRET", "s"),
            ("STORE", "memory"),
            ("CLOUDFLARE_API_TOKEN", "t"),
            ("CLOUDFLARE_ACCOUNT_ID", "acc"),
            ("CLOUDFLARE_ZONE_ID", "zone"),
            ("CLOUDFLARE_DOMAIN", ".Agents.Example.com."),
        ]))
        .unwrap();
        assert_eq!(s.cloudflare.unwrap().domain, "agents.example.com");
    }
}
