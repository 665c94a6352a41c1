use thiserror::Error;

/// Failure taxonomy shared by providers, the tunnel service, the remote
/// configurator and the gateway client.
///
/// Library code propagates `anyhow::Error`; callers recover the category with
/// `err.downcast_ref::<ProvisionError>()`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProvisionError {
    /// Missing secret, unknown plan, bad input. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Backend rejected a request or reported an unexpected state.
    #[error("provider error: {0}")]
    Provider(String),

    #[error("{0} not found")]
    NotFound(String),

    /// A bounded poll/probe loop or a per-command deadline was exceeded.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Backend exists in the plan table but has no implementation.
    #[error("{0} provider is not yet implemented")]
    NotImplemented(String),

    #[error("gateway rpc error: {message}")]
    Rpc { message: String, retryable: bool },

    /// Another pipeline already owns the instance.
    #[error("{0}")]
    Conflict(String),
}

impl ProvisionError {
    pub fn code(&self) -> &'static str {
        match self {
            ProvisionError::Configuration(_) => "CONFIGURATION",
            ProvisionError::Provider(_) => "PROVIDER",
            ProvisionError::NotFound(_) => "NOT_FOUND",
            ProvisionError::Timeout(_) => "TIMEOUT",
            ProvisionError::NotImplemented(_) => "NOT_IMPLEMENTED",
            ProvisionError::Rpc { .. } => "RPC",
            ProvisionError::Conflict(_) => "CONFLICT",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_implemented_message_names_backend() {
        let e = ProvisionError::NotImplemented("macos".into());
        assert_eq!(e.to_string(), "macos provider is not yet implemented");
        assert_eq!(e.code(), "NOT_IMPLEMENTED");
    }

    #[test]
    fn timeout_and_provider_are_distinct() {
        let t = ProvisionError::Timeout("server never reached running".into());
        let p = ProvisionError::Provider("server entered error state".into());
        assert_ne!(t.code(), p.code());
    }
}
