use crate::{ProviderKind, ProvisionError};

/// Known plan identifiers and the backend each one provisions on.
pub const PLAN_TABLE: &[(&str, ProviderKind)] = &[
    ("linux", ProviderKind::Hetzner),
    ("linux-pro", ProviderKind::Hetzner),
    ("linux-eu", ProviderKind::Scaleway),
    ("linux-gpu", ProviderKind::Scaleway),
    ("macos-m1", ProviderKind::Macos),
];

/// Map a plan id to exactly one backend.
///
/// - Case-insensitive, surrounding whitespace ignored
/// - Unknown plans are a configuration error (never retried)
pub fn provider_for_plan(plan_id: &str) -> Result<ProviderKind, ProvisionError> {
    let plan = plan_id.trim().to_ascii_lowercase();
    PLAN_TABLE
        .iter()
        .find(|(p, _)| *p == plan)
        .map(|(_, kind)| *kind)
        .ok_or_else(|| ProvisionError::Configuration(format!("unknown plan '{}'", plan_id.trim())))
}
