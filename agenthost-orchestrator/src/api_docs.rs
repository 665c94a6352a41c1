use utoipa::OpenApi;

use crate::api;
use crate::coordinator::{DeprovisionRequest, Deprovisioned, ProvisionRequest};
use crate::progress::StatusView;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::provision,
        api::provision_status,
        api::deprovision,
        api::configure
    ),
    components(
        schemas(
            ProvisionRequest,
            DeprovisionRequest,
            Deprovisioned,
            StatusView,
            api::ProvisionAccepted,
            api::ProvisionRejected,
            api::ConfigureBody,
            agenthost_common::InstanceStatus,
            agenthost_common::ProviderKind
        )
    ),
    tags(
        (name = "agenthost-orchestrator", description = "Agent host provisioning API")
    )
)]
pub struct ApiDoc;
