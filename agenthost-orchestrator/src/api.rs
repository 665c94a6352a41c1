use std::sync::Arc;

use agenthost_common::ProvisionError;
use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use utoipa::OpenApi;
use uuid::Uuid;

use crate::api_docs::ApiDoc;
use crate::coordinator::{Admission, Coordinator, DeprovisionRequest, ProvisionRequest};
use crate::progress::{StatusBridge, StatusView};

pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub status: StatusBridge,
    pub shared_secret: String,
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let public = Router::new()
        .route("/health", get(health))
        .route("/openapi.json", get(openapi));

    let protected = Router::new()
        .route("/provision", post(provision))
        .route("/provision/status", get(provision_status))
        .route("/deprovision", post(deprovision))
        .route("/instances/{id}/configure", post(configure))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_shared_secret,
        ));

    Router::new()
        .merge(public)
        .merge(protected)
        .layer(cors)
        .with_state(state)
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let Some(auth) = headers.get(axum::http::header::AUTHORIZATION) else {
        return None;
    };
    let Ok(auth) = auth.to_str() else {
        return None;
    };
    let auth = auth.trim();
    let prefix = "Bearer ";
    if auth.len() <= prefix.len() || !auth.starts_with(prefix) {
        return None;
    }
    Some(auth[prefix.len()..].trim().to_string())
}

/// Compares without stopping at the first differing byte.
fn secrets_match(given: &str, expected: &str) -> bool {
    let (a, b) = (given.as_bytes(), expected.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

async fn require_shared_secret(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    match extract_bearer(req.headers()) {
        Some(token) if secrets_match(&token, &state.shared_secret) => next.run(req).await,
        Some(_) => {
            tracing::warn!("[api] rejected request to {}: bad secret", req.uri().path());
            (StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"}))).into_response()
        }
        None => (StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"}))).into_response(),
    }
}

/// HTTP status for a failed operation. `Configuration` is reported with
/// `config_status` so the configure route can answer 422.
fn error_response(err: anyhow::Error, config_status: StatusCode) -> Response {
    let (status, code) = match err.downcast_ref::<ProvisionError>() {
        Some(e @ ProvisionError::Configuration(_)) => (config_status, e.code()),
        Some(e @ ProvisionError::NotFound(_)) => (StatusCode::NOT_FOUND, e.code()),
        Some(e @ ProvisionError::Conflict(_)) => (StatusCode::CONFLICT, e.code()),
        Some(e @ ProvisionError::NotImplemented(_)) => (StatusCode::NOT_IMPLEMENTED, e.code()),
        Some(e @ ProvisionError::Timeout(_)) => (StatusCode::GATEWAY_TIMEOUT, e.code()),
        Some(e @ (ProvisionError::Provider(_) | ProvisionError::Rpc { .. })) => {
            (StatusCode::BAD_GATEWAY, e.code())
        }
        None => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
    };
    if status.is_server_error() {
        tracing::error!("[api] {} {}: {:#}", status.as_u16(), code, err);
    }
    (
        status,
        Json(json!({ "error": code, "detail": err.to_string() })),
    )
        .into_response()
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionAccepted {
    pub status: String,
    pub instance_id: Uuid,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ProvisionRejected {
    pub status: String,
    pub message: String,
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
#[into_params(parameter_in = Query)]
pub struct StatusQuery {
    pub id: Uuid,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct ConfigureBody {
    #[schema(value_type = Object)]
    pub config: Value,
}

async fn health() -> &'static str {
    "ok"
}

async fn openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[utoipa::path(
    post,
    path = "/provision",
    request_body = ProvisionRequest,
    responses(
        (status = 202, description = "Pipeline started", body = ProvisionAccepted),
        (status = 400, description = "Unknown plan or unconfigured backend"),
        (status = 409, description = "A pipeline already owns the instance", body = ProvisionRejected)
    )
)]
pub async fn provision(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ProvisionRequest>,
) -> Response {
    match state.coordinator.provision(req).await {
        Ok(Admission::Accepted { instance_id }) => (
            StatusCode::ACCEPTED,
            Json(ProvisionAccepted {
                status: "provisioning".to_string(),
                instance_id,
            }),
        )
            .into_response(),
        Ok(Admission::Rejected { status, message }) => (
            StatusCode::CONFLICT,
            Json(ProvisionRejected {
                status: status.to_string(),
                message,
            }),
        )
            .into_response(),
        Err(e) => error_response(e, StatusCode::BAD_REQUEST),
    }
}

#[utoipa::path(
    get,
    path = "/provision/status",
    params(StatusQuery),
    responses(
        (status = 200, description = "Current provisioning status", body = StatusView),
        (status = 404, description = "Unknown instance")
    )
)]
pub async fn provision_status(
    State(state): State<Arc<AppState>>,
    Query(q): Query<StatusQuery>,
) -> Response {
    match state.status.get_status(q.id).await {
        Ok(Some(view)) => Json(view).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "NOT_FOUND", "detail": format!("instance {} not found", q.id) })),
        )
            .into_response(),
        Err(e) => error_response(e, StatusCode::BAD_REQUEST),
    }
}

#[utoipa::path(
    post,
    path = "/deprovision",
    request_body = DeprovisionRequest,
    responses(
        (status = 200, description = "Server deleted"),
        (status = 409, description = "A provisioning pipeline is in flight"),
        (status = 502, description = "Backend refused the deletion")
    )
)]
pub async fn deprovision(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DeprovisionRequest>,
) -> Response {
    match state.coordinator.deprovision(req).await {
        Ok(done) => {
            let mut body = json!({ "status": "deprovisioned", "serverId": done.server_id });
            if let Some(tunnel_id) = done.tunnel_id {
                body["tunnelId"] = json!(tunnel_id);
            }
            Json(body).into_response()
        }
        Err(e) => error_response(e, StatusCode::BAD_REQUEST),
    }
}

#[utoipa::path(
    post,
    path = "/instances/{id}/configure",
    params(("id" = Uuid, Path, description = "Instance id")),
    request_body = ConfigureBody,
    responses(
        (status = 200, description = "Configuration applied"),
        (status = 404, description = "Unknown instance"),
        (status = 409, description = "Instance is busy or not configurable"),
        (status = 422, description = "Instance cannot be reached"),
        (status = 502, description = "Gateway or remote configuration failed")
    )
)]
pub async fn configure(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<ConfigureBody>,
) -> Response {
    match state.coordinator.configure(id, body.config).await {
        Ok(status) => Json(json!({ "status": status })).into_response(),
        Err(e) => error_response(e, StatusCode::UNPROCESSABLE_ENTITY),
    }
}
