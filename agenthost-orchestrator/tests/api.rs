// HTTP surface tests: auth, status codes and bodies.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use agenthost_common::ProviderKind;
use agenthost_orchestrator::api::{self, AppState};
use agenthost_orchestrator::build_state;
use agenthost_orchestrator::config::Settings;
use agenthost_orchestrator::store::MemoryInstanceStore;
use agenthost_providers::mock::MockProvider;
use agenthost_providers::unimplemented::UnimplementedProvider;
use agenthost_providers::ProviderRegistry;
use axum_test::TestServer;
use common::{FakeConnector, FakeHost};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use uuid::Uuid;

const SECRET: &str = "api-test-secret";

struct Api {
    server: TestServer,
    state: Arc<AppState>,
    _ssh: TcpListener,
}

async fn api() -> Api {
    let ssh = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = ssh.local_addr().unwrap().port().to_string();
    let vars: HashMap<&str, String> = HashMap::from([
        ("ORCHESTRATOR_SECRET", SECRET.to_string()),
        ("STORE", "memory".to_string()),
        ("BOOTSTRAP_PORT", port),
    ]);
    let settings = Settings::from_lookup(|k| vars.get(k).cloned()).unwrap();

    // A few status polls keep the pipeline busy long enough to observe it.
    let hetzner = MockProvider::new(ProviderKind::Hetzner)
        .with_ssh_port(settings.bootstrap_port)
        .with_polls_until_running(5);
    let registry = ProviderRegistry::new()
        .with(Arc::new(hetzner))
        .with(Arc::new(UnimplementedProvider::new(ProviderKind::Macos)));
    let state = build_state(
        &settings,
        Arc::new(MemoryInstanceStore::new()),
        registry,
        Some(Arc::new(FakeConnector(Arc::new(FakeHost::default())))),
    )
    .unwrap();
    let server = TestServer::new(api::router(state.clone())).unwrap();
    Api {
        server,
        state,
        _ssh: ssh,
    }
}

fn bearer() -> String {
    format!("Bearer {}", SECRET)
}

async fn wait_until_idle(state: &AppState, id: Uuid) {
    for _ in 0..500 {
        if !state.coordinator.is_in_flight(id) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn health_needs_no_secret() {
    let api = api().await;
    let res = api.server.get("/health").await;
    assert_eq!(res.status_code(), 200);
    assert_eq!(res.text(), "ok");
}

#[tokio::test]
async fn protected_routes_require_the_shared_secret() {
    let api = api().await;
    let res = api
        .server
        .get("/provision/status")
        .add_query_param("id", Uuid::new_v4())
        .await;
    assert_eq!(res.status_code(), 401);

    let res = api
        .server
        .post("/provision")
        .add_header("Authorization", "Bearer wrong")
        .json(&json!({}))
        .await;
    assert_eq!(res.status_code(), 401);
}

#[tokio::test]
async fn provision_then_poll_until_ready() {
    let api = api().await;
    let id = Uuid::new_v4();
    let res = api
        .server
        .post("/provision")
        .add_header("Authorization", bearer())
        .json(&json!({
            "instanceId": id,
            "planId": "linux",
            "customerEmail": "ada@example.com",
            "customerName": "Ada",
            "config": { "model": "sonnet" }
        }))
        .await;
    assert_eq!(res.status_code(), 202);
    let body: Value = res.json();
    assert_eq!(body, json!({ "status": "provisioning", "instanceId": id }));

    wait_until_idle(&api.state, id).await;
    let res = api
        .server
        .get("/provision/status")
        .add_query_param("id", id)
        .add_header("Authorization", bearer())
        .await;
    assert_eq!(res.status_code(), 200);
    let body: Value = res.json();
    assert_eq!(body["status"], "ready");
    assert_eq!(body["currentStep"], "done");
    assert_eq!(body["progress"], 100);
    assert_eq!(body["terminalUrl"], "http://127.0.0.1:7681");
}

#[tokio::test]
async fn duplicate_provision_is_409_with_existing_status() {
    let api = api().await;
    let id = Uuid::new_v4();
    let payload = json!({
        "instanceId": id,
        "planId": "linux",
        "customerEmail": "dup@example.com"
    });
    let first = api
        .server
        .post("/provision")
        .add_header("Authorization", bearer())
        .json(&payload)
        .await;
    assert_eq!(first.status_code(), 202);

    let second = api
        .server
        .post("/provision")
        .add_header("Authorization", bearer())
        .json(&payload)
        .await;
    assert_eq!(second.status_code(), 409);
    let body: Value = second.json();
    assert_eq!(body["status"], "provisioning");
    assert!(body["message"].as_str().is_some());
    wait_until_idle(&api.state, id).await;
}

#[tokio::test]
async fn unknown_plan_is_400() {
    let api = api().await;
    let res = api
        .server
        .post("/provision")
        .add_header("Authorization", bearer())
        .json(&json!({
            "instanceId": Uuid::new_v4(),
            "planId": "windows-xl",
            "customerEmail": "w@example.com"
        }))
        .await;
    assert_eq!(res.status_code(), 400);
    let body: Value = res.json();
    assert_eq!(body["error"], "CONFIGURATION");
    assert_eq!(body["detail"], "configuration error: unknown plan 'windows-xl'");
}

#[tokio::test]
async fn unknown_instance_status_is_404() {
    let api = api().await;
    let res = api
        .server
        .get("/provision/status")
        .add_query_param("id", Uuid::new_v4())
        .add_header("Authorization", bearer())
        .await;
    assert_eq!(res.status_code(), 404);
}

#[tokio::test]
async fn deprovision_unknown_server_reports_deprovisioned() {
    let api = api().await;
    let res = api
        .server
        .post("/deprovision")
        .add_header("Authorization", bearer())
        .json(&json!({
            "serverId": "mock-404",
            "provider": "hetzner",
            "customerEmail": "x@example.com",
            "reason": "cleanup"
        }))
        .await;
    assert_eq!(res.status_code(), 200);
    let body: Value = res.json();
    assert_eq!(body, json!({ "status": "deprovisioned", "serverId": "mock-404" }));
}

#[tokio::test]
async fn deprovision_on_unconfigured_backend_is_400() {
    let api = api().await;
    let res = api
        .server
        .post("/deprovision")
        .add_header("Authorization", bearer())
        .json(&json!({
            "serverId": "1",
            "provider": "scaleway",
            "customerEmail": "x@example.com"
        }))
        .await;
    assert_eq!(res.status_code(), 400);
    let body: Value = res.json();
    assert_eq!(body["detail"], "configuration error: scaleway provider is not configured");
}

#[tokio::test]
async fn configure_unknown_instance_is_404() {
    let api = api().await;
    let res = api
        .server
        .post(&format!("/instances/{}/configure", Uuid::new_v4()))
        .add_header("Authorization", bearer())
        .json(&json!({ "config": { "model": "opus" } }))
        .await;
    assert_eq!(res.status_code(), 404);
}

#[tokio::test]
async fn openapi_document_is_served() {
    let api = api().await;
    let res = api.server.get("/openapi.json").await;
    assert_eq!(res.status_code(), 200);
    let body: Value = res.json();
    assert!(body["paths"]["/provision"].is_object());
}
