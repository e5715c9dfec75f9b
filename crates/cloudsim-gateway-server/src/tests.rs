use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use cloudsim_common::ContainerRuntime;
use cloudsim_orchestrator::{
    ExecGateway, InstanceStore, JsonFileStore, LifecycleManager, ManagerConfig,
};
use cloudsim_runtime::FakeEngine;

use crate::{create_app, AppState};

struct TestApp {
    app: Router,
    engine: Arc<FakeEngine>,
    _dir: tempfile::TempDir,
}

async fn test_app() -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn InstanceStore> = Arc::new(
        JsonFileStore::open(dir.path().join("instances.json"))
            .await
            .unwrap(),
    );
    let engine = Arc::new(FakeEngine::new());
    let runtime: Arc<dyn ContainerRuntime> = engine.clone();
    let gateway = Arc::new(ExecGateway::new(
        runtime.clone(),
        store.clone(),
        Duration::from_secs(5),
    ));
    let manager = Arc::new(LifecycleManager::new(
        runtime.clone(),
        store,
        gateway.clone(),
        ManagerConfig {
            op_timeout: Duration::from_secs(5),
            stop_timeout_secs: 1,
        },
    ));
    TestApp {
        app: create_app(AppState {
            manager,
            gateway,
            runtime,
        }),
        engine,
        _dir: dir,
    }
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = match body {
        Some(body) => Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

#[tokio::test]
async fn test_health_reports_engine_status() {
    let t = test_app().await;

    let (status, body) = send(&t.app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["engine"], "reachable");

    t.engine.set_unavailable(true);
    let (status, body) = send(&t.app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["engine"], "unreachable");
}

#[tokio::test]
async fn test_create_and_get_instance() {
    let t = test_app().await;

    let (status, body) = send(
        &t.app,
        "POST",
        "/api/v1/instances",
        Some(json!({ "image": "alpine:latest", "name": "web-1", "memory_mb": 512 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["id"].as_str().unwrap().to_string();
    assert!(id.starts_with("i-"));
    assert_eq!(body["desired_state"], "running");
    assert_eq!(body["observed_state"], "running");
    assert_eq!(body["memory_mb"], 512);

    let (status, body) = send(&t.app, "GET", &format!("/api/v1/instances/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], id.as_str());

    let (status, body) = send(&t.app, "GET", "/api/v1/instances", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_invalid_create_is_bad_request() {
    let t = test_app().await;
    let (status, body) = send(
        &t.app,
        "POST",
        "/api/v1/instances",
        Some(json!({ "image": "" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "InvalidParameterValue");
    assert!(body["message"].is_string());
}

#[tokio::test]
async fn test_unknown_instance_is_not_found() {
    let t = test_app().await;
    let (status, body) = send(&t.app, "GET", "/api/v1/instances/i-missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "ResourceNotFound");
}

#[tokio::test]
async fn test_lifecycle_over_http() {
    let t = test_app().await;
    let (_, body) = send(
        &t.app,
        "POST",
        "/api/v1/instances",
        Some(json!({ "image": "alpine:latest" })),
    )
    .await;
    let id = body["id"].as_str().unwrap().to_string();

    let (status, body) = send(
        &t.app,
        "POST",
        &format!("/api/v1/instances/{id}/stop"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["observed_state"], "stopped");

    // State gate violations surface as conflicts.
    let (status, body) = send(
        &t.app,
        "POST",
        &format!("/api/v1/instances/{id}/stop"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "InstanceNotRunning");

    let (status, body) = send(
        &t.app,
        "POST",
        &format!("/api/v1/instances/{id}/terminate"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["desired_state"], "terminated");

    // Tombstones refuse transitions but stay readable.
    let (status, _) = send(
        &t.app,
        "POST",
        &format!("/api/v1/instances/{id}/start"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&t.app, "GET", &format!("/api/v1/instances/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);

    // Purge removes the record for good.
    let (status, _) = send(&t.app, "DELETE", &format!("/api/v1/instances/{id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&t.app, "GET", &format!("/api/v1/instances/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_exec_endpoint_returns_output() {
    let t = test_app().await;
    let (_, body) = send(
        &t.app,
        "POST",
        "/api/v1/instances",
        Some(json!({ "image": "alpine:latest" })),
    )
    .await;
    let id = body["id"].as_str().unwrap().to_string();

    let (status, body) = send(
        &t.app,
        "POST",
        &format!("/api/v1/instances/{id}/exec"),
        Some(json!({ "command": ["uname", "-a"] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["output"].as_str().unwrap().contains("uname -a"));

    let (status, body) = send(
        &t.app,
        "POST",
        &format!("/api/v1/instances/{id}/exec"),
        Some(json!({ "command": [] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "InvalidParameterValue");
}

#[tokio::test]
async fn test_reconcile_endpoint_surfaces_drift() {
    let t = test_app().await;
    let (_, body) = send(
        &t.app,
        "POST",
        "/api/v1/instances",
        Some(json!({ "image": "alpine:latest" })),
    )
    .await;
    let id = body["id"].as_str().unwrap().to_string();
    let runtime_ref = body["runtime_ref"].as_str().unwrap().to_string();

    t.engine.kill(&runtime_ref).await;

    let (status, body) = send(
        &t.app,
        "POST",
        &format!("/api/v1/instances/{id}/reconcile"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"]["kind"], "drift");
    assert_eq!(body["outcome"]["actual"], "exited");
    assert_eq!(body["record"]["observed_state"], "exited");

    let (status, body) = send(&t.app, "POST", "/api/v1/reconcile", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_unreachable_engine_maps_to_service_unavailable() {
    let t = test_app().await;
    let (_, body) = send(
        &t.app,
        "POST",
        "/api/v1/instances",
        Some(json!({ "image": "alpine:latest" })),
    )
    .await;
    let id = body["id"].as_str().unwrap().to_string();

    t.engine.set_unavailable(true);
    let (status, body) = send(
        &t.app,
        "POST",
        &format!("/api/v1/instances/{id}/stop"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "RuntimeUnavailable");
}
