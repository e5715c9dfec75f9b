//! HTTP facade over the lifecycle manager and exec gateway.
//!
//! Thin by construction: handlers translate requests into manager/gateway
//! calls and translate domain errors into stable wire codes. No lifecycle
//! decisions are made here.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::CorsLayer;
use tracing::info;

use cloudsim_common::ContainerRuntime;
use cloudsim_orchestrator::{Error, ExecGateway, LifecycleManager, ReconcileReport};

pub mod types;
mod ws;

#[cfg(test)]
mod tests;

use types::{CreateInstanceRequest, ErrorBody, ExecRequest, ExecResponse, InstanceView};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<LifecycleManager>,
    pub gateway: Arc<ExecGateway>,
    pub runtime: Arc<dyn ContainerRuntime>,
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        // Instance lifecycle
        .route("/api/v1/instances", post(create_instance).get(list_instances))
        .route("/api/v1/instances/:id", get(get_instance).delete(purge_instance))
        .route("/api/v1/instances/:id/start", post(start_instance))
        .route("/api/v1/instances/:id/stop", post(stop_instance))
        .route("/api/v1/instances/:id/reboot", post(reboot_instance))
        .route("/api/v1/instances/:id/terminate", post(terminate_instance))
        // Reconciliation
        .route("/api/v1/instances/:id/reconcile", post(reconcile_instance))
        .route("/api/v1/reconcile", post(reconcile_all))
        // Exec
        .route("/api/v1/instances/:id/exec", post(exec_instance))
        .route("/api/v1/instances/:id/exec/ws", get(ws::exec_session))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Domain error carried to the wire: a stable code plus a human message.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_)
            | Error::InstanceNotRunning(_)
            | Error::InstanceNotStopped(_)
            | Error::SessionAlreadyOpen(_) => StatusCode::CONFLICT,
            Error::RuntimeUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::RuntimeFailed(_) => StatusCode::BAD_GATEWAY,
            Error::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            code: self.0.code().to_string(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

async fn create_instance(
    State(state): State<AppState>,
    Json(req): Json<CreateInstanceRequest>,
) -> ApiResult<(StatusCode, Json<InstanceView>)> {
    let record = state.manager.create(req.into()).await?;
    Ok((StatusCode::CREATED, Json(record.into())))
}

async fn list_instances(State(state): State<AppState>) -> ApiResult<Json<Vec<InstanceView>>> {
    let records = state.manager.list().await?;
    Ok(Json(records.into_iter().map(InstanceView::from).collect()))
}

async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<InstanceView>> {
    let record = state.manager.get(&id).await?;
    Ok(Json(record.into()))
}

async fn start_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<InstanceView>> {
    let record = state.manager.start(&id).await?;
    Ok(Json(record.into()))
}

async fn stop_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<InstanceView>> {
    let record = state.manager.stop(&id).await?;
    Ok(Json(record.into()))
}

async fn reboot_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<InstanceView>> {
    let record = state.manager.reboot(&id).await?;
    Ok(Json(record.into()))
}

async fn terminate_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<InstanceView>> {
    let record = state.manager.terminate(&id).await?;
    Ok(Json(record.into()))
}

/// Remove a terminated instance's record entirely.
async fn purge_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.manager.purge(&id).await?;
    info!(%id, "instance record purged");
    Ok(StatusCode::NO_CONTENT)
}

async fn reconcile_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ReconcileReport>> {
    let report = state.manager.reconcile(&id).await?;
    Ok(Json(report))
}

async fn reconcile_all(State(state): State<AppState>) -> ApiResult<Json<Vec<ReconcileReport>>> {
    let reports = state.manager.reconcile_all().await?;
    Ok(Json(reports))
}

/// One-shot command execution: open a session, collect output, close.
async fn exec_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ExecRequest>,
) -> ApiResult<Json<ExecResponse>> {
    if req.command.is_empty() {
        return Err(ApiError(Error::Validation(
            "command must not be empty".to_string(),
        )));
    }
    let output = state.gateway.run_command(&id, req.command).await?;
    Ok(Json(ExecResponse {
        output: String::from_utf8_lossy(&output).into_owned(),
    }))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let engine = match state.runtime.ping().await {
        Ok(()) => "reachable",
        Err(_) => "unreachable",
    };
    let store = match state.manager.list().await {
        Ok(records) => serde_json::json!({ "status": "ok", "instances": records.len() }),
        Err(e) => serde_json::json!({ "status": "failed", "message": e.to_string() }),
    };
    Json(serde_json::json!({
        "status": "ok",
        "engine": engine,
        "store": store,
        "active_exec_sessions": state.gateway.active_sessions(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
