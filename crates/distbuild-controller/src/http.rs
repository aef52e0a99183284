//! Loopback HTTP surface for booster clients.
//!
//! Provides endpoints for:
//! - Work registration (`/api/v1/work/register`)
//! - Toolchain registration (`/api/v1/work/{id}/toolchain`)
//! - Heartbeats (`/api/v1/work/{id}/heartbeat`)
//! - Status (`/api/v1/work/{id}/status`)
//! - Release (`/api/v1/work/{id}/release`)
//! - Action execution (`/api/v1/work/{id}/execute`)
//! - Health check (`/api/v1/health`)

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::{Any, CorsLayer};
use tracing::debug;

use distbuild_core::protocol::{
    code, ExecuteRequest, ExecuteResponse, RegisterWorkRequest, RegisterWorkResponse,
    ReleaseWorkRequest, SetToolchainRequest, WorkHeartbeatRequest, WorkHeartbeatResponse,
    WorkerChanged,
};
use distbuild_core::{ControllerConfig, ErrorKind, WorkId};

use crate::dispatch::Dispatcher;
use crate::remote::{Dialer, HttpDialer};
use crate::slots::SlotPool;
use crate::work::WorkManager;

/// Shared state behind every handler.
pub struct ControllerState {
    pub cfg: ControllerConfig,
    pub pool: Arc<SlotPool>,
    pub works: Arc<WorkManager>,
    pub dispatcher: Dispatcher,
}

impl ControllerState {
    /// Build the full state from config, deriving the slot budget from the
    /// host CPU count and wiring the default HTTP dialer.
    pub fn new(cfg: ControllerConfig) -> Arc<Self> {
        let ncpu = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let dialer: Arc<dyn Dialer> =
            Arc::new(HttpDialer::new(Duration::from_secs(5)).expect("http client"));
        Self::with_dialer(cfg, ncpu, dialer)
    }

    /// State with an explicit dialer and CPU count, for tests and embedding.
    pub fn with_dialer(cfg: ControllerConfig, ncpu: usize, dialer: Arc<dyn Dialer>) -> Arc<Self> {
        let pool = SlotPool::new(cfg.slot_budget(ncpu));
        let works = WorkManager::new(cfg.clone());
        let dispatcher = Dispatcher::new(cfg.clone(), pool.clone(), dialer);
        Arc::new(Self {
            cfg,
            pool,
            works,
            dispatcher,
        })
    }
}

/// Create the HTTP router.
pub fn create_router(state: Arc<ControllerState>) -> Router {
    // CORS layer for local status tooling
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/work/register", post(register_work))
        .route("/api/v1/work/:id/toolchain", post(set_toolchain))
        .route("/api/v1/work/:id/heartbeat", post(heartbeat))
        .route("/api/v1/work/:id/status", get(work_status))
        .route("/api/v1/work/:id/release", post(release_work))
        .route("/api/v1/work/:id/execute", post(execute))
        .route("/api/v1/health", get(health_check))
        .layer(cors)
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    "ok"
}

async fn register_work(
    State(state): State<Arc<ControllerState>>,
    Json(req): Json<RegisterWorkRequest>,
) -> Json<RegisterWorkResponse> {
    let work_id = state.works.register(&req).await;
    Json(RegisterWorkResponse { work_id })
}

async fn set_toolchain(
    State(state): State<Arc<ControllerState>>,
    Path(id): Path<String>,
    Json(req): Json<SetToolchainRequest>,
) -> impl IntoResponse {
    let id = WorkId::new(id);
    match state.works.set_toolchain(&id, req.digest).await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({"ok": true}))),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"ok": false, "message": e.to_string()})),
        ),
    }
}

async fn heartbeat(
    State(state): State<Arc<ControllerState>>,
    Path(id): Path<String>,
    Json(_req): Json<WorkHeartbeatRequest>,
) -> Json<WorkHeartbeatResponse> {
    let id = WorkId::new(id);
    let alive = state.works.heartbeat(&id).await.is_ok();
    debug!(work_id = %id, alive, "heartbeat");
    Json(WorkHeartbeatResponse { work_id: id, alive })
}

async fn work_status(
    State(state): State<Arc<ControllerState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let id = WorkId::new(id);
    match state.works.status(&id).await {
        Ok(status) => (StatusCode::OK, Json(serde_json::json!(status))),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"message": e.to_string()})),
        ),
    }
}

async fn release_work(
    State(state): State<Arc<ControllerState>>,
    Path(id): Path<String>,
    Json(req): Json<ReleaseWorkRequest>,
) -> Json<serde_json::Value> {
    let id = WorkId::new(id);
    state.works.release(&id, req.success).await;
    Json(serde_json::json!({"ok": true}))
}

async fn execute(
    State(state): State<Arc<ControllerState>>,
    Path(id): Path<String>,
    Json(req): Json<ExecuteRequest>,
) -> Json<ExecuteResponse> {
    let id = WorkId::new(id);
    let (registry, cancel) = match state.works.resolve(&id).await {
        Ok(parts) => parts,
        Err(_) => {
            // hand the executor the replacement id so it can self-heal
            let message = match state.works.current_work_id().await {
                Some(new_work_id) => WorkerChanged { new_work_id }.encode("work not found"),
                None => "work not found".to_string(),
            };
            return Json(ExecuteResponse {
                code: code::WORK_NOT_FOUND,
                exit_code: distbuild_core::exit::GENERIC,
                error: ErrorKind::WorkMissing,
                stdout: String::new(),
                stderr: String::new(),
                message,
            });
        }
    };

    Json(state.dispatcher.execute(&registry, &cancel, &req).await)
}
