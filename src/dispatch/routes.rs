//! Lock API, dispatch, and worker lifecycle endpoints.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use super::admission::AdmissionCoordinator;
use super::lease::{AcquireOptions, LeaseManager};
use super::worker::WorkerPool;
use crate::board::model::{AgentVariant, RunFinalize};
use crate::error::DispatchError;

/// Shared state for dispatch routes.
#[derive(Clone)]
pub struct DispatchRouteState {
    pub lease: Arc<LeaseManager>,
    pub admission: Arc<AdmissionCoordinator>,
    pub workers: Arc<WorkerPool>,
}

/// Build the Lock API, dispatch, and worker routes.
pub fn dispatch_routes(
    lease: Arc<LeaseManager>,
    admission: Arc<AdmissionCoordinator>,
    workers: Arc<WorkerPool>,
) -> Router {
    Router::new()
        .route("/api/lock/acquire", post(acquire))
        .route("/api/lock/heartbeat", post(heartbeat))
        .route("/api/lock/release", post(release))
        .route("/api/lock/sweep", post(sweep))
        .route("/api/queue/status", get(queue_status))
        .route("/api/dispatch/next", post(dispatch_next))
        .route(
            "/api/workers",
            post(start_worker).get(list_workers).delete(stop_all_workers),
        )
        .route("/api/workers/queue", get(worker_queue_status))
        .route("/api/workers/{id}", delete(stop_worker))
        .with_state(DispatchRouteState {
            lease,
            admission,
            workers,
        })
}

/// Map a dispatch error to a status code and JSON body.
fn error_response(e: DispatchError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &e {
        DispatchError::TicketNotFound(_)
        | DispatchError::RunNotFound(_)
        | DispatchError::WorkerNotFound(_) => StatusCode::NOT_FOUND,
        DispatchError::LockConflict { .. }
        | DispatchError::WipLimitReached { .. }
        | DispatchError::NotClaimable { .. }
        | DispatchError::RunExists(_)
        | DispatchError::LeaseNotOwned { .. } => StatusCode::CONFLICT,
        DispatchError::NonTerminalStatus { .. } => StatusCode::BAD_REQUEST,
        DispatchError::MissingColumn { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        DispatchError::Database(_) => {
            warn!(error = %e, "Dispatch storage failure");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({ "error": e.to_string() })))
}

fn ok(value: serde_json::Value) -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(value))
}

// ── Lock API ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct AcquireRequest {
    ticket_id: Uuid,
    /// Generated when absent.
    #[serde(default)]
    run_id: Option<Uuid>,
    /// Defaults to the configured lease duration.
    #[serde(default)]
    lease_duration_secs: Option<u64>,
    #[serde(default)]
    worker_id: Option<Uuid>,
    #[serde(default)]
    agent_variant: Option<AgentVariant>,
}

async fn acquire(
    State(state): State<DispatchRouteState>,
    Json(body): Json<AcquireRequest>,
) -> impl IntoResponse {
    let lease_duration = match body.lease_duration_secs {
        Some(0) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "lease_duration_secs must be positive" })),
            );
        }
        Some(secs) => Duration::from_secs(secs),
        None => state.lease.config().lease_duration,
    };
    let opts = AcquireOptions {
        worker_id: body.worker_id,
        agent_variant: body.agent_variant,
    };
    let run_id = body.run_id.unwrap_or_else(Uuid::new_v4);
    match state
        .lease
        .acquire_with(body.ticket_id, run_id, lease_duration, opts)
        .await
    {
        Ok(claim) => ok(json!(claim)),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct HeartbeatRequest {
    run_id: Uuid,
}

async fn heartbeat(
    State(state): State<DispatchRouteState>,
    Json(body): Json<HeartbeatRequest>,
) -> impl IntoResponse {
    match state.lease.heartbeat(body.run_id).await {
        Ok(expires) => ok(json!({ "run_id": body.run_id, "lease_expires_at": expires })),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct ReleaseRequest {
    run_id: Uuid,
    #[serde(flatten)]
    finalize: RunFinalize,
}

async fn release(
    State(state): State<DispatchRouteState>,
    Json(body): Json<ReleaseRequest>,
) -> impl IntoResponse {
    match state.lease.release(body.run_id, &body.finalize).await {
        Ok(report) => ok(json!(report)),
        Err(e) => error_response(e),
    }
}

async fn sweep(State(state): State<DispatchRouteState>) -> impl IntoResponse {
    match state.lease.reclaim_sweep().await {
        Ok(records) => ok(json!({ "reclaimed": records })),
        Err(e) => error_response(e),
    }
}

async fn queue_status(State(state): State<DispatchRouteState>) -> impl IntoResponse {
    match state.workers.queue_status().await {
        Ok(status) => ok(json!(status)),
        Err(e) => error_response(e),
    }
}

// ── Dispatch ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct WorkerSpec {
    agent_variant: AgentVariant,
    #[serde(default)]
    project_id: Option<String>,
}

async fn dispatch_next(
    State(state): State<DispatchRouteState>,
    Json(body): Json<WorkerSpec>,
) -> impl IntoResponse {
    match state
        .admission
        .next(body.agent_variant, body.project_id.as_deref())
        .await
    {
        Ok(claim) => ok(json!(claim)),
        Err(e) => error_response(e),
    }
}

// ── Workers ─────────────────────────────────────────────────────────────

async fn start_worker(
    State(state): State<DispatchRouteState>,
    Json(body): Json<WorkerSpec>,
) -> impl IntoResponse {
    let info = state
        .workers
        .start_worker(body.agent_variant, body.project_id)
        .await;
    (StatusCode::CREATED, Json(json!(info)))
}

async fn list_workers(State(state): State<DispatchRouteState>) -> impl IntoResponse {
    Json(state.workers.get_workers().await)
}

async fn stop_worker(
    State(state): State<DispatchRouteState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let Ok(worker_id) = Uuid::parse_str(&id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Invalid worker ID" })),
        );
    };
    match state.workers.stop_worker(worker_id).await {
        Ok(info) => ok(json!(info)),
        Err(e) => error_response(e),
    }
}

async fn stop_all_workers(State(state): State<DispatchRouteState>) -> impl IntoResponse {
    let stopped = state.workers.stop_all_workers().await;
    Json(json!({ "stopped": stopped }))
}

async fn worker_queue_status(State(state): State<DispatchRouteState>) -> impl IntoResponse {
    match state.workers.worker_queue_status().await {
        Ok(status) => ok(json!(status)),
        Err(e) => error_response(e),
    }
}
