//! Service wiring: shared components and the merged HTTP router.

use std::sync::Arc;
use std::time::Duration;

use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::CorsLayer;

use crate::board::board_routes;
use crate::config::BoardConfig;
use crate::dispatch::{
    AdmissionCoordinator, AgentExecutor, LeaseManager, WorkerPool, dispatch_routes,
};
use crate::error::Result;
use crate::events::{EventBus, event_routes};
use crate::store::{Database, LibSqlBackend};

/// Every long-lived component of a running board service.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn Database>,
    pub bus: Arc<EventBus>,
    pub lease: Arc<LeaseManager>,
    pub admission: Arc<AdmissionCoordinator>,
    pub workers: Arc<WorkerPool>,
    pub keepalive: Duration,
}

impl AppState {
    /// Validate `config`, open the database at `config.db_path`, and build
    /// the component graph on it.
    pub async fn open(config: &BoardConfig, executor: Arc<dyn AgentExecutor>) -> Result<Self> {
        config.validate()?;
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&config.db_path).await?);
        Ok(Self::new(db, config, executor))
    }

    /// Build the component graph on top of an initialized database.
    pub fn new(db: Arc<dyn Database>, config: &BoardConfig, executor: Arc<dyn AgentExecutor>) -> Self {
        let bus = EventBus::new(Arc::clone(&db));
        let lease = Arc::new(LeaseManager::new(
            Arc::clone(&db),
            Arc::clone(&bus),
            config.lease.clone(),
        ));
        let admission = Arc::new(AdmissionCoordinator::new(Arc::clone(&db), Arc::clone(&lease)));
        let workers = Arc::new(WorkerPool::new(
            Arc::clone(&lease),
            Arc::clone(&admission),
            Arc::clone(&bus),
            executor,
            config.worker(),
        ));
        Self {
            db,
            bus,
            lease,
            admission,
            workers,
            keepalive: config.keepalive_interval,
        }
    }
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "agent-board"
    }))
}

/// Merge the board, dispatch, and event routes behind a permissive CORS layer.
pub fn build_router(state: &AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(board_routes(Arc::clone(&state.db), Arc::clone(&state.bus)))
        .merge(dispatch_routes(
            Arc::clone(&state.lease),
            Arc::clone(&state.admission),
            Arc::clone(&state.workers),
        ))
        .merge(event_routes(Arc::clone(&state.bus), state.keepalive))
        .layer(CorsLayer::permissive())
}
