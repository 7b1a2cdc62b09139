//! Board REST endpoints: boards, columns, tickets, the Move API, and the event log.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::{
    AgentPreference, BoardEvent, EventFilter, EventType, Priority, Ticket, Validation,
    WorkflowState, column_for_state,
};
use super::setup::{NewColumn, add_column, create_board, load_board_state};
use super::transition::validate;
use crate::error::DatabaseError;
use crate::events::EventBus;
use crate::store::Database;

/// Default and maximum page size for the event log.
const DEFAULT_EVENT_LIMIT: usize = 100;
const MAX_EVENT_LIMIT: usize = 1000;

/// Shared state for board routes.
#[derive(Clone)]
pub struct BoardRouteState {
    pub db: Arc<dyn Database>,
    pub bus: Arc<EventBus>,
}

/// Build the board REST routes.
pub fn board_routes(db: Arc<dyn Database>, bus: Arc<EventBus>) -> Router {
    Router::new()
        .route("/api/boards", post(create_board_handler))
        .route("/api/boards/{id}", get(get_board))
        .route("/api/boards/{id}/columns", post(create_column))
        .route("/api/boards/{id}/tickets", post(create_ticket))
        .route("/api/tickets/{id}/move", post(move_ticket))
        .route("/api/events", get(list_events))
        .with_state(BoardRouteState { db, bus })
}

fn bad_request(message: &str) -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

fn not_found(message: &str) -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::NOT_FOUND, Json(json!({ "error": message })))
}

fn storage_error(e: DatabaseError) -> (StatusCode, Json<serde_json::Value>) {
    warn!(error = %e, "Board storage failure");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
}

// ── Boards ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateBoardRequest {
    name: String,
    #[serde(default)]
    columns: Vec<NewColumn>,
}

async fn create_board_handler(
    State(state): State<BoardRouteState>,
    Json(body): Json<CreateBoardRequest>,
) -> impl IntoResponse {
    if body.name.trim().is_empty() {
        return bad_request("Board name must not be empty");
    }
    match create_board(state.db.as_ref(), body.name.trim(), body.columns).await {
        Ok(created) => {
            info!(board_id = %created.board.id, columns = created.columns.len(), "Board created");
            (StatusCode::CREATED, Json(json!(created)))
        }
        Err(e) => storage_error(e),
    }
}

async fn get_board(State(state): State<BoardRouteState>, Path(id): Path<String>) -> impl IntoResponse {
    let Ok(board_id) = Uuid::parse_str(&id) else {
        return bad_request("Invalid board ID");
    };
    match load_board_state(state.db.as_ref(), board_id).await {
        Ok(Some(board)) => (StatusCode::OK, Json(json!(board))),
        Ok(None) => not_found("Board not found"),
        Err(e) => storage_error(e),
    }
}

async fn create_column(
    State(state): State<BoardRouteState>,
    Path(id): Path<String>,
    Json(body): Json<NewColumn>,
) -> impl IntoResponse {
    let Ok(board_id) = Uuid::parse_str(&id) else {
        return bad_request("Invalid board ID");
    };
    if body.name.trim().is_empty() {
        return bad_request("Column name must not be empty");
    }
    match state.db.get_board(board_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found("Board not found"),
        Err(e) => return storage_error(e),
    }
    match add_column(state.db.as_ref(), board_id, body).await {
        Ok(column) => (StatusCode::CREATED, Json(json!(column))),
        Err(e) => storage_error(e),
    }
}

// ── Tickets ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateTicketRequest {
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    priority: Priority,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    project_id: Option<String>,
    #[serde(default)]
    agent_preference: AgentPreference,
    /// Defaults to the board's Backlog column.
    #[serde(default)]
    column_id: Option<Uuid>,
}

async fn create_ticket(
    State(state): State<BoardRouteState>,
    Path(id): Path<String>,
    Json(body): Json<CreateTicketRequest>,
) -> impl IntoResponse {
    let Ok(board_id) = Uuid::parse_str(&id) else {
        return bad_request("Invalid board ID");
    };
    if body.title.trim().is_empty() {
        return bad_request("Ticket title must not be empty");
    }

    let columns = match state.db.get_board(board_id).await {
        Ok(Some(_)) => match state.db.list_columns(board_id).await {
            Ok(columns) => columns,
            Err(e) => return storage_error(e),
        },
        Ok(None) => return not_found("Board not found"),
        Err(e) => return storage_error(e),
    };

    let column_id = match body.column_id {
        Some(column_id) if columns.iter().any(|c| c.id == column_id) => column_id,
        Some(_) => return bad_request("Column does not belong to this board"),
        None => match column_for_state(&columns, WorkflowState::Backlog).or(columns.first()) {
            Some(column) => column.id,
            None => return bad_request("Board has no columns"),
        },
    };

    let mut ticket = Ticket::new(board_id, column_id, body.title.trim())
        .with_priority(body.priority)
        .with_labels(body.labels)
        .with_agent_preference(body.agent_preference);
    ticket.description = body.description;
    ticket.project_id = body.project_id;

    if let Err(e) = state.db.create_ticket(&ticket).await {
        return storage_error(e);
    }
    info!(ticket_id = %ticket.id, board_id = %board_id, "Ticket created");
    state
        .bus
        .emit(
            BoardEvent::new(EventType::TicketCreated)
                .for_ticket(&ticket)
                .with_payload(json!({ "column_id": column_id, "title": ticket.title })),
        )
        .await;
    (StatusCode::CREATED, Json(json!(ticket)))
}

// ── Move API ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct MoveRequest {
    column_id: Uuid,
}

/// Validate and commit a user-initiated move.
///
/// Rejections are returned as `Ok` with `valid: false`; only storage
/// failures and unknown tickets are errors.
pub async fn apply_move(
    db: &dyn Database,
    bus: &EventBus,
    ticket_id: Uuid,
    target_column_id: Uuid,
) -> Result<Option<Validation>, DatabaseError> {
    let Some(ticket) = db.get_ticket(ticket_id).await? else {
        return Ok(None);
    };
    let columns = db.list_columns(ticket.board_id).await?;

    let verdict = validate(&ticket, &columns, target_column_id);
    if !verdict.valid {
        debug!(ticket_id = %ticket_id, reason = ?verdict.reason, "Move rejected");
        return Ok(Some(verdict));
    }
    if ticket.column_id == target_column_id {
        return Ok(Some(verdict));
    }
    // Only acquire, release and reclaim may move a locked ticket.
    if let Some(lock) = &ticket.lock {
        debug!(ticket_id = %ticket_id, run_id = %lock.run_id, "Move of a locked ticket refused");
        return Ok(Some(Validation::deny(format!(
            "ticket is locked by run {}; release it before moving",
            lock.run_id
        ))));
    }

    if !db
        .move_ticket(ticket_id, ticket.version, target_column_id, Utc::now())
        .await?
    {
        debug!(ticket_id = %ticket_id, "Move lost a race with a concurrent write");
        return Ok(Some(Validation::deny("ticket changed concurrently")));
    }

    bus.emit(
        BoardEvent::new(EventType::TicketMoved)
            .for_ticket(&ticket)
            .with_payload(json!({
                "from_column_id": ticket.column_id,
                "to_column_id": target_column_id,
            })),
    )
    .await;
    Ok(Some(verdict))
}

async fn move_ticket(
    State(state): State<BoardRouteState>,
    Path(id): Path<String>,
    Json(body): Json<MoveRequest>,
) -> impl IntoResponse {
    let Ok(ticket_id) = Uuid::parse_str(&id) else {
        return bad_request("Invalid ticket ID");
    };
    match apply_move(state.db.as_ref(), &state.bus, ticket_id, body.column_id).await {
        Ok(Some(verdict)) => (StatusCode::OK, Json(json!(verdict))),
        Ok(None) => not_found("Ticket not found"),
        Err(e) => storage_error(e),
    }
}

// ── Event log ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct EventQuery {
    #[serde(default, rename = "type")]
    event_type: Option<EventType>,
    #[serde(default)]
    ticket_id: Option<Uuid>,
    #[serde(default)]
    run_id: Option<Uuid>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn list_events(
    State(state): State<BoardRouteState>,
    Query(query): Query<EventQuery>,
) -> impl IntoResponse {
    let filter = EventFilter {
        event_type: query.event_type,
        ticket_id: query.ticket_id,
        run_id: query.run_id,
    };
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_LIMIT).min(MAX_EVENT_LIMIT);
    match state.bus.history(&filter, limit).await {
        Ok(events) => (StatusCode::OK, Json(json!(events))),
        Err(e) => storage_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::model::TicketLock;
    use crate::dispatch::test_support::{Harness, column};

    #[tokio::test]
    async fn valid_move_commits_and_emits() {
        let h = Harness::new().await;
        let state = h.board().await;
        let ticket = h.ticket(&state, WorkflowState::Backlog, "t").await;
        let mut sub = h.bus.subscribe(EventFilter::default());

        let ready = column(&state, WorkflowState::Ready);
        let verdict = apply_move(h.db.as_ref(), &h.bus, ticket.id, ready)
            .await
            .unwrap()
            .unwrap();
        assert!(verdict.valid);

        let stored = h.db.get_ticket(ticket.id).await.unwrap().unwrap();
        assert_eq!(stored.column_id, ready);
        assert_eq!(stored.version, ticket.version + 1);
        let event = sub.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::TicketMoved);
        assert_eq!(event.ticket_id, Some(ticket.id));
    }

    #[tokio::test]
    async fn invalid_move_leaves_ticket_alone() {
        let h = Harness::new().await;
        let state = h.board().await;
        let ticket = h.ticket(&state, WorkflowState::Backlog, "t").await;

        let done = column(&state, WorkflowState::Done);
        let verdict = apply_move(h.db.as_ref(), &h.bus, ticket.id, done)
            .await
            .unwrap()
            .unwrap();
        assert!(!verdict.valid);
        assert_eq!(verdict.reason.as_deref(), Some("cannot move from Backlog to Done"));
        let stored = h.db.get_ticket(ticket.id).await.unwrap().unwrap();
        assert_eq!(stored.column_id, ticket.column_id);
    }

    #[tokio::test]
    async fn locked_ticket_cannot_be_dragged_out() {
        let h = Harness::new().await;
        let state = h.board().await;
        let ticket = h.ticket(&state, WorkflowState::Ready, "t").await;
        let claim = h
            .lease
            .acquire(ticket.id, Uuid::new_v4(), h.lease.config().lease_duration)
            .await
            .unwrap();
        assert_eq!(
            claim.ticket.lock,
            Some(TicketLock {
                run_id: claim.run_id,
                lease_expires_at: claim.lease_expires_at
            })
        );

        let blocked = column(&state, WorkflowState::Blocked);
        let verdict = apply_move(h.db.as_ref(), &h.bus, ticket.id, blocked)
            .await
            .unwrap()
            .unwrap();
        assert!(!verdict.valid);
        assert!(verdict.reason.unwrap().contains("locked"));
    }

    #[tokio::test]
    async fn locked_ticket_cannot_move_to_custom_column() {
        let h = Harness::new().await;
        let state = h.board().await;
        let qa = add_column(h.db.as_ref(), state.board.id, NewColumn::new("QA Lane"))
            .await
            .unwrap();
        let ticket = h.ticket(&state, WorkflowState::Ready, "t").await;
        let claim = h
            .lease
            .acquire(ticket.id, Uuid::new_v4(), h.lease.config().lease_duration)
            .await
            .unwrap();

        let verdict = apply_move(h.db.as_ref(), &h.bus, ticket.id, qa.id)
            .await
            .unwrap()
            .unwrap();
        assert!(!verdict.valid);
        assert!(verdict.reason.unwrap().contains("locked"));

        let stored = h.db.get_ticket(ticket.id).await.unwrap().unwrap();
        assert_eq!(stored.column_id, column(&state, WorkflowState::InProgress));
        assert_eq!(stored.lock.map(|l| l.run_id), Some(claim.run_id));
    }

    #[tokio::test]
    async fn unknown_ticket_is_none() {
        let h = Harness::new().await;
        let result = apply_move(h.db.as_ref(), &h.bus, Uuid::new_v4(), Uuid::new_v4())
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
