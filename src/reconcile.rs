//! Optimistic reconciler — the consumer-side view of a board.
//!
//! Moves are applied locally first and confirmed against the authoritative
//! Move API afterwards; a rejection or network failure reverts the ticket to
//! the column it held before. Lifecycle events are treated as invalidation
//! signals only: a burst of them triggers one full reload, never a partial
//! patch.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::board::model::{BoardEvent, BoardState, EventType, Validation};
use crate::error::ReconcileError;

/// The authoritative board operations the reconciler depends on.
#[async_trait]
pub trait BoardApi: Send + Sync {
    async fn load_board(&self, board_id: Uuid) -> Result<BoardState, ReconcileError>;

    /// Ask the authority to move a ticket. A refusal is `Ok` with `valid: false`.
    async fn move_ticket(
        &self,
        ticket_id: Uuid,
        column_id: Uuid,
    ) -> Result<Validation, ReconcileError>;
}

/// [`BoardApi`] over the board's HTTP surface.
pub struct HttpBoardApi {
    base_url: String,
    client: reqwest::Client,
}

impl HttpBoardApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

fn network(e: reqwest::Error) -> ReconcileError {
    ReconcileError::Network(e.to_string())
}

#[async_trait]
impl BoardApi for HttpBoardApi {
    async fn load_board(&self, board_id: Uuid) -> Result<BoardState, ReconcileError> {
        let resp = self
            .client
            .get(self.url(&format!("/api/boards/{board_id}")))
            .send()
            .await
            .map_err(network)?;
        if !resp.status().is_success() {
            return Err(ReconcileError::Network(format!(
                "load board returned {}",
                resp.status()
            )));
        }
        resp.json::<BoardState>().await.map_err(network)
    }

    async fn move_ticket(
        &self,
        ticket_id: Uuid,
        column_id: Uuid,
    ) -> Result<Validation, ReconcileError> {
        let resp = self
            .client
            .post(self.url(&format!("/api/tickets/{ticket_id}/move")))
            .json(&serde_json::json!({ "column_id": column_id }))
            .send()
            .await
            .map_err(network)?;

        let status = resp.status();
        if status.is_success() {
            return resp.json::<Validation>().await.map_err(network);
        }
        if status.is_client_error() {
            let body: serde_json::Value = resp.json().await.unwrap_or_default();
            let reason = body["error"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| status.to_string());
            return Ok(Validation::deny(reason));
        }
        Err(ReconcileError::Network(format!("move returned {status}")))
    }
}

/// Whether an event should invalidate the displayed board.
///
/// Heartbeats and worker lifecycle events never change board layout.
pub fn is_relevant(event: &BoardEvent, state: &BoardState) -> bool {
    match event.event_type {
        EventType::RunHeartbeat | EventType::WorkerStarted | EventType::WorkerStopped => false,
        EventType::Resync => true,
        _ => match (event.board_id, event.ticket_id) {
            (Some(board_id), _) => board_id == state.board.id,
            (None, Some(ticket_id)) => state.ticket(ticket_id).is_some(),
            (None, None) => false,
        },
    }
}

/// Local, optimistically-updated copy of one board.
pub struct OptimisticBoard {
    api: Arc<dyn BoardApi>,
    board_id: Uuid,
    state: watch::Sender<BoardState>,
}

impl OptimisticBoard {
    /// Load the board once and start tracking it.
    pub async fn load(api: Arc<dyn BoardApi>, board_id: Uuid) -> Result<Arc<Self>, ReconcileError> {
        let initial = api.load_board(board_id).await?;
        let (state, _) = watch::channel(initial);
        Ok(Arc::new(Self {
            api,
            board_id,
            state,
        }))
    }

    pub fn board_id(&self) -> Uuid {
        self.board_id
    }

    pub fn snapshot(&self) -> BoardState {
        self.state.borrow().clone()
    }

    /// Watch every local state change (optimistic moves, reverts, reloads).
    pub fn subscribe(&self) -> watch::Receiver<BoardState> {
        self.state.subscribe()
    }

    /// Move a ticket locally, then confirm with the authority.
    ///
    /// On rejection or network failure the ticket goes back to its previous
    /// column and the error is returned. Nothing is retried.
    pub async fn move_ticket(&self, ticket_id: Uuid, column_id: Uuid) -> Result<(), ReconcileError> {
        let mut previous = None;
        self.state.send_if_modified(|state| {
            let Some(ticket) = state.tickets.iter_mut().find(|t| t.id == ticket_id) else {
                return false;
            };
            previous = Some(ticket.column_id);
            ticket.column_id = column_id;
            true
        });
        let Some(previous) = previous else {
            return Err(ReconcileError::UnknownTicket(ticket_id));
        };

        let error = match self.api.move_ticket(ticket_id, column_id).await {
            Ok(verdict) if verdict.valid => {
                debug!(ticket_id = %ticket_id, "Move confirmed");
                return Ok(());
            }
            Ok(verdict) => ReconcileError::Rejected {
                reason: verdict.reason.unwrap_or_else(|| "move rejected".to_string()),
            },
            Err(e) => e,
        };

        self.revert(ticket_id, column_id, previous);
        info!(ticket_id = %ticket_id, error = %error, "Optimistic move reverted");
        Err(error)
    }

    /// Put the ticket back unless a reload already replaced it.
    fn revert(&self, ticket_id: Uuid, optimistic: Uuid, previous: Uuid) {
        self.state.send_if_modified(|state| {
            match state.tickets.iter_mut().find(|t| t.id == ticket_id) {
                Some(ticket) if ticket.column_id == optimistic => {
                    ticket.column_id = previous;
                    true
                }
                _ => false,
            }
        });
    }

    /// Replace local state with the authoritative board.
    pub async fn reload(&self) -> Result<(), ReconcileError> {
        let fresh = self.api.load_board(self.board_id).await?;
        self.state.send_replace(fresh);
        Ok(())
    }

    /// Reload on relevant events, coalescing bursts into a single reload.
    ///
    /// Ends when the event sender is dropped.
    pub fn spawn_invalidation_loop(
        self: Arc<Self>,
        mut events: mpsc::Receiver<BoardEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let mut stale = self.is_stale(&event);
                while let Ok(next) = events.try_recv() {
                    stale |= self.is_stale(&next);
                }
                if !stale {
                    continue;
                }
                if let Err(e) = self.reload().await {
                    warn!(board_id = %self.board_id, error = %e, "Board reload failed");
                }
            }
            debug!(board_id = %self.board_id, "Invalidation loop finished");
        })
    }

    fn is_stale(&self, event: &BoardEvent) -> bool {
        is_relevant(event, &self.state.borrow())
    }
}
