//! Unified `Database` trait — single async interface for all persistence.
//!
//! Column and lock fields on a ticket are only ever written through the
//! conditional methods here (`move_ticket`, `claim_ticket`, `extend_lease`,
//! `release_ticket`, `reclaim_ticket`). Each one is a single UPDATE guarded by
//! the row's current `version` or lock owner, and reports whether it won.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::board::model::{Board, BoardEvent, Column, EventFilter, Run, RunFinalize, Ticket};
use crate::error::DatabaseError;

/// Parameters for the claim compare-and-swap.
#[derive(Debug, Clone)]
pub struct ClaimWrite {
    pub ticket_id: Uuid,
    /// Version observed when the claim was decided.
    pub expected_version: i64,
    pub run_id: Uuid,
    pub lease_expires_at: DateTime<Utc>,
    /// Active-work column the ticket moves into.
    pub active_column_id: Uuid,
    /// Enforced inside the same statement when set.
    pub wip_limit: Option<u32>,
    pub now: DateTime<Utc>,
}

/// Backend-agnostic database trait covering boards, tickets, runs, and events.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Boards ──────────────────────────────────────────────────────

    async fn create_board(&self, board: &Board) -> Result<(), DatabaseError>;

    async fn get_board(&self, id: Uuid) -> Result<Option<Board>, DatabaseError>;

    async fn list_boards(&self) -> Result<Vec<Board>, DatabaseError>;

    async fn create_column(&self, column: &Column) -> Result<(), DatabaseError>;

    /// Columns of a board ordered by position.
    async fn list_columns(&self, board_id: Uuid) -> Result<Vec<Column>, DatabaseError>;

    // ── Tickets ─────────────────────────────────────────────────────

    async fn create_ticket(&self, ticket: &Ticket) -> Result<(), DatabaseError>;

    async fn get_ticket(&self, id: Uuid) -> Result<Option<Ticket>, DatabaseError>;

    /// Tickets of a board, oldest first.
    async fn list_tickets(&self, board_id: Uuid) -> Result<Vec<Ticket>, DatabaseError>;

    /// The ticket currently locked by `run_id`, if any.
    async fn find_ticket_by_run(&self, run_id: Uuid) -> Result<Option<Ticket>, DatabaseError>;

    async fn count_tickets_in_column(&self, column_id: Uuid) -> Result<u32, DatabaseError>;

    /// Move an unlocked ticket. Fails if the version moved on or a lock is held.
    async fn move_ticket(
        &self,
        id: Uuid,
        expected_version: i64,
        column_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Take the lock and move into the active column in one statement.
    ///
    /// Wins only if the version is unchanged, the current lock is absent or
    /// expired, and the WIP limit (if any) leaves room.
    async fn claim_ticket(&self, claim: &ClaimWrite) -> Result<bool, DatabaseError>;

    /// Push the lease of the lock held by `run_id` out to `lease_expires_at`.
    async fn extend_lease(
        &self,
        run_id: Uuid,
        lease_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Clear the lock held by `run_id`, move to `column_id`, reset reclaim count.
    async fn release_ticket(
        &self,
        ticket_id: Uuid,
        run_id: Uuid,
        column_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Clear an orphaned lock observed at `expected_version`.
    async fn reclaim_ticket(
        &self,
        ticket_id: Uuid,
        expected_version: i64,
        column_id: Uuid,
        reclaim_count: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Locked tickets whose lease ended before `cutoff`.
    async fn list_expired_locks(&self, cutoff: DateTime<Utc>) -> Result<Vec<Ticket>, DatabaseError>;

    // ── Runs ────────────────────────────────────────────────────────

    async fn insert_run(&self, run: &Run) -> Result<(), DatabaseError>;

    async fn get_run(&self, id: Uuid) -> Result<Option<Run>, DatabaseError>;

    /// Runs of a ticket, newest first.
    async fn list_runs_for_ticket(&self, ticket_id: Uuid) -> Result<Vec<Run>, DatabaseError>;

    async fn record_heartbeat(&self, run_id: Uuid, at: DateTime<Utc>) -> Result<(), DatabaseError>;

    /// Write terminal fields if the run is not terminal yet.
    async fn finalize_run(
        &self,
        run_id: Uuid,
        finalize: &RunFinalize,
        ended_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    // ── Events ──────────────────────────────────────────────────────

    async fn append_event(&self, event: &BoardEvent) -> Result<(), DatabaseError>;

    /// Matching events, newest first.
    async fn list_events(
        &self,
        filter: &EventFilter,
        limit: usize,
    ) -> Result<Vec<BoardEvent>, DatabaseError>;
}
