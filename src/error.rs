//! Error types for Agent Board.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Reconcile error: {0}")]
    Reconcile(#[from] ReconcileError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors raised by the lock/lease manager and the admission coordinator.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Another run holds a live lease, or the ticket changed under us.
    #[error("Ticket {ticket_id} is locked by another run")]
    LockConflict { ticket_id: Uuid },

    #[error("Column {column_id} is at its WIP limit ({limit})")]
    WipLimitReached { column_id: Uuid, limit: u32 },

    #[error("Ticket {ticket_id} cannot be claimed from state {state}")]
    NotClaimable { ticket_id: Uuid, state: String },

    #[error("Run status {status} is not terminal; expected finished, error, or aborted")]
    NonTerminalStatus { status: String },

    #[error("Run {0} already exists")]
    RunExists(Uuid),

    #[error("Run {run_id} does not own a lease")]
    LeaseNotOwned { run_id: Uuid },

    #[error("Board {board_id} has no {state} column")]
    MissingColumn { board_id: Uuid, state: String },

    #[error("Ticket {0} not found")]
    TicketNotFound(Uuid),

    #[error("Run {0} not found")]
    RunNotFound(Uuid),

    #[error("Worker {0} not found")]
    WorkerNotFound(Uuid),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl DispatchError {
    /// Lost a race for a ticket; the caller should move on to the next candidate.
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            Self::LockConflict { .. } | Self::WipLimitReached { .. } | Self::NotClaimable { .. }
        )
    }
}

/// Event stream channel errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to connect to {url}: {reason}")]
    ConnectFailed { url: String, reason: String },

    #[error("Stream disconnected: {reason}")]
    Disconnected { reason: String },

    #[error("Gave up after {attempts} reconnect attempts ({delay:?} apart)")]
    RetriesExhausted { attempts: u32, delay: Duration },

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),
}

/// Errors surfaced by the optimistic reconciler.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// The authoritative side refused the transition.
    #[error("Move rejected: {reason}")]
    Rejected { reason: String },

    /// The authoritative side could not be reached.
    #[error("Network error: {0}")]
    Network(String),

    #[error("Ticket {0} is not on the displayed board")]
    UnknownTicket(Uuid),
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
