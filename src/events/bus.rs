//! Event bus — persists lifecycle events and fans them out to subscribers.
//!
//! Delivery is best-effort: a subscriber that falls behind the broadcast
//! buffer gets a single `resync` event instead of the missed ones.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::board::model::{BoardEvent, EventFilter, EventType};
use crate::error::DatabaseError;
use crate::store::Database;

/// Default broadcast buffer per bus.
pub const DEFAULT_CAPACITY: usize = 256;

/// Lifecycle event fan-out backed by the append-only event log.
pub struct EventBus {
    db: Arc<dyn Database>,
    tx: broadcast::Sender<BoardEvent>,
}

impl EventBus {
    pub fn new(db: Arc<dyn Database>) -> Arc<Self> {
        Self::with_capacity(db, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(db: Arc<dyn Database>, capacity: usize) -> Arc<Self> {
        let (tx, _) = broadcast::channel(capacity);
        Arc::new(Self { db, tx })
    }

    /// Append to the event log, then broadcast.
    ///
    /// Neither step can fail the caller: the state change that produced the
    /// event has already been committed.
    pub async fn emit(&self, event: BoardEvent) {
        if let Err(e) = self.db.append_event(&event).await {
            warn!(
                event_type = event.event_type.as_str(),
                error = %e,
                "Failed to persist event"
            );
        }
        debug!(
            event_type = event.event_type.as_str(),
            ticket_id = ?event.ticket_id,
            run_id = ?event.run_id,
            "Event emitted"
        );
        // No receivers is fine.
        let _ = self.tx.send(event);
    }

    /// Subscribe with a server-side filter.
    pub fn subscribe(&self, filter: EventFilter) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
            filter,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Persisted events, newest first.
    pub async fn history(
        &self,
        filter: &EventFilter,
        limit: usize,
    ) -> Result<Vec<BoardEvent>, DatabaseError> {
        self.db.list_events(filter, limit).await
    }
}

/// A filtered view of the bus.
pub struct EventSubscription {
    rx: broadcast::Receiver<BoardEvent>,
    filter: EventFilter,
}

impl EventSubscription {
    /// Next matching event, or a `resync` event after lag.
    ///
    /// Returns `None` once the bus is dropped.
    pub async fn recv(&mut self) -> Option<BoardEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Event subscriber lagged behind broadcast");
                    return Some(
                        BoardEvent::new(EventType::Resync).with_payload(json!({ "missed": missed })),
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
