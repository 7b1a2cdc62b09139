//! Admission coordinator — picks the ticket an idle worker should claim.
//!
//! Selection is plain synchronous logic over a snapshot; the claim itself
//! goes through [`LeaseManager`], so losing a race to another poller only
//! moves us on to the next candidate.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::lease::{AcquireOptions, LeaseManager};
use crate::board::model::{AgentVariant, Claim, Ticket, WorkflowState, column_for_state};
use crate::error::DispatchError;
use crate::store::Database;

/// Ticket counts for the Lock API queue status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub ready_count: u32,
    pub in_progress_count: u32,
}

/// Whether a worker of `variant` (restricted to `project`, if set) may take `ticket`.
pub fn is_eligible(ticket: &Ticket, variant: AgentVariant, project: Option<&str>) -> bool {
    ticket.agent_preference.accepts(variant)
        && project.is_none_or(|p| ticket.project_id.as_deref() == Some(p))
}

/// Highest priority first, oldest first within a priority.
pub fn rank_candidates(candidates: &mut [Ticket]) {
    candidates.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
}

pub struct AdmissionCoordinator {
    db: Arc<dyn Database>,
    lease: Arc<LeaseManager>,
}

impl AdmissionCoordinator {
    pub fn new(db: Arc<dyn Database>, lease: Arc<LeaseManager>) -> Self {
        Self { db, lease }
    }

    /// Claim the best eligible Ready ticket, or `None` if there is nothing to take.
    pub async fn next(
        &self,
        variant: AgentVariant,
        project: Option<&str>,
    ) -> Result<Option<Claim>, DispatchError> {
        self.next_for_worker(variant, project, None).await
    }

    /// [`next`](Self::next) with the claiming worker recorded on the run.
    pub async fn next_for_worker(
        &self,
        variant: AgentVariant,
        project: Option<&str>,
        worker_id: Option<Uuid>,
    ) -> Result<Option<Claim>, DispatchError> {
        let mut candidates = self.candidates(variant, project).await?;
        if candidates.is_empty() {
            return Ok(None);
        }
        rank_candidates(&mut candidates);

        let opts = AcquireOptions {
            worker_id,
            agent_variant: Some(variant),
        };
        let lease_duration = self.lease.config().lease_duration;

        for ticket in candidates {
            match self
                .lease
                .acquire_with(ticket.id, Uuid::new_v4(), lease_duration, opts)
                .await
            {
                Ok(claim) => return Ok(Some(claim)),
                Err(e) if e.is_contention() || matches!(e, DispatchError::TicketNotFound(_)) => {
                    debug!(ticket_id = %ticket.id, reason = %e, "Candidate unavailable, trying next");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Ready tickets on boards whose active column still has room.
    async fn candidates(
        &self,
        variant: AgentVariant,
        project: Option<&str>,
    ) -> Result<Vec<Ticket>, DispatchError> {
        let mut candidates = Vec::new();
        for board in self.db.list_boards().await? {
            let columns = self.db.list_columns(board.id).await?;
            let (Some(ready), Some(active)) = (
                column_for_state(&columns, WorkflowState::Ready),
                column_for_state(&columns, WorkflowState::InProgress),
            ) else {
                continue;
            };

            let tickets = self.db.list_tickets(board.id).await?;
            if let Some(limit) = active.wip_limit {
                let occupied = tickets.iter().filter(|t| t.column_id == active.id).count();
                if occupied >= limit as usize {
                    debug!(board_id = %board.id, limit, "Active column full, skipping board");
                    continue;
                }
            }

            candidates.extend(
                tickets
                    .into_iter()
                    .filter(|t| t.column_id == ready.id && is_eligible(t, variant, project)),
            );
        }
        Ok(candidates)
    }

    /// Tickets waiting in Ready and occupying In Progress, across all boards.
    pub async fn queue_counts(&self) -> Result<QueueCounts, DispatchError> {
        let mut counts = QueueCounts::default();
        for board in self.db.list_boards().await? {
            let columns = self.db.list_columns(board.id).await?;
            if let Some(ready) = column_for_state(&columns, WorkflowState::Ready) {
                counts.ready_count += self.db.count_tickets_in_column(ready.id).await?;
            }
            if let Some(active) = column_for_state(&columns, WorkflowState::InProgress) {
                counts.in_progress_count += self.db.count_tickets_in_column(active.id).await?;
            }
        }
        Ok(counts)
    }
}
