//! Column transition rules for user-initiated moves.
//!
//! Pure and lock-free: safe to call from any number of tasks at once.

use uuid::Uuid;

use super::model::{Column, Ticket, Validation, WorkflowState};

impl WorkflowState {
    /// Static transition table. Staying in place is always allowed.
    pub fn can_transition_to(&self, target: WorkflowState) -> bool {
        use WorkflowState::*;

        if *self == target {
            return true;
        }

        matches!(
            (self, target),
            (Backlog, Ready)
                | (Ready, Backlog)
                | (InProgress, Ready)
                | (InProgress, Blocked)
                | (Blocked, Ready)
                | (Blocked, Backlog)
                | (Review, Done)
                | (Review, Blocked)
                | (Review, Ready)
                | (Review, InProgress)
                | (Done, Review)
        )
    }
}

/// Check whether `ticket` may move into `target_column_id`.
///
/// Custom column names (anything that does not normalize to a canonical
/// state) are always allowed through; the backend is the final authority.
pub fn validate(ticket: &Ticket, columns: &[Column], target_column_id: Uuid) -> Validation {
    let current = columns.iter().find(|c| c.id == ticket.column_id);
    let target = columns.iter().find(|c| c.id == target_column_id);

    let (Some(current), Some(target)) = (current, target) else {
        return Validation::deny("column not found");
    };

    let (Some(from), Some(to)) = (current.state(), target.state()) else {
        return Validation::ok();
    };

    if from == to {
        return Validation::ok();
    }

    if from == WorkflowState::InProgress {
        if let Some(lock) = &ticket.lock {
            return Validation::deny(format!(
                "ticket is locked by run {}; release it before moving",
                lock.run_id
            ));
        }
    }

    if from.can_transition_to(to) {
        Validation::ok()
    } else {
        Validation::deny(format!("cannot move from {from} to {to}"))
    }
}
