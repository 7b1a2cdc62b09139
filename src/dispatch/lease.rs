//! Lock/lease manager — the only writer of a ticket's lock fields.
//!
//! Every state change is a single conditional UPDATE on the ticket row, so
//! two callers racing for the same ticket are linearized by the database:
//! exactly one UPDATE matches and the other reports zero rows.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::board::model::{
    AgentVariant, BoardEvent, Claim, Column, EventType, ReleaseOutcome, Run, RunFinalize,
    RunStatus, Ticket, TicketLock, WorkflowState, column_for_state,
};
use crate::config::LeaseConfig;
use crate::error::DispatchError;
use crate::events::EventBus;
use crate::store::{ClaimWrite, Database};

/// Who is claiming, recorded on the run.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcquireOptions {
    pub worker_id: Option<Uuid>,
    pub agent_variant: Option<AgentVariant>,
}

/// Result of a release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseReport {
    pub run_id: Uuid,
    pub ticket_id: Uuid,
    pub outcome: ReleaseOutcome,
    /// Column the ticket landed in; `None` when nothing changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_id: Option<Uuid>,
    /// The run was already terminal and the call was a no-op.
    pub already_finalized: bool,
}

/// One lock recovered by the sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReclaimRecord {
    pub ticket_id: Uuid,
    pub prior_run_id: Uuid,
    pub destination: WorkflowState,
    pub reclaim_count: u32,
}

pub struct LeaseManager {
    db: Arc<dyn Database>,
    bus: Arc<EventBus>,
    config: LeaseConfig,
}

/// Lease end at the millisecond precision it is stored with.
fn expiry(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(lease)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .map(|at| at.trunc_subsecs(3))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn lease_ms(lease: Duration) -> i64 {
    i64::try_from(lease.as_millis()).unwrap_or(i64::MAX)
}

fn missing_column(board_id: Uuid, state: WorkflowState) -> DispatchError {
    DispatchError::MissingColumn {
        board_id,
        state: state.label().to_string(),
    }
}

fn state_label(columns: &[Column], column_id: Uuid) -> String {
    columns
        .iter()
        .find(|c| c.id == column_id)
        .map(|c| c.name.clone())
        .unwrap_or_else(|| "unknown".to_string())
}

impl LeaseManager {
    pub fn new(db: Arc<dyn Database>, bus: Arc<EventBus>, config: LeaseConfig) -> Self {
        Self { db, bus, config }
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// Claim a ticket for `run_id` and move it into the active-work column.
    pub async fn acquire(
        &self,
        ticket_id: Uuid,
        run_id: Uuid,
        lease_duration: Duration,
    ) -> Result<Claim, DispatchError> {
        self.acquire_with(ticket_id, run_id, lease_duration, AcquireOptions::default())
            .await
    }

    /// [`acquire`](Self::acquire) with worker attribution.
    pub async fn acquire_with(
        &self,
        ticket_id: Uuid,
        run_id: Uuid,
        lease_duration: Duration,
        opts: AcquireOptions,
    ) -> Result<Claim, DispatchError> {
        let ticket = self
            .db
            .get_ticket(ticket_id)
            .await?
            .ok_or(DispatchError::TicketNotFound(ticket_id))?;
        let columns = self.db.list_columns(ticket.board_id).await?;
        let active = column_for_state(&columns, WorkflowState::InProgress)
            .ok_or_else(|| missing_column(ticket.board_id, WorkflowState::InProgress))?;

        let now = Utc::now();
        let current = columns
            .iter()
            .find(|c| c.id == ticket.column_id)
            .and_then(Column::state);

        // Only Ready tickets, or an InProgress ticket whose lease ran out.
        let takeover = match (current, &ticket.lock) {
            (Some(WorkflowState::Ready), None) => None,
            (Some(WorkflowState::Ready | WorkflowState::InProgress), Some(lock))
                if lock.is_expired_at(now) =>
            {
                Some(lock.run_id)
            }
            (_, Some(_)) => return Err(DispatchError::LockConflict { ticket_id }),
            _ => {
                return Err(DispatchError::NotClaimable {
                    ticket_id,
                    state: state_label(&columns, ticket.column_id),
                });
            }
        };

        // Run ids are single-use, whether the run is live or finished.
        if self.db.find_ticket_by_run(run_id).await?.is_some()
            || self.db.get_run(run_id).await?.is_some()
        {
            debug!(ticket_id = %ticket_id, run_id = %run_id, "Claim refused for a reused run id");
            return Err(DispatchError::RunExists(run_id));
        }

        let lease_expires_at = expiry(now, lease_duration);
        let write = ClaimWrite {
            ticket_id,
            expected_version: ticket.version,
            run_id,
            lease_expires_at,
            active_column_id: active.id,
            wip_limit: active.wip_limit,
            now,
        };

        if !self.db.claim_ticket(&write).await? {
            if let Some(limit) = active.wip_limit {
                let occupied = self.db.count_tickets_in_column(active.id).await?;
                let own = u32::from(ticket.column_id == active.id);
                if occupied.saturating_sub(own) >= limit {
                    debug!(ticket_id = %ticket_id, limit, "Claim refused at WIP limit");
                    return Err(DispatchError::WipLimitReached {
                        column_id: active.id,
                        limit,
                    });
                }
            }
            debug!(ticket_id = %ticket_id, run_id = %run_id, "Lost claim race");
            return Err(DispatchError::LockConflict { ticket_id });
        }

        let run = Run {
            id: run_id,
            ticket_id,
            worker_id: opts.worker_id,
            agent_variant: opts.agent_variant,
            status: RunStatus::Running,
            started_at: now,
            ended_at: None,
            exit_code: None,
            summary: None,
            lease_duration_ms: Some(lease_ms(lease_duration)),
            last_heartbeat_at: None,
        };
        if let Err(e) = self.db.insert_run(&run).await {
            // Give the ticket back rather than strand a lock with no run.
            if let Err(undo) = self
                .db
                .release_ticket(ticket_id, run_id, ticket.column_id, Utc::now())
                .await
            {
                warn!(ticket_id = %ticket_id, error = %undo, "Failed to undo claim");
            }
            return Err(e.into());
        }

        if let Some(prior_run_id) = takeover {
            self.abort_orphan(prior_run_id, now).await;
            warn!(
                ticket_id = %ticket_id,
                prior_run_id = %prior_run_id,
                run_id = %run_id,
                outcome = "taken_over",
                "Took over expired lease"
            );
            self.bus
                .emit(
                    BoardEvent::new(EventType::LockReclaimed)
                        .for_ticket(&ticket)
                        .with_run(prior_run_id)
                        .with_payload(json!({
                            "prior_run_id": prior_run_id,
                            "new_run_id": run_id,
                            "outcome": "taken_over",
                        })),
                )
                .await;
        }

        let claimed = Ticket {
            column_id: active.id,
            lock: Some(TicketLock {
                run_id,
                lease_expires_at,
            }),
            version: ticket.version + 1,
            updated_at: now,
            ..ticket
        };

        info!(
            ticket_id = %ticket_id,
            run_id = %run_id,
            worker_id = ?opts.worker_id,
            "Ticket claimed"
        );
        self.bus
            .emit(
                BoardEvent::new(EventType::RunStarted)
                    .for_ticket(&claimed)
                    .with_run(run_id)
                    .with_payload(json!({
                        "column_id": active.id,
                        "lease_expires_at": lease_expires_at,
                        "agent_variant": opts.agent_variant,
                        "worker_id": opts.worker_id,
                    })),
            )
            .await;

        Ok(Claim {
            ticket: claimed,
            run_id,
            lease_expires_at,
        })
    }

    /// Renew the lease held by `run_id` from now. Returns the new expiry.
    pub async fn heartbeat(&self, run_id: Uuid) -> Result<DateTime<Utc>, DispatchError> {
        let run = match self.db.get_run(run_id).await? {
            Some(run) if !run.status.is_terminal() => run,
            _ => return Err(DispatchError::LeaseNotOwned { run_id }),
        };

        let lease = run
            .lease_duration_ms
            .and_then(|ms| u64::try_from(ms).ok())
            .map(Duration::from_millis)
            .unwrap_or(self.config.lease_duration);
        let now = Utc::now();
        let lease_expires_at = expiry(now, lease);

        if !self.db.extend_lease(run_id, lease_expires_at, now).await? {
            debug!(run_id = %run_id, "Heartbeat from run without a lock");
            return Err(DispatchError::LeaseNotOwned { run_id });
        }
        self.db.record_heartbeat(run_id, now).await?;

        let mut event = BoardEvent::new(EventType::RunHeartbeat)
            .with_run(run_id)
            .with_payload(json!({ "lease_expires_at": lease_expires_at }));
        event.ticket_id = Some(run.ticket_id);
        self.bus.emit(event).await;

        Ok(lease_expires_at)
    }

    /// Clear the lock, finalize the run, and move the ticket by outcome.
    ///
    /// Releasing a run that is already terminal is a successful no-op.
    pub async fn release(
        &self,
        run_id: Uuid,
        finalize: &RunFinalize,
    ) -> Result<ReleaseReport, DispatchError> {
        if !finalize.status.is_terminal() {
            return Err(DispatchError::NonTerminalStatus {
                status: finalize.status.as_str().to_string(),
            });
        }
        let run = self
            .db
            .get_run(run_id)
            .await?
            .ok_or(DispatchError::RunNotFound(run_id))?;

        if run.status.is_terminal() {
            debug!(run_id = %run_id, status = run.status.as_str(), "Release of finalized run");
            return Ok(ReleaseReport {
                run_id,
                ticket_id: run.ticket_id,
                outcome: run.status.outcome(),
                column_id: None,
                already_finalized: true,
            });
        }

        let outcome = finalize.outcome();
        let ticket = self
            .db
            .get_ticket(run.ticket_id)
            .await?
            .ok_or(DispatchError::TicketNotFound(run.ticket_id))?;
        let columns = self.db.list_columns(ticket.board_id).await?;
        let destination = column_for_state(&columns, outcome.destination())
            .ok_or_else(|| missing_column(ticket.board_id, outcome.destination()))?;

        let now = Utc::now();
        if !self
            .db
            .release_ticket(ticket.id, run_id, destination.id, now)
            .await?
        {
            // Lost the lock to the sweep or a takeover.
            return match self.db.get_run(run_id).await? {
                Some(current) if current.status.is_terminal() => Ok(ReleaseReport {
                    run_id,
                    ticket_id: ticket.id,
                    outcome: current.status.outcome(),
                    column_id: None,
                    already_finalized: true,
                }),
                _ => {
                    warn!(run_id = %run_id, ticket_id = %ticket.id, "Release from run that no longer holds the lock");
                    Err(DispatchError::LeaseNotOwned { run_id })
                }
            };
        }

        let terminal = RunFinalize {
            status: outcome.run_status(),
            exit_code: finalize.exit_code,
            summary: finalize.summary.clone(),
        };
        self.db.finalize_run(run_id, &terminal, now).await?;

        info!(
            run_id = %run_id,
            ticket_id = %ticket.id,
            outcome = ?outcome,
            column = %destination.name,
            "Run released"
        );
        self.bus
            .emit(
                BoardEvent::new(EventType::RunFinished)
                    .for_ticket(&ticket)
                    .with_run(run_id)
                    .with_payload(json!({
                        "status": terminal.status,
                        "exit_code": terminal.exit_code,
                        "summary": terminal.summary,
                        "column_id": destination.id,
                    })),
            )
            .await;

        Ok(ReleaseReport {
            run_id,
            ticket_id: ticket.id,
            outcome,
            column_id: Some(destination.id),
            already_finalized: false,
        })
    }

    /// Recover locks whose lease plus grace has passed.
    pub async fn reclaim_sweep(&self) -> Result<Vec<ReclaimRecord>, DispatchError> {
        self.reclaim_sweep_at(Utc::now()).await
    }

    /// Sweep as of `now`.
    ///
    /// Each reclaim is conditional on the version observed here; a heartbeat
    /// that lands in between bumps the version and the ticket is skipped.
    pub async fn reclaim_sweep_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReclaimRecord>, DispatchError> {
        let grace = TimeDelta::from_std(self.config.reclaim_grace).unwrap_or(TimeDelta::zero());
        let cutoff = now.checked_sub_signed(grace).unwrap_or(now);
        let expired = self.db.list_expired_locks(cutoff).await?;
        if expired.is_empty() {
            return Ok(Vec::new());
        }

        let mut columns_by_board: HashMap<Uuid, Vec<Column>> = HashMap::new();
        let mut records = Vec::new();

        for ticket in expired {
            let Some(lock) = ticket.lock.clone() else {
                continue;
            };
            if !columns_by_board.contains_key(&ticket.board_id) {
                let columns = self.db.list_columns(ticket.board_id).await?;
                columns_by_board.insert(ticket.board_id, columns);
            }
            let columns = columns_by_board
                .get(&ticket.board_id)
                .map(Vec::as_slice)
                .unwrap_or_default();

            let reclaim_count = ticket.reclaim_count.saturating_add(1);
            let destination = if reclaim_count >= self.config.max_reclaims {
                WorkflowState::Blocked
            } else {
                WorkflowState::Ready
            };
            let Some(column) = column_for_state(columns, destination) else {
                warn!(
                    ticket_id = %ticket.id,
                    board_id = %ticket.board_id,
                    state = %destination,
                    "Cannot reclaim: board has no destination column"
                );
                continue;
            };

            match self
                .db
                .reclaim_ticket(ticket.id, ticket.version, column.id, reclaim_count, now)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    debug!(ticket_id = %ticket.id, run_id = %lock.run_id, "Lock renewed before reclaim");
                    continue;
                }
                Err(e) => {
                    warn!(ticket_id = %ticket.id, error = %e, "Reclaim failed");
                    continue;
                }
            }

            self.abort_orphan(lock.run_id, now).await;

            warn!(
                ticket_id = %ticket.id,
                prior_run_id = %lock.run_id,
                outcome = %destination,
                reclaim_count,
                "Reclaimed expired lock"
            );
            self.bus
                .emit(
                    BoardEvent::new(EventType::LockReclaimed)
                        .for_ticket(&ticket)
                        .with_run(lock.run_id)
                        .with_payload(json!({
                            "prior_run_id": lock.run_id,
                            "outcome": "reclaimed",
                            "destination": destination,
                            "column_id": column.id,
                            "reclaim_count": reclaim_count,
                        })),
                )
                .await;

            records.push(ReclaimRecord {
                ticket_id: ticket.id,
                prior_run_id: lock.run_id,
                destination,
                reclaim_count,
            });
        }

        Ok(records)
    }

    async fn abort_orphan(&self, run_id: Uuid, now: DateTime<Utc>) {
        let abort = RunFinalize::cancelled("lease expired");
        if let Err(e) = self.db.finalize_run(run_id, &abort, now).await {
            warn!(run_id = %run_id, error = %e, "Failed to mark orphaned run aborted");
        }
    }
}
