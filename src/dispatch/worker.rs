//! In-process worker pool.
//!
//! Each worker is a long-lived task: while idle it polls admission on a
//! fixed interval; while running it heartbeats its lease alongside the
//! executor and never polls. Stopping a worker mid-run cancels the run,
//! which sends the ticket to Blocked.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, interval_at};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::admission::AdmissionCoordinator;
use super::executor::AgentExecutor;
use super::lease::LeaseManager;
use crate::board::model::{AgentVariant, BoardEvent, Claim, EventType, RunFinalize};
use crate::config::WorkerConfig;
use crate::error::DispatchError;
use crate::events::EventBus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Running,
    Stopped,
}

/// Snapshot of one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: Uuid,
    pub agent_variant: AgentVariant,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub state: WorkerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_ticket_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_run_id: Option<Uuid>,
    pub tickets_processed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_poll_at: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
}

/// Lock API queue status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub ready_count: u32,
    pub in_progress_count: u32,
    pub worker_count: u32,
}

/// Queue status plus a breakdown of worker states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerQueueStatus {
    #[serde(flatten)]
    pub queue: QueueStatus,
    pub idle_workers: u32,
    pub running_workers: u32,
}

/// Tracked worker task.
struct WorkerHandle {
    info: watch::Receiver<WorkerInfo>,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Everything a worker task needs, cloned per worker.
#[derive(Clone)]
struct WorkerDeps {
    lease: Arc<LeaseManager>,
    admission: Arc<AdmissionCoordinator>,
    bus: Arc<EventBus>,
    executor: Arc<dyn AgentExecutor>,
    config: WorkerConfig,
}

pub struct WorkerPool {
    deps: WorkerDeps,
    workers: RwLock<HashMap<Uuid, WorkerHandle>>,
}

impl WorkerPool {
    pub fn new(
        lease: Arc<LeaseManager>,
        admission: Arc<AdmissionCoordinator>,
        bus: Arc<EventBus>,
        executor: Arc<dyn AgentExecutor>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            deps: WorkerDeps {
                lease,
                admission,
                bus,
                executor,
                config,
            },
            workers: RwLock::new(HashMap::new()),
        }
    }

    /// Start a worker that claims tickets for `variant`, optionally within one project.
    pub async fn start_worker(
        &self,
        variant: AgentVariant,
        project_id: Option<String>,
    ) -> WorkerInfo {
        let info = WorkerInfo {
            id: Uuid::new_v4(),
            agent_variant: variant,
            project_id,
            state: WorkerState::Idle,
            current_ticket_id: None,
            current_run_id: None,
            tickets_processed: 0,
            last_poll_at: None,
            started_at: Utc::now(),
        };
        let (info_tx, info_rx) = watch::channel(info.clone());
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = tokio::spawn(run_worker(self.deps.clone(), info_tx, stop_rx));
        self.workers.write().await.insert(
            info.id,
            WorkerHandle {
                info: info_rx,
                stop: stop_tx,
                handle,
            },
        );

        info!(
            worker_id = %info.id,
            variant = variant.as_str(),
            project_id = ?info.project_id,
            "Worker started"
        );
        self.deps
            .bus
            .emit(BoardEvent::new(EventType::WorkerStarted).with_payload(json!({
                "worker_id": info.id,
                "agent_variant": variant,
                "project_id": info.project_id,
            })))
            .await;
        info
    }

    /// Stop a worker, cancelling its current run. Returns its final state.
    pub async fn stop_worker(&self, worker_id: Uuid) -> Result<WorkerInfo, DispatchError> {
        let tracked = self
            .workers
            .write()
            .await
            .remove(&worker_id)
            .ok_or(DispatchError::WorkerNotFound(worker_id))?;
        Ok(shutdown(tracked).await)
    }

    /// Stop every worker.
    pub async fn stop_all_workers(&self) -> Vec<WorkerInfo> {
        let drained: Vec<WorkerHandle> = self.workers.write().await.drain().map(|(_, w)| w).collect();
        let mut stopped = Vec::with_capacity(drained.len());
        for tracked in drained {
            stopped.push(shutdown(tracked).await);
        }
        stopped
    }

    pub async fn get_workers(&self) -> Vec<WorkerInfo> {
        let workers = self.workers.read().await;
        let mut infos: Vec<WorkerInfo> = workers.values().map(|w| w.info.borrow().clone()).collect();
        infos.sort_by_key(|w| w.started_at);
        infos
    }

    pub async fn queue_status(&self) -> Result<QueueStatus, DispatchError> {
        let counts = self.deps.admission.queue_counts().await?;
        let worker_count = u32::try_from(self.workers.read().await.len()).unwrap_or(u32::MAX);
        Ok(QueueStatus {
            ready_count: counts.ready_count,
            in_progress_count: counts.in_progress_count,
            worker_count,
        })
    }

    pub async fn worker_queue_status(&self) -> Result<WorkerQueueStatus, DispatchError> {
        let queue = self.queue_status().await?;
        let workers = self.get_workers().await;
        let count = |state: WorkerState| {
            let n = workers.iter().filter(|w| w.state == state).count();
            u32::try_from(n).unwrap_or(u32::MAX)
        };
        Ok(WorkerQueueStatus {
            queue,
            idle_workers: count(WorkerState::Idle),
            running_workers: count(WorkerState::Running),
        })
    }
}

async fn shutdown(tracked: WorkerHandle) -> WorkerInfo {
    let _ = tracked.stop.send(true);
    if let Err(e) = tracked.handle.await {
        error!(error = %e, "Worker task panicked");
    }
    let mut info = tracked.info.borrow().clone();
    info.state = WorkerState::Stopped;
    info
}

async fn run_worker(
    deps: WorkerDeps,
    info_tx: watch::Sender<WorkerInfo>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let (worker_id, variant, project) = {
        let info = info_tx.borrow();
        (info.id, info.agent_variant, info.project_id.clone())
    };

    let mut poll = interval(deps.config.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            _ = poll.tick() => {}
        }

        info_tx.send_modify(|i| i.last_poll_at = Some(Utc::now()));
        let claim = match deps
            .admission
            .next_for_worker(variant, project.as_deref(), Some(worker_id))
            .await
        {
            Ok(Some(claim)) => claim,
            Ok(None) => continue,
            Err(e) => {
                warn!(worker_id = %worker_id, error = %e, "Poll failed, retrying next interval");
                continue;
            }
        };

        info_tx.send_modify(|i| {
            i.state = WorkerState::Running;
            i.current_ticket_id = Some(claim.ticket.id);
            i.current_run_id = Some(claim.run_id);
        });

        let stopped = work_claim(&deps, &claim, variant, &mut stop_rx).await;

        info_tx.send_modify(|i| {
            i.state = WorkerState::Idle;
            i.current_ticket_id = None;
            i.current_run_id = None;
            i.tickets_processed += 1;
        });
        if stopped {
            break;
        }
    }

    info_tx.send_modify(|i| i.state = WorkerState::Stopped);
    info!(worker_id = %worker_id, "Worker stopped");
    deps.bus
        .emit(
            BoardEvent::new(EventType::WorkerStopped)
                .with_payload(json!({ "worker_id": worker_id })),
        )
        .await;
}

/// Execute one claim to completion. Returns `true` if the worker was told to stop.
async fn work_claim(
    deps: &WorkerDeps,
    claim: &Claim,
    variant: AgentVariant,
    stop_rx: &mut watch::Receiver<bool>,
) -> bool {
    let run_id = claim.run_id;
    let every = deps.config.heartbeat_interval;
    let mut heartbeat = interval_at(Instant::now() + every, every);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut execution = deps.executor.execute(claim, variant);

    loop {
        tokio::select! {
            finalize = &mut execution => {
                release(deps, run_id, &finalize).await;
                return false;
            }
            _ = heartbeat.tick() => {
                match deps.lease.heartbeat(run_id).await {
                    Ok(expires) => debug!(run_id = %run_id, %expires, "Lease renewed"),
                    Err(DispatchError::LeaseNotOwned { .. }) => {
                        // Reclaimed or taken over; the result would be discarded.
                        warn!(run_id = %run_id, "Lease lost, abandoning run");
                        return false;
                    }
                    Err(e) => warn!(run_id = %run_id, error = %e, "Heartbeat failed, retrying next interval"),
                }
            }
            _ = stop_rx.changed() => {
                release(deps, run_id, &RunFinalize::cancelled("worker stopped")).await;
                return true;
            }
        }
    }
}

async fn release(deps: &WorkerDeps, run_id: Uuid, finalize: &RunFinalize) {
    match deps.lease.release(run_id, finalize).await {
        Ok(report) => debug!(run_id = %run_id, outcome = ?report.outcome, "Run released by worker"),
        Err(DispatchError::LeaseNotOwned { .. }) => {
            info!(run_id = %run_id, "Run already recovered elsewhere, nothing to release");
        }
        Err(e) => warn!(run_id = %run_id, error = %e, "Release failed; the sweep will recover the lock"),
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::board::model::{RunStatus, WorkflowState};
    use crate::dispatch::test_support::{Harness, column};
    use crate::store::Database;

    const WAIT: Duration = Duration::from_secs(5);

    /// Finishes immediately.
    struct InstantExecutor;

    #[async_trait]
    impl AgentExecutor for InstantExecutor {
        async fn execute(&self, _claim: &Claim, _variant: AgentVariant) -> RunFinalize {
            RunFinalize::finished(Some(0), "done")
        }
    }

    /// Takes a while so heartbeats happen.
    struct SlowExecutor(Duration);

    #[async_trait]
    impl AgentExecutor for SlowExecutor {
        async fn execute(&self, _claim: &Claim, _variant: AgentVariant) -> RunFinalize {
            tokio::time::sleep(self.0).await;
            RunFinalize::finished(Some(0), "slow")
        }
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            poll_interval: Duration::from_millis(10),
            heartbeat_interval: Duration::from_millis(20),
            agent_command: None,
        }
    }

    fn pool(h: &Harness, executor: Arc<dyn AgentExecutor>) -> WorkerPool {
        WorkerPool::new(
            Arc::clone(&h.lease),
            Arc::clone(&h.admission),
            Arc::clone(&h.bus),
            executor,
            fast_config(),
        )
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        tokio::time::timeout(WAIT, async {
            while !check().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn worker_claims_and_finishes_ticket() {
        let h = Harness::new().await;
        let state = h.board().await;
        let ticket_id = h.ticket(&state, WorkflowState::Ready, "job").await.id;
        let pool = pool(&h, Arc::new(InstantExecutor));

        let info = pool.start_worker(AgentVariant::VariantA, None).await;
        let review = column(&state, WorkflowState::Review);
        let db = &h.db;
        eventually(move || async move {
            db.get_ticket(ticket_id).await.unwrap().unwrap().column_id == review
        })
        .await;
        let workers = &pool;
        eventually(move || async move { workers.get_workers().await[0].tickets_processed == 1 })
            .await;

        let stopped = pool.stop_worker(info.id).await.unwrap();
        assert_eq!(stopped.state, WorkerState::Stopped);
        assert!(pool.get_workers().await.is_empty());
        assert!(matches!(
            pool.stop_worker(info.id).await,
            Err(DispatchError::WorkerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn running_worker_heartbeats() {
        let h = Harness::new().await;
        let state = h.board().await;
        let ticket_id = h.ticket(&state, WorkflowState::Ready, "slow job").await.id;
        let pool = pool(&h, Arc::new(SlowExecutor(Duration::from_millis(150))));

        pool.start_worker(AgentVariant::VariantB, None).await;
        let db = &h.db;
        eventually(move || async move {
            let runs = db.list_runs_for_ticket(ticket_id).await.unwrap();
            runs.first().is_some_and(|r| r.last_heartbeat_at.is_some())
        })
        .await;
        eventually(move || async move {
            let runs = db.list_runs_for_ticket(ticket_id).await.unwrap();
            runs.first().is_some_and(|r| r.status == RunStatus::Finished)
        })
        .await;
        pool.stop_all_workers().await;
    }

    #[tokio::test]
    async fn stopping_mid_run_cancels_to_blocked() {
        let h = Harness::new().await;
        let state = h.board().await;
        let ticket = h.ticket(&state, WorkflowState::Ready, "long job").await;
        let pool = pool(&h, Arc::new(SlowExecutor(Duration::from_secs(60))));

        let info = pool.start_worker(AgentVariant::VariantA, None).await;
        let workers = &pool;
        eventually(move || async move {
            workers.get_workers().await[0].state == WorkerState::Running
        })
        .await;
        let status = pool.worker_queue_status().await.unwrap();
        assert_eq!(status.running_workers, 1);
        assert_eq!(status.queue.in_progress_count, 1);

        let stopped = pool.stop_worker(info.id).await.unwrap();
        assert_eq!(stopped.tickets_processed, 1);

        let stored = h.db.get_ticket(ticket.id).await.unwrap().unwrap();
        assert_eq!(stored.column_id, column(&state, WorkflowState::Blocked));
        assert!(stored.lock.is_none());
        let runs = h.db.list_runs_for_ticket(ticket.id).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Aborted);
    }

    #[tokio::test]
    async fn racing_workers_share_nothing() {
        let h = Harness::new().await;
        let state = h.board().await;
        let ticket_id = h.ticket(&state, WorkflowState::Ready, "single").await.id;
        let pool = pool(&h, Arc::new(SlowExecutor(Duration::from_millis(50))));

        pool.start_worker(AgentVariant::VariantA, None).await;
        pool.start_worker(AgentVariant::VariantA, None).await;
        let review = column(&state, WorkflowState::Review);
        let db = &h.db;
        eventually(move || async move {
            db.get_ticket(ticket_id).await.unwrap().unwrap().column_id == review
        })
        .await;

        assert_eq!(h.db.list_runs_for_ticket(ticket_id).await.unwrap().len(), 1);
        let stopped = pool.stop_all_workers().await;
        assert_eq!(stopped.len(), 2);
        assert_eq!(stopped.iter().map(|w| w.tickets_processed).sum::<u64>(), 1);
    }

    #[tokio::test]
    async fn queue_status_counts_workers() {
        let h = Harness::new().await;
        let state = h.board().await;
        h.ticket(&state, WorkflowState::Ready, "waiting").await;
        let pool = pool(&h, Arc::new(InstantExecutor));

        let status = pool.queue_status().await.unwrap();
        assert_eq!(
            status,
            QueueStatus {
                ready_count: 1,
                in_progress_count: 0,
                worker_count: 0
            }
        );
        // Project filter keeps this worker away from the ticket.
        pool.start_worker(AgentVariant::VariantA, Some("other".into()))
            .await;
        assert_eq!(pool.queue_status().await.unwrap().worker_count, 1);
        let json = serde_json::to_value(pool.worker_queue_status().await.unwrap()).unwrap();
        assert_eq!(json["worker_count"], 1);
        assert!(json.get("idle_workers").is_some());
        pool.stop_all_workers().await;
    }
}
