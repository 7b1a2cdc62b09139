//! Background reclaim sweep.
//!
//! Runs immediately on startup (recovering locks orphaned by a previous
//! process) and then on a fixed interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::lease::LeaseManager;

/// Spawn the reclaim sweep loop.
pub fn spawn_reclaim_sweep(lease: Arc<LeaseManager>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Reclaim sweep started (interval: {}s)", every.as_secs());

        let mut tick = tokio::time::interval(every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // First tick fires immediately
        loop {
            tick.tick().await;
            match lease.reclaim_sweep().await {
                Ok(records) if records.is_empty() => debug!("Reclaim sweep: nothing expired"),
                Ok(records) => info!(count = records.len(), "Reclaim sweep recovered locks"),
                Err(e) => warn!(error = %e, "Reclaim sweep failed, retrying next interval"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use chrono::{TimeDelta, Utc};
    use uuid::Uuid;

    use super::*;
    use crate::board::model::WorkflowState;
    use crate::config::LeaseConfig;
    use crate::dispatch::test_support::{Harness, column};
    use crate::store::Database;

    #[tokio::test]
    async fn sweep_loop_recovers_expired_lock() {
        let h = Harness::with_config(LeaseConfig {
            reclaim_grace: Duration::ZERO,
            ..LeaseConfig::default()
        })
        .await;
        let state = h.board().await;
        let ticket = h.ticket(&state, WorkflowState::Ready, "abandoned").await;
        h.lease
            .acquire(ticket.id, Uuid::new_v4(), Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let handle = spawn_reclaim_sweep(Arc::clone(&h.lease), Duration::from_millis(10));
        let ready = column(&state, WorkflowState::Ready);
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let stored = h.db.get_ticket(ticket.id).await.unwrap().unwrap();
                if stored.column_id == ready && stored.lock.is_none() {
                    assert_eq!(stored.reclaim_count, 1);
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("sweep never reclaimed the lock");
        handle.abort();

        let horizon = Utc::now() + TimeDelta::hours(1);
        assert!(h.db.list_expired_locks(horizon).await.unwrap().is_empty());
    }
}
