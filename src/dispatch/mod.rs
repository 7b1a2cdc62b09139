//! Dispatch — leases, admission, the reclaim sweep, and in-process workers.

pub mod admission;
pub mod executor;
pub mod lease;
pub mod routes;
pub mod sweep;
pub mod worker;

pub use admission::{AdmissionCoordinator, QueueCounts};
pub use executor::{AgentExecutor, CommandExecutor};
pub use lease::{AcquireOptions, LeaseManager, ReclaimRecord, ReleaseReport};
pub use routes::dispatch_routes;
pub use sweep::spawn_reclaim_sweep;
pub use worker::{QueueStatus, WorkerInfo, WorkerPool, WorkerQueueStatus, WorkerState};
