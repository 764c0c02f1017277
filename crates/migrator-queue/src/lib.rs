//! Two-lane job queue: durable bookkeeping in a [`JobLedger`], worker pools
//! per lane, retry with doubling backoff, and reconciliation between queue
//! state and migration records.

mod factory;
mod lane;
mod ledger;
mod queue;
mod sqlite;

pub use factory::{create_ledger, QueueBackend};
pub use lane::{JobLane, LaneCounts};
pub use ledger::{JobLedger, JobRecord, JobState, MemoryJobLedger};
pub use queue::{
    JobExecutor, QueueSettings, QueueStatus, WorkerJobQueue, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_MIGRATION_RETRY_BACKOFF, DEFAULT_MIGRATION_WORKERS, DEFAULT_SYNC_RETRY_BACKOFF,
    DEFAULT_SYNC_WORKERS,
};
pub use sqlite::SqliteJobLedger;
