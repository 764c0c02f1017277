use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use migrator_core::{
    JobPayload, MigrationError, MigrationId, MigrationRecordStore, MigrationResult,
    MigrationUpdate, StatusCounts,
};
use migrator_process::CancellationHandle;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::lane::{JobLane, LaneCounts};
use crate::ledger::{JobLedger, JobRecord};

pub const DEFAULT_MIGRATION_WORKERS: usize = 2;
pub const DEFAULT_SYNC_WORKERS: usize = 3;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_MIGRATION_RETRY_BACKOFF: Duration = Duration::from_secs(5);
pub const DEFAULT_SYNC_RETRY_BACKOFF: Duration = Duration::from_secs(3);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

const JOB_LOST_ERROR: &str = "job lost: no live queue entry backs this in-flight record";

/// Executes one claimed job. The queue owns retry accounting; the executor
/// owns the actual migration semantics.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, payload: &JobPayload) -> MigrationResult<()>;
    /// Interrupts the active run for this migration, if one exists.
    fn cancel_active(&self, migration_id: &MigrationId) -> bool;
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub migration_workers: usize,
    pub sync_workers: usize,
    pub max_attempts: u32,
    pub migration_retry_backoff: Duration,
    pub sync_retry_backoff: Duration,
    pub poll_interval: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            migration_workers: DEFAULT_MIGRATION_WORKERS,
            sync_workers: DEFAULT_SYNC_WORKERS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            migration_retry_backoff: DEFAULT_MIGRATION_RETRY_BACKOFF,
            sync_retry_backoff: DEFAULT_SYNC_RETRY_BACKOFF,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl QueueSettings {
    fn workers_for(&self, lane: JobLane) -> usize {
        match lane {
            JobLane::Migration => self.migration_workers.max(1),
            JobLane::Sync => self.sync_workers.max(1),
        }
    }

    /// Backoff doubles with every failed attempt.
    fn backoff_for(&self, lane: JobLane, attempts: u32) -> Duration {
        let base = match lane {
            JobLane::Migration => self.migration_retry_backoff,
            JobLane::Sync => self.sync_retry_backoff,
        };
        base.saturating_mul(1u32 << attempts.saturating_sub(1).min(16))
    }
}

/// Aggregate view over both lanes plus the record store, so operators can
/// spot disagreement between jobs and records at a glance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatus {
    pub migration_lane: LaneCounts,
    pub sync_lane: LaneCounts,
    pub records: StatusCounts,
}

/// Two-lane worker pool over a [`JobLedger`].
pub struct WorkerJobQueue {
    ledger: Arc<dyn JobLedger>,
    executor: Arc<dyn JobExecutor>,
    store: Arc<dyn MigrationRecordStore>,
    settings: QueueSettings,
    shutdown: CancellationHandle,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerJobQueue {
    /// Fails any jobs orphaned by a previous process, then spawns the lane
    /// workers.
    pub fn start(
        ledger: Arc<dyn JobLedger>,
        executor: Arc<dyn JobExecutor>,
        store: Arc<dyn MigrationRecordStore>,
        settings: QueueSettings,
    ) -> MigrationResult<Arc<Self>> {
        let orphaned = ledger.fail_orphaned_active(unix_now())?;
        if orphaned > 0 {
            tracing::warn!(orphaned, "failed jobs left active by a previous process");
        }

        let queue = Arc::new(Self {
            ledger,
            executor,
            store,
            settings,
            shutdown: CancellationHandle::new(),
            workers: Mutex::new(Vec::new()),
        });

        let mut handles = Vec::new();
        for lane in [JobLane::Migration, JobLane::Sync] {
            for worker_index in 0..queue.settings.workers_for(lane) {
                let worker = Arc::clone(&queue);
                handles.push(tokio::spawn(async move {
                    worker.worker_loop(lane, worker_index).await;
                }));
            }
        }
        *queue.workers.lock().expect("worker registry lock poisoned") = handles;
        Ok(queue)
    }

    /// Accepts a job unless the migration already has a live one; duplicate
    /// live jobs for one id would race each other over the same workspace.
    pub async fn enqueue(&self, payload: JobPayload) -> MigrationResult<JobRecord> {
        if self.ledger.has_live_job(&payload.migration_id)? {
            return Err(MigrationError::Conflict(format!(
                "migration {} already has a queued or running job",
                payload.migration_id
            )));
        }
        let record = self.ledger.enqueue(payload, unix_now())?;
        tracing::info!(
            job_id = %record.id,
            migration_id = %record.payload.migration_id,
            lane = record.lane.as_str(),
            "job enqueued"
        );
        Ok(record)
    }

    /// Cancels every waiting job for the migration and signals the active run
    /// if there is one.
    pub fn cancel(&self, migration_id: &MigrationId) -> MigrationResult<usize> {
        let cancelled = self.ledger.cancel_waiting(migration_id, unix_now())?;
        let interrupted = self.executor.cancel_active(migration_id);
        tracing::info!(
            %migration_id,
            cancelled_waiting = cancelled,
            interrupted_active = interrupted,
            "cancellation requested"
        );
        Ok(cancelled)
    }

    /// Reported counts never show an in-flight record with no job behind it;
    /// those are reconciled to failed first.
    pub async fn status(&self) -> MigrationResult<QueueStatus> {
        self.reconcile_lost_records().await?;
        Ok(QueueStatus {
            migration_lane: self.ledger.lane_counts(JobLane::Migration)?,
            sync_lane: self.ledger.lane_counts(JobLane::Sync)?,
            records: self.store.status_counts().await?,
        })
    }

    /// Prunes old terminal jobs and fails in-flight records no live job backs.
    pub async fn cleanup(&self, retain_terminal_for: Duration) -> MigrationResult<usize> {
        let cutoff = unix_now().saturating_sub(retain_terminal_for.as_secs());
        let pruned = self.ledger.prune_terminal_before(cutoff)?;
        let reconciled = self.reconcile_lost_records().await?;
        if pruned > 0 || reconciled > 0 {
            tracing::info!(pruned, reconciled, "queue cleanup finished");
        }
        Ok(pruned + reconciled)
    }

    /// Fails in-flight records no live job backs (a crash between claiming a
    /// job and finishing it leaves those behind).
    async fn reconcile_lost_records(&self) -> MigrationResult<usize> {
        let live = self.ledger.live_migration_ids()?;
        let mut reconciled = 0;
        for record in self.store.find_all().await? {
            if record.status.is_in_flight() && !live.contains(&record.id) {
                self.store
                    .update(&record.id, MigrationUpdate::failed(JOB_LOST_ERROR))
                    .await?;
                reconciled += 1;
                tracing::warn!(migration_id = %record.id, "reconciled orphaned in-flight record");
            }
        }
        Ok(reconciled)
    }

    /// Stops claiming new jobs and waits for the workers to wind down.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().expect("worker registry lock poisoned");
            workers.drain(..).collect()
        };
        for worker in handles {
            let _ = worker.await;
        }
    }

    async fn worker_loop(self: Arc<Self>, lane: JobLane, worker_index: usize) {
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            let claimed = match self.ledger.claim_next_waiting(lane, unix_now()) {
                Ok(claimed) => claimed,
                Err(error) => {
                    tracing::error!(lane = lane.as_str(), %error, "job claim failed");
                    None
                }
            };
            match claimed {
                Some(job) => self.run_job(lane, worker_index, job).await,
                None => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = sleep(self.settings.poll_interval) => {}
                    }
                }
            }
        }
    }

    async fn run_job(&self, lane: JobLane, worker_index: usize, job: JobRecord) {
        tracing::info!(
            job_id = %job.id,
            migration_id = %job.payload.migration_id,
            lane = lane.as_str(),
            worker = worker_index,
            attempt = job.attempts,
            "job started"
        );
        let outcome = match self.executor.execute(&job.payload).await {
            Ok(()) => self.ledger.mark_completed(job.id, unix_now()),
            Err(error) => {
                let retry_at = if error.is_retryable() && job.attempts < self.settings.max_attempts
                {
                    let backoff = self.settings.backoff_for(lane, job.attempts);
                    tracing::warn!(
                        job_id = %job.id,
                        migration_id = %job.payload.migration_id,
                        attempt = job.attempts,
                        backoff_secs = backoff.as_secs(),
                        %error,
                        "job attempt failed; requeued"
                    );
                    Some(unix_now() + backoff.as_secs())
                } else {
                    tracing::error!(
                        job_id = %job.id,
                        migration_id = %job.payload.migration_id,
                        attempt = job.attempts,
                        %error,
                        "job failed terminally"
                    );
                    None
                };
                self.ledger
                    .record_attempt(job.id, &error.to_string(), retry_at, unix_now())
            }
        };
        if let Err(error) = outcome {
            tracing::error!(job_id = %job.id, %error, "job bookkeeping failed");
        }
    }
}

fn unix_now() -> u64 {
    OffsetDateTime::now_utc().unix_timestamp().max(0) as u64
}
