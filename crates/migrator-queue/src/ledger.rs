use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use migrator_core::{JobId, JobPayload, MigrationError, MigrationId, MigrationResult};

use crate::lane::{JobLane, LaneCounts};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    /// Live jobs hold the per-migration exclusivity claim.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Waiting | Self::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "waiting" => Some(Self::Waiting),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// One queued unit of work. Timestamps are unix seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub id: JobId,
    pub lane: JobLane,
    pub payload: JobPayload,
    pub state: JobState,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Claims skip the job until this instant; retry backoff lives here.
    pub not_before: u64,
    pub enqueued_at: u64,
    pub updated_at: u64,
}

/// Durable job bookkeeping behind the worker queue. Implementations are
/// synchronous; every operation is a short, indexed mutation.
pub trait JobLedger: Send + Sync {
    fn enqueue(&self, payload: JobPayload, now: u64) -> MigrationResult<JobRecord>;
    /// Atomically claims the oldest eligible waiting job in the lane, marking
    /// it active and counting the attempt.
    fn claim_next_waiting(&self, lane: JobLane, now: u64) -> MigrationResult<Option<JobRecord>>;
    fn mark_completed(&self, id: JobId, now: u64) -> MigrationResult<()>;
    /// Records a failed attempt. `retry_at` requeues the job for that instant;
    /// `None` fails it terminally.
    fn record_attempt(
        &self,
        id: JobId,
        error: &str,
        retry_at: Option<u64>,
        now: u64,
    ) -> MigrationResult<()>;
    /// Cancels every waiting job for the migration; active jobs are the
    /// orchestrator's to interrupt.
    fn cancel_waiting(&self, migration_id: &MigrationId, now: u64) -> MigrationResult<usize>;
    fn has_live_job(&self, migration_id: &MigrationId) -> MigrationResult<bool>;
    fn live_migration_ids(&self) -> MigrationResult<HashSet<MigrationId>>;
    fn lane_counts(&self, lane: JobLane) -> MigrationResult<LaneCounts>;
    /// Deletes terminal jobs last touched before the cutoff; returns how many.
    fn prune_terminal_before(&self, cutoff: u64) -> MigrationResult<usize>;
    /// Fails jobs left active by a crashed process; run once at startup.
    fn fail_orphaned_active(&self, now: u64) -> MigrationResult<usize>;
}

const ORPHANED_ACTIVE_ERROR: &str = "worker terminated while the job was active";

/// Ledger used by tests and deployments that opt out of durable queueing.
#[derive(Debug, Default)]
pub struct MemoryJobLedger {
    inner: Mutex<MemoryLedgerInner>,
}

#[derive(Debug, Default)]
struct MemoryLedgerInner {
    next_id: u64,
    jobs: BTreeMap<u64, JobRecord>,
}

impl MemoryJobLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobLedger for MemoryJobLedger {
    fn enqueue(&self, payload: JobPayload, now: u64) -> MigrationResult<JobRecord> {
        let mut inner = self.inner.lock().expect("job ledger lock poisoned");
        inner.next_id += 1;
        let record = JobRecord {
            id: JobId::new(inner.next_id),
            lane: JobLane::for_job_type(payload.job_type),
            payload,
            state: JobState::Waiting,
            attempts: 0,
            last_error: None,
            not_before: 0,
            enqueued_at: now,
            updated_at: now,
        };
        inner.jobs.insert(record.id.value(), record.clone());
        Ok(record)
    }

    fn claim_next_waiting(&self, lane: JobLane, now: u64) -> MigrationResult<Option<JobRecord>> {
        let mut inner = self.inner.lock().expect("job ledger lock poisoned");
        let next = inner
            .jobs
            .values()
            .find(|job| job.lane == lane && job.state == JobState::Waiting && job.not_before <= now)
            .map(|job| job.id.value());
        let Some(id) = next else {
            return Ok(None);
        };
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| MigrationError::Internal(format!("claimed job {id} vanished")))?;
        job.state = JobState::Active;
        job.attempts += 1;
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    fn mark_completed(&self, id: JobId, now: u64) -> MigrationResult<()> {
        self.transition(id, now, |job| {
            job.state = JobState::Completed;
        })
    }

    fn record_attempt(
        &self,
        id: JobId,
        error: &str,
        retry_at: Option<u64>,
        now: u64,
    ) -> MigrationResult<()> {
        self.transition(id, now, |job| {
            job.last_error = Some(error.to_owned());
            match retry_at {
                Some(retry_at) => {
                    job.state = JobState::Waiting;
                    job.not_before = retry_at;
                }
                None => job.state = JobState::Failed,
            }
        })
    }

    fn cancel_waiting(&self, migration_id: &MigrationId, now: u64) -> MigrationResult<usize> {
        let mut inner = self.inner.lock().expect("job ledger lock poisoned");
        let mut cancelled = 0;
        for job in inner.jobs.values_mut() {
            if &job.payload.migration_id == migration_id && job.state == JobState::Waiting {
                job.state = JobState::Cancelled;
                job.updated_at = now;
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    fn has_live_job(&self, migration_id: &MigrationId) -> MigrationResult<bool> {
        let inner = self.inner.lock().expect("job ledger lock poisoned");
        Ok(inner
            .jobs
            .values()
            .any(|job| &job.payload.migration_id == migration_id && job.state.is_live()))
    }

    fn live_migration_ids(&self) -> MigrationResult<HashSet<MigrationId>> {
        let inner = self.inner.lock().expect("job ledger lock poisoned");
        Ok(inner
            .jobs
            .values()
            .filter(|job| job.state.is_live())
            .map(|job| job.payload.migration_id.clone())
            .collect())
    }

    fn lane_counts(&self, lane: JobLane) -> MigrationResult<LaneCounts> {
        let inner = self.inner.lock().expect("job ledger lock poisoned");
        let mut counts = LaneCounts::default();
        for job in inner.jobs.values().filter(|job| job.lane == lane) {
            match job.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
                JobState::Cancelled => counts.cancelled += 1,
            }
        }
        Ok(counts)
    }

    fn prune_terminal_before(&self, cutoff: u64) -> MigrationResult<usize> {
        let mut inner = self.inner.lock().expect("job ledger lock poisoned");
        let before = inner.jobs.len();
        inner
            .jobs
            .retain(|_, job| job.state.is_live() || job.updated_at >= cutoff);
        Ok(before - inner.jobs.len())
    }

    fn fail_orphaned_active(&self, now: u64) -> MigrationResult<usize> {
        let mut inner = self.inner.lock().expect("job ledger lock poisoned");
        let mut failed = 0;
        for job in inner.jobs.values_mut() {
            if job.state == JobState::Active {
                job.state = JobState::Failed;
                job.last_error = Some(ORPHANED_ACTIVE_ERROR.to_owned());
                job.updated_at = now;
                failed += 1;
            }
        }
        Ok(failed)
    }
}

impl MemoryJobLedger {
    fn transition(
        &self,
        id: JobId,
        now: u64,
        mutate: impl FnOnce(&mut JobRecord),
    ) -> MigrationResult<()> {
        let mut inner = self.inner.lock().expect("job ledger lock poisoned");
        let job = inner
            .jobs
            .get_mut(&id.value())
            .ok_or_else(|| MigrationError::NotFound(format!("job {id}")))?;
        mutate(job);
        job.updated_at = now;
        Ok(())
    }
}

pub(crate) fn orphaned_active_error() -> &'static str {
    ORPHANED_ACTIVE_ERROR
}
