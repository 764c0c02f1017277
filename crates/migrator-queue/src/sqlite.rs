use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use migrator_core::{JobId, JobPayload, MigrationError, MigrationId, MigrationResult};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::lane::{JobLane, LaneCounts};
use crate::ledger::{orphaned_active_error, JobLedger, JobRecord, JobState};

const JOB_COLUMNS: &str =
    "id, migration_id, lane, state, payload, attempts, last_error, not_before, enqueued_at, updated_at";

/// Durable job ledger on a single sqlite file. All access is serialized
/// through one connection; every ledger operation is a short indexed query.
pub struct SqliteJobLedger {
    conn: Mutex<Connection>,
}

struct RawJob {
    id: i64,
    lane: String,
    state: String,
    payload: String,
    attempts: i64,
    last_error: Option<String>,
    not_before: i64,
    enqueued_at: i64,
    updated_at: i64,
}

impl RawJob {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            lane: row.get(2)?,
            state: row.get(3)?,
            payload: row.get(4)?,
            attempts: row.get(5)?,
            last_error: row.get(6)?,
            not_before: row.get(7)?,
            enqueued_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    /// Malformed rows surface as persistence errors rather than panics.
    fn decode(self) -> MigrationResult<JobRecord> {
        let lane = JobLane::parse(&self.lane).ok_or_else(|| {
            MigrationError::Persistence(format!("job {} has unknown lane '{}'", self.id, self.lane))
        })?;
        let state = JobState::parse(&self.state).ok_or_else(|| {
            MigrationError::Persistence(format!(
                "job {} has unknown state '{}'",
                self.id, self.state
            ))
        })?;
        let payload: JobPayload = serde_json::from_str(&self.payload).map_err(|error| {
            MigrationError::Persistence(format!("job {} payload is malformed: {error}", self.id))
        })?;
        Ok(JobRecord {
            id: JobId::new(self.id as u64),
            lane,
            payload,
            state,
            attempts: self.attempts as u32,
            last_error: self.last_error,
            not_before: self.not_before as u64,
            enqueued_at: self.enqueued_at as u64,
            updated_at: self.updated_at as u64,
        })
    }
}

impl SqliteJobLedger {
    pub fn open(path: impl AsRef<Path>) -> MigrationResult<Self> {
        let conn = Connection::open(path)
            .map_err(|error| MigrationError::Persistence(error.to_string()))?;
        let ledger = Self {
            conn: Mutex::new(conn),
        };
        ledger.bootstrap()?;
        Ok(ledger)
    }

    pub fn in_memory() -> MigrationResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|error| MigrationError::Persistence(error.to_string()))?;
        let ledger = Self {
            conn: Mutex::new(conn),
        };
        ledger.bootstrap()?;
        Ok(ledger)
    }

    /// Creating the schema doubles as the startup write probe: a read-only or
    /// unwritable database fails here instead of at the first enqueue.
    fn bootstrap(&self) -> MigrationResult<()> {
        let conn = self.conn.lock().expect("job ledger connection poisoned");
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                migration_id TEXT NOT NULL,
                lane TEXT NOT NULL,
                state TEXT NOT NULL,
                payload TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                not_before INTEGER NOT NULL DEFAULT 0,
                enqueued_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_claim
                ON jobs (lane, state, not_before, id);
            CREATE INDEX IF NOT EXISTS idx_jobs_migration
                ON jobs (migration_id, state);
            ",
        )
        .map_err(|error| MigrationError::Persistence(error.to_string()))
    }
}

impl JobLedger for SqliteJobLedger {
    fn enqueue(&self, payload: JobPayload, now: u64) -> MigrationResult<JobRecord> {
        let lane = JobLane::for_job_type(payload.job_type);
        let encoded = serde_json::to_string(&payload)
            .map_err(|error| MigrationError::Persistence(format!("payload encoding: {error}")))?;
        let conn = self.conn.lock().expect("job ledger connection poisoned");
        conn.execute(
            "
            INSERT INTO jobs (migration_id, lane, state, payload, attempts, not_before, enqueued_at, updated_at)
            VALUES (?1, ?2, 'waiting', ?3, 0, 0, ?4, ?4)
            ",
            params![payload.migration_id.as_str(), lane.as_str(), encoded, now as i64],
        )
        .map_err(|error| MigrationError::Persistence(error.to_string()))?;
        let id = conn.last_insert_rowid();
        Ok(JobRecord {
            id: JobId::new(id as u64),
            lane,
            payload,
            state: JobState::Waiting,
            attempts: 0,
            last_error: None,
            not_before: 0,
            enqueued_at: now,
            updated_at: now,
        })
    }

    fn claim_next_waiting(&self, lane: JobLane, now: u64) -> MigrationResult<Option<JobRecord>> {
        let mut conn = self.conn.lock().expect("job ledger connection poisoned");
        let tx = conn
            .transaction()
            .map_err(|error| MigrationError::Persistence(error.to_string()))?;
        let raw = tx
            .query_row(
                &format!(
                    "
                    SELECT {JOB_COLUMNS} FROM jobs
                    WHERE lane = ?1 AND state = 'waiting' AND not_before <= ?2
                    ORDER BY id ASC
                    LIMIT 1
                    "
                ),
                params![lane.as_str(), now as i64],
                RawJob::read,
            )
            .optional()
            .map_err(|error| MigrationError::Persistence(error.to_string()))?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        tx.execute(
            "UPDATE jobs SET state = 'active', attempts = attempts + 1, updated_at = ?2 WHERE id = ?1",
            params![raw.id, now as i64],
        )
        .map_err(|error| MigrationError::Persistence(error.to_string()))?;
        tx.commit()
            .map_err(|error| MigrationError::Persistence(error.to_string()))?;

        let mut record = raw.decode()?;
        record.state = JobState::Active;
        record.attempts += 1;
        record.updated_at = now;
        Ok(Some(record))
    }

    fn mark_completed(&self, id: JobId, now: u64) -> MigrationResult<()> {
        let conn = self.conn.lock().expect("job ledger connection poisoned");
        let changed = conn
            .execute(
                "UPDATE jobs SET state = 'completed', updated_at = ?2 WHERE id = ?1",
                params![id.value() as i64, now as i64],
            )
            .map_err(|error| MigrationError::Persistence(error.to_string()))?;
        if changed == 0 {
            return Err(MigrationError::NotFound(format!("job {id}")));
        }
        Ok(())
    }

    fn record_attempt(
        &self,
        id: JobId,
        error: &str,
        retry_at: Option<u64>,
        now: u64,
    ) -> MigrationResult<()> {
        let conn = self.conn.lock().expect("job ledger connection poisoned");
        let changed = match retry_at {
            Some(retry_at) => conn.execute(
                "
                UPDATE jobs SET state = 'waiting', last_error = ?2, not_before = ?3, updated_at = ?4
                WHERE id = ?1
                ",
                params![id.value() as i64, error, retry_at as i64, now as i64],
            ),
            None => conn.execute(
                "UPDATE jobs SET state = 'failed', last_error = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.value() as i64, error, now as i64],
            ),
        }
        .map_err(|error| MigrationError::Persistence(error.to_string()))?;
        if changed == 0 {
            return Err(MigrationError::NotFound(format!("job {id}")));
        }
        Ok(())
    }

    fn cancel_waiting(&self, migration_id: &MigrationId, now: u64) -> MigrationResult<usize> {
        let conn = self.conn.lock().expect("job ledger connection poisoned");
        conn.execute(
            "
            UPDATE jobs SET state = 'cancelled', updated_at = ?2
            WHERE migration_id = ?1 AND state = 'waiting'
            ",
            params![migration_id.as_str(), now as i64],
        )
        .map_err(|error| MigrationError::Persistence(error.to_string()))
    }

    fn has_live_job(&self, migration_id: &MigrationId) -> MigrationResult<bool> {
        let conn = self.conn.lock().expect("job ledger connection poisoned");
        let count: i64 = conn
            .query_row(
                "
                SELECT COUNT(*) FROM jobs
                WHERE migration_id = ?1 AND state IN ('waiting', 'active')
                ",
                params![migration_id.as_str()],
                |row| row.get(0),
            )
            .map_err(|error| MigrationError::Persistence(error.to_string()))?;
        Ok(count > 0)
    }

    fn live_migration_ids(&self) -> MigrationResult<HashSet<MigrationId>> {
        let conn = self.conn.lock().expect("job ledger connection poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT DISTINCT migration_id FROM jobs WHERE state IN ('waiting', 'active')",
            )
            .map_err(|error| MigrationError::Persistence(error.to_string()))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|error| MigrationError::Persistence(error.to_string()))?;
        let mut ids = HashSet::new();
        for row in rows {
            let id = row.map_err(|error| MigrationError::Persistence(error.to_string()))?;
            ids.insert(MigrationId::new(id));
        }
        Ok(ids)
    }

    fn lane_counts(&self, lane: JobLane) -> MigrationResult<LaneCounts> {
        let conn = self.conn.lock().expect("job ledger connection poisoned");
        let mut stmt = conn
            .prepare("SELECT state, COUNT(*) FROM jobs WHERE lane = ?1 GROUP BY state")
            .map_err(|error| MigrationError::Persistence(error.to_string()))?;
        let rows = stmt
            .query_map(params![lane.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(|error| MigrationError::Persistence(error.to_string()))?;
        let mut counts = LaneCounts::default();
        for row in rows {
            let (state, count) =
                row.map_err(|error| MigrationError::Persistence(error.to_string()))?;
            let count = count as usize;
            match JobState::parse(&state) {
                Some(JobState::Waiting) => counts.waiting = count,
                Some(JobState::Active) => counts.active = count,
                Some(JobState::Completed) => counts.completed = count,
                Some(JobState::Failed) => counts.failed = count,
                Some(JobState::Cancelled) => counts.cancelled = count,
                None => {
                    return Err(MigrationError::Persistence(format!(
                        "jobs table holds unknown state '{state}'"
                    )))
                }
            }
        }
        Ok(counts)
    }

    fn prune_terminal_before(&self, cutoff: u64) -> MigrationResult<usize> {
        let conn = self.conn.lock().expect("job ledger connection poisoned");
        conn.execute(
            "
            DELETE FROM jobs
            WHERE state IN ('completed', 'failed', 'cancelled') AND updated_at < ?1
            ",
            params![cutoff as i64],
        )
        .map_err(|error| MigrationError::Persistence(error.to_string()))
    }

    fn fail_orphaned_active(&self, now: u64) -> MigrationResult<usize> {
        let conn = self.conn.lock().expect("job ledger connection poisoned");
        conn.execute(
            "
            UPDATE jobs SET state = 'failed', last_error = ?1, updated_at = ?2
            WHERE state = 'active'
            ",
            params![orphaned_active_error(), now as i64],
        )
        .map_err(|error| MigrationError::Persistence(error.to_string()))
    }
}
