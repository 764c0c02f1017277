use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use migrator_core::{
    JobPayload, JobType, Migration, MigrationError, MigrationEvent, MigrationEventKind,
    MigrationId, MigrationResult, ResumePoint,
};
use migrator_process::CancellationHandle;
use migrator_workspace::{delete_workspace, WorkspacePaths};
use serde_json::json;
use time::OffsetDateTime;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::clone::MigrationEngine;
use crate::context::EngineContext;
use crate::sync::SyncEngine;

pub const DEFAULT_MAX_CONCURRENCY: usize = 5;

/// Front door for every migration operation. Enforces the per-id exclusivity
/// and global concurrency invariants, owns the cancellation registry, and
/// routes resume requests to the right engine.
pub struct MigrationOrchestrator {
    ctx: EngineContext,
    migrations: MigrationEngine,
    syncs: SyncEngine,
    in_flight: Arc<Mutex<HashSet<MigrationId>>>,
    cancellations: Arc<Mutex<HashMap<MigrationId, CancellationHandle>>>,
    permits: Arc<Semaphore>,
}

impl MigrationOrchestrator {
    pub fn new(ctx: EngineContext, max_concurrency: usize) -> Self {
        Self {
            migrations: MigrationEngine::new(ctx.clone()),
            syncs: SyncEngine::new(ctx.clone()),
            ctx,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            cancellations: Arc::new(Mutex::new(HashMap::new())),
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }

    /// Creates the migration record without starting any work. Registering an
    /// id whose record is currently in flight is a conflict.
    pub async fn register(&self, payload: &JobPayload) -> MigrationResult<Migration> {
        if let Some(existing) = self.ctx.store.find_by_id(&payload.migration_id).await? {
            if existing.status.is_in_flight() || self.is_in_flight(&payload.migration_id) {
                return Err(MigrationError::Conflict(format!(
                    "migration {} is already in flight",
                    payload.migration_id
                )));
            }
        }
        let migration = Migration::from_payload(payload, OffsetDateTime::now_utc());
        self.ctx.store.create(migration.clone()).await?;
        self.ctx.events.emit(MigrationEvent::new(
            MigrationEventKind::Registered,
            payload.migration_id.clone(),
            json!({"svn_url": payload.svn_url, "project_path": payload.project_path}),
        ));
        Ok(migration)
    }

    pub async fn run_migration(&self, payload: &JobPayload) -> MigrationResult<Migration> {
        let slot = self.claim(&payload.migration_id)?;
        let cancellation = self.arm_cancellation(&payload.migration_id);
        let result = self.migrations.execute(payload, cancellation).await;
        self.disarm_cancellation(&payload.migration_id);
        drop(slot);
        result
    }

    pub async fn run_sync(&self, id: &MigrationId) -> MigrationResult<Migration> {
        let slot = self.claim(id)?;
        let cancellation = self.arm_cancellation(id);
        let result = self.syncs.sync(id, cancellation).await;
        self.disarm_cancellation(id);
        drop(slot);
        result
    }

    /// Resumes an interrupted or failed migration. `Beginning` discards the
    /// workspace and replays the full history; otherwise the recorded baseline
    /// drives an incremental sync, which requires one to exist.
    pub async fn resume(
        &self,
        id: &MigrationId,
        from: Option<ResumePoint>,
    ) -> MigrationResult<Migration> {
        let record = self
            .ctx
            .store
            .find_by_id(id)
            .await?
            .ok_or_else(|| MigrationError::NotFound(format!("migration {id}")))?;

        match from {
            Some(ResumePoint::Beginning) => {
                let paths = WorkspacePaths::new(
                    &self.ctx.settings.temp_root,
                    id,
                    &record.metadata.project_path,
                )?;
                delete_workspace(&paths)?;
                self.ctx.events.emit(MigrationEvent::new(
                    MigrationEventKind::Resumed,
                    id.clone(),
                    json!({"from": "beginning"}),
                ));
                self.run_migration(&payload_from_record(&record)).await
            }
            Some(ResumePoint::LastSynced) | None => {
                if record.last_synced_revision.is_none() {
                    return Err(MigrationError::CannotResume(format!(
                        "migration {id} has no synced baseline; resume from the beginning instead"
                    )));
                }
                self.ctx.events.emit(MigrationEvent::new(
                    MigrationEventKind::Resumed,
                    id.clone(),
                    json!({"from": "last_synced", "baseline": record.last_synced_revision}),
                ));
                self.run_sync(id).await
            }
        }
    }

    /// Signals the active run for this id, if any. The subprocess receives
    /// SIGTERM and escalates to SIGKILL after the grace period.
    pub fn cancel(&self, id: &MigrationId) -> bool {
        let cancellations = self
            .cancellations
            .lock()
            .expect("cancellation registry lock poisoned");
        match cancellations.get(id) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Removes the record, its logs, and any leftover workspace. In-flight
    /// migrations must be cancelled first.
    pub async fn delete_migration(&self, id: &MigrationId) -> MigrationResult<()> {
        if self.is_in_flight(id) {
            return Err(MigrationError::Conflict(format!(
                "migration {id} is in flight; cancel it before deleting"
            )));
        }
        let record = self
            .ctx
            .store
            .find_by_id(id)
            .await?
            .ok_or_else(|| MigrationError::NotFound(format!("migration {id}")))?;
        let paths =
            WorkspacePaths::new(&self.ctx.settings.temp_root, id, &record.metadata.project_path)?;
        delete_workspace(&paths)?;
        self.ctx.store.delete(id).await
    }

    pub fn is_in_flight(&self, id: &MigrationId) -> bool {
        self.in_flight
            .lock()
            .expect("in-flight set lock poisoned")
            .contains(id)
    }

    fn claim(&self, id: &MigrationId) -> MigrationResult<InFlightSlot> {
        let mut in_flight = self.in_flight.lock().expect("in-flight set lock poisoned");
        if !in_flight.insert(id.clone()) {
            return Err(MigrationError::Conflict(format!(
                "migration {id} is already in flight"
            )));
        }
        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                in_flight.remove(id);
                return Err(MigrationError::QueueExhausted(
                    "all concurrent migration slots are busy".to_owned(),
                ));
            }
            Err(TryAcquireError::Closed) => {
                in_flight.remove(id);
                return Err(MigrationError::Internal(
                    "concurrency semaphore closed".to_owned(),
                ));
            }
        };
        Ok(InFlightSlot {
            set: Arc::clone(&self.in_flight),
            id: id.clone(),
            _permit: permit,
        })
    }

    fn arm_cancellation(&self, id: &MigrationId) -> CancellationHandle {
        let handle = CancellationHandle::new();
        self.cancellations
            .lock()
            .expect("cancellation registry lock poisoned")
            .insert(id.clone(), handle.clone());
        handle
    }

    fn disarm_cancellation(&self, id: &MigrationId) {
        self.cancellations
            .lock()
            .expect("cancellation registry lock poisoned")
            .remove(id);
    }
}

/// Releases the per-id claim when the run finishes, panicking included.
struct InFlightSlot {
    set: Arc<Mutex<HashSet<MigrationId>>>,
    id: MigrationId,
    _permit: OwnedSemaphorePermit,
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.set
            .lock()
            .expect("in-flight set lock poisoned")
            .remove(&self.id);
    }
}

fn payload_from_record(record: &Migration) -> JobPayload {
    JobPayload {
        migration_id: record.id.clone(),
        svn_url: record.svn_url.clone(),
        svn_username: record.svn_username.clone(),
        svn_password: record.svn_password.clone(),
        gitlab_project_id: record.gitlab_project_id,
        gitlab_url: record.gitlab_url.clone(),
        gitlab_token: record.gitlab_token.clone(),
        project_name: record.metadata.project_name.clone(),
        project_path: record.metadata.project_path.clone(),
        layout: record.layout.clone(),
        authors_mapping: record.authors_mapping.clone(),
        options: migrator_core::MigrationOptions {
            keep_workspace: record.metadata.keep_workspace,
        },
        job_type: JobType::Resume,
        resume_from: Some(ResumePoint::Beginning),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use migrator_core::{
        JobPayload, JobType, Migration, MigrationError, MigrationId, MigrationRecordStore,
        MigrationResult, MigrationStatus, MigrationUpdate, ResumePoint,
    };
    use migrator_queue::{
        JobExecutor, JobLane, JobLedger, MemoryJobLedger, QueueSettings, WorkerJobQueue,
    };
    use time::OffsetDateTime;
    use tokio::time::timeout;

    use super::MigrationOrchestrator;
    use crate::testutil::{payload, ScriptedCall, TestHarness};

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// Routes claimed queue jobs onto the orchestrator the way the binary does.
    struct QueuedRuns {
        orchestrator: Arc<MigrationOrchestrator>,
    }

    #[async_trait]
    impl JobExecutor for QueuedRuns {
        async fn execute(&self, payload: &JobPayload) -> MigrationResult<()> {
            match payload.job_type {
                JobType::Full => self.orchestrator.run_migration(payload).await.map(drop),
                JobType::Resume => self
                    .orchestrator
                    .resume(&payload.migration_id, payload.resume_from)
                    .await
                    .map(drop),
                JobType::Sync => self
                    .orchestrator
                    .run_sync(&payload.migration_id)
                    .await
                    .map(drop),
            }
        }

        fn cancel_active(&self, migration_id: &MigrationId) -> bool {
            self.orchestrator.cancel(migration_id)
        }
    }

    fn full_run_script() -> Vec<ScriptedCall> {
        vec![
            ScriptedCall::succeed("info --show-item revision").with_stdout(&["3"]),
            ScriptedCall::succeed("svn clone").with_stdout(&[
                "r1 = aaa (refs/remotes/origin/trunk)",
                "r2 = bbb (refs/remotes/origin/trunk)",
                "r3 = ccc (refs/remotes/origin/trunk)",
            ]),
            ScriptedCall::succeed("--all"),
            ScriptedCall::succeed("--tags"),
        ]
    }

    #[tokio::test]
    async fn concurrent_runs_of_the_same_id_conflict() {
        let harness = TestHarness::new(vec![ScriptedCall::succeed("info --show-item revision")
            .with_stdout(&["3"])
            , ScriptedCall::block_until_cancelled("svn clone")]);
        let orchestrator = Arc::new(MigrationOrchestrator::new(harness.ctx.clone(), 5));

        let background = Arc::clone(&orchestrator);
        let running = tokio::spawn(async move { background.run_migration(&payload("mig-1")).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = orchestrator.run_migration(&payload("mig-1")).await;
        assert!(matches!(second, Err(MigrationError::Conflict(_))));

        assert!(orchestrator.cancel(&"mig-1".into()));
        let first = timeout(TEST_TIMEOUT, running)
            .await
            .expect("first run timed out")
            .expect("task panicked");
        assert!(matches!(first, Err(MigrationError::Cancelled(_))));
        assert!(!orchestrator.is_in_flight(&"mig-1".into()));
    }

    #[tokio::test]
    async fn saturated_slots_reject_additional_migrations() {
        let harness = TestHarness::new(vec![
            ScriptedCall::succeed("info --show-item revision").with_stdout(&["3"]),
            ScriptedCall::block_until_cancelled("svn clone"),
        ]);
        let orchestrator = Arc::new(MigrationOrchestrator::new(harness.ctx.clone(), 1));

        let background = Arc::clone(&orchestrator);
        let running = tokio::spawn(async move { background.run_migration(&payload("mig-1")).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = orchestrator.run_migration(&payload("mig-2")).await;
        assert!(matches!(second, Err(MigrationError::QueueExhausted(_))));

        orchestrator.cancel(&"mig-1".into());
        let _ = timeout(TEST_TIMEOUT, running).await.expect("run timed out");

        // The slot frees up once the first run finishes.
        let cancelled_record = harness
            .store
            .find_by_id(&"mig-1".into())
            .await
            .expect("find")
            .expect("record");
        assert_eq!(cancelled_record.status, MigrationStatus::Failed);
    }

    #[tokio::test]
    async fn resume_from_the_beginning_discards_the_workspace() {
        let harness = TestHarness::new(full_run_script());
        let orchestrator = MigrationOrchestrator::new(harness.ctx.clone(), 5);

        let migration = Migration::from_payload(&payload("mig-1"), OffsetDateTime::now_utc());
        harness.store.create(migration).await.expect("create");
        harness
            .store
            .update(&"mig-1".into(), MigrationUpdate::failed("network blip"))
            .await
            .expect("update");
        let stale_marker = harness
            .ctx
            .settings
            .temp_root
            .join("mig-1/repo/.git/svn");
        fs::create_dir_all(&stale_marker).expect("stale workspace");
        fs::write(stale_marker.join("stale-file"), "old").expect("marker");

        let resumed = orchestrator
            .resume(&"mig-1".into(), Some(ResumePoint::Beginning))
            .await
            .expect("resume should complete");

        assert_eq!(resumed.status, MigrationStatus::Completed);
        assert_eq!(resumed.last_synced_revision, Some(3));
        assert!(!stale_marker.join("stale-file").exists());
        assert_eq!(harness.runner.remaining(), 0);
    }

    #[tokio::test]
    async fn resume_without_a_baseline_cannot_use_last_synced() {
        let harness = TestHarness::new(Vec::new());
        let orchestrator = MigrationOrchestrator::new(harness.ctx.clone(), 5);

        let migration = Migration::from_payload(&payload("mig-1"), OffsetDateTime::now_utc());
        harness.store.create(migration).await.expect("create");
        harness
            .store
            .update(&"mig-1".into(), MigrationUpdate::failed("died early"))
            .await
            .expect("update");

        let error = orchestrator
            .resume(&"mig-1".into(), Some(ResumePoint::LastSynced))
            .await
            .expect_err("resume must be rejected");
        assert!(matches!(error, MigrationError::CannotResume(_)));

        let error = orchestrator
            .resume(&"mig-1".into(), None)
            .await
            .expect_err("default resume point is the baseline");
        assert!(matches!(error, MigrationError::CannotResume(_)));
    }

    #[tokio::test]
    async fn resume_of_an_unknown_migration_is_not_found() {
        let harness = TestHarness::new(Vec::new());
        let orchestrator = MigrationOrchestrator::new(harness.ctx.clone(), 5);

        let error = orchestrator
            .resume(&"mig-ghost".into(), Some(ResumePoint::Beginning))
            .await
            .expect_err("unknown id must fail");
        assert!(matches!(error, MigrationError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_removes_the_record_and_workspace() {
        let harness = TestHarness::new(Vec::new());
        let orchestrator = MigrationOrchestrator::new(harness.ctx.clone(), 5);

        let migration = Migration::from_payload(&payload("mig-1"), OffsetDateTime::now_utc());
        harness.store.create(migration).await.expect("create");
        let workspace = harness.ctx.settings.temp_root.join("mig-1");
        fs::create_dir_all(workspace.join("repo")).expect("workspace");

        orchestrator
            .delete_migration(&"mig-1".into())
            .await
            .expect("delete should succeed");

        assert!(!workspace.exists());
        assert!(harness
            .store
            .find_by_id(&"mig-1".into())
            .await
            .expect("find")
            .is_none());
    }

    #[tokio::test]
    async fn delete_of_an_in_flight_migration_conflicts() {
        let harness = TestHarness::new(vec![
            ScriptedCall::succeed("info --show-item revision").with_stdout(&["3"]),
            ScriptedCall::block_until_cancelled("svn clone"),
        ]);
        let orchestrator = Arc::new(MigrationOrchestrator::new(harness.ctx.clone(), 5));

        let background = Arc::clone(&orchestrator);
        let running = tokio::spawn(async move { background.run_migration(&payload("mig-1")).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let error = orchestrator
            .delete_migration(&"mig-1".into())
            .await
            .expect_err("deleting an active migration must fail");
        assert!(matches!(error, MigrationError::Conflict(_)));

        orchestrator.cancel(&"mig-1".into());
        let _ = timeout(TEST_TIMEOUT, running).await.expect("run timed out");
    }

    #[tokio::test]
    async fn cancel_without_an_active_run_reports_false() {
        let harness = TestHarness::new(Vec::new());
        let orchestrator = MigrationOrchestrator::new(harness.ctx.clone(), 5);
        assert!(!orchestrator.cancel(&"mig-idle".into()));
    }

    #[tokio::test]
    async fn queued_migration_retries_a_transient_failure_and_completes_once() {
        // First attempt dies mid-clone; the requeued attempt replays the whole
        // run and succeeds.
        let harness = TestHarness::new(vec![
            ScriptedCall::succeed("info --show-item revision").with_stdout(&["3"]),
            ScriptedCall::fail(
                "svn clone",
                MigrationError::Connection("connection reset during clone".to_owned()),
            ),
            ScriptedCall::succeed("info --show-item revision").with_stdout(&["3"]),
            ScriptedCall::succeed("svn clone").with_stdout(&[
                "r1 = aaa (refs/remotes/origin/trunk)",
                "r2 = bbb (refs/remotes/origin/trunk)",
                "r3 = ccc (refs/remotes/origin/trunk)",
            ]),
            ScriptedCall::succeed("--all"),
            ScriptedCall::succeed("--tags"),
        ]);
        let orchestrator = Arc::new(MigrationOrchestrator::new(harness.ctx.clone(), 5));
        let executor = Arc::new(QueuedRuns {
            orchestrator: Arc::clone(&orchestrator),
        });
        let ledger: Arc<dyn JobLedger> = Arc::new(MemoryJobLedger::new());
        let settings = QueueSettings {
            migration_workers: 1,
            sync_workers: 1,
            max_attempts: 3,
            migration_retry_backoff: Duration::ZERO,
            sync_retry_backoff: Duration::ZERO,
            poll_interval: Duration::from_millis(10),
        };
        let queue = WorkerJobQueue::start(
            Arc::clone(&ledger),
            executor,
            harness.store.clone(),
            settings,
        )
        .expect("queue start");

        queue.enqueue(payload("mig-1")).await.expect("enqueue");

        timeout(TEST_TIMEOUT, async {
            while ledger
                .lane_counts(JobLane::Migration)
                .expect("lane counts")
                .completed
                == 0
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("queued migration never completed");
        queue.shutdown().await;

        let record = harness
            .store
            .find_by_id(&"mig-1".into())
            .await
            .expect("find")
            .expect("record");
        assert_eq!(record.status, MigrationStatus::Completed);
        assert_eq!(record.last_synced_revision, Some(3));
        // Both scripted attempts ran, and exactly one job completed.
        assert_eq!(harness.runner.remaining(), 0);
        let counts = ledger.lane_counts(JobLane::Migration).expect("lane counts");
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.failed, 0);
    }
}
