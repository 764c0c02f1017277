use migrator_core::{
    Migration, MigrationError, MigrationEvent, MigrationEventKind, MigrationId, MigrationResult,
    MigrationStatus, MigrationUpdate,
};
use migrator_gitlab::push_remote_url;
use migrator_process::{CancellationHandle, CommandRequest};
use migrator_workspace::{reconcile, WorkspacePaths};
use serde_json::json;

use crate::clone::record_failure;
use crate::commands::{estimate_head_revision, fetch_args, push_refs, rebase_local};
use crate::context::EngineContext;
use crate::progress::run_streamed;

/// Runs incremental syncs: fetch revisions newer than the recorded baseline
/// into an existing workspace and push whatever arrived.
pub struct SyncEngine {
    ctx: EngineContext,
}

impl SyncEngine {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Syncs one migration. Preconditions (record exists, nothing else is in
    /// flight, the workspace still carries bridge metadata) are checked before
    /// the record is touched, so precondition failures never mark a healthy
    /// migration as failed.
    pub async fn sync(
        &self,
        id: &MigrationId,
        cancellation: CancellationHandle,
    ) -> MigrationResult<Migration> {
        let record = self
            .ctx
            .store
            .find_by_id(id)
            .await?
            .ok_or_else(|| MigrationError::NotFound(format!("migration {id}")))?;
        if record.status.is_in_flight() {
            return Err(MigrationError::Conflict(format!(
                "migration {id} is already {}",
                record.status.as_str()
            )));
        }
        let paths =
            WorkspacePaths::new(&self.ctx.settings.temp_root, id, &record.metadata.project_path)?;
        if !paths.exists() || !paths.bridge_metadata_dir().is_dir() {
            return Err(MigrationError::Resumability(format!(
                "workspace for migration {id} has no bridge metadata; resume from the beginning instead"
            )));
        }

        match self.run_sync(record, &paths, cancellation).await {
            Ok(migration) => Ok(migration),
            Err(error) => Err(record_failure(&self.ctx, id, error).await),
        }
    }

    async fn run_sync(
        &self,
        record: Migration,
        paths: &WorkspacePaths,
        cancellation: CancellationHandle,
    ) -> MigrationResult<Migration> {
        let id = record.id.clone();
        let project = self.ctx.projects.find_project(record.gitlab_project_id).await?;

        self.ctx
            .store
            .update(
                &id,
                MigrationUpdate {
                    status: Some(MigrationStatus::Syncing),
                    clear_last_error: true,
                    ..Default::default()
                },
            )
            .await?;
        self.ctx.events.emit(MigrationEvent::new(
            MigrationEventKind::Syncing,
            id.clone(),
            json!({"baseline_revision": record.last_synced_revision}),
        ));
        tracing::info!(
            migration_id = %id,
            baseline = ?record.last_synced_revision,
            "incremental sync started"
        );

        reconcile(paths.repo_dir())?;

        let mut total_hint = record.total_revisions;
        if let Some(head) = estimate_head_revision(&self.ctx, &record, &cancellation).await {
            total_hint = total_hint.max(head);
        }

        let mut request = CommandRequest::new(
            self.ctx.settings.git_binary.clone(),
            fetch_args(self.ctx.settings.log_window_size),
        );
        request.cwd = Some(paths.repo_dir().to_path_buf());
        let summary = run_streamed(
            &self.ctx,
            &id,
            request,
            record.last_synced_revision,
            total_hint,
            cancellation.clone(),
        )
        .await?;

        if summary.new_commits == 0 {
            // Nothing arrived: restore the terminal state without a push.
            let migration = self
                .ctx
                .store
                .update(&id, MigrationUpdate::status(MigrationStatus::Completed))
                .await?;
            self.ctx.events.emit(MigrationEvent::new(
                MigrationEventKind::Synced,
                id.clone(),
                json!({"new_commits": 0, "last_synced_revision": migration.last_synced_revision}),
            ));
            tracing::info!(migration_id = %id, "sync found no new revisions");
            return Ok(migration);
        }

        rebase_local(&self.ctx, paths, &cancellation).await?;
        let push_url = push_remote_url(&project.http_url_to_repo, &record.gitlab_token)?;
        push_refs(&self.ctx, paths, &push_url, &cancellation).await?;

        let migration = self
            .ctx
            .store
            .update(
                &id,
                MigrationUpdate {
                    status: Some(MigrationStatus::Completed),
                    last_synced_revision: summary.max_revision,
                    total_revisions: summary.max_revision,
                    total_commits: Some(record.metadata.total_commits + summary.new_commits),
                    ..Default::default()
                },
            )
            .await?;
        self.ctx.events.emit(MigrationEvent::new(
            MigrationEventKind::Synced,
            id.clone(),
            json!({
                "new_commits": summary.new_commits,
                "last_synced_revision": migration.last_synced_revision,
            }),
        ));
        tracing::info!(
            migration_id = %id,
            new_commits = summary.new_commits,
            "incremental sync completed"
        );
        Ok(migration)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use migrator_core::{
        Migration, MigrationError, MigrationEventKind, MigrationRecordStore, MigrationStatus,
        MigrationUpdate,
    };
    use migrator_process::CancellationHandle;
    use time::OffsetDateTime;

    use super::SyncEngine;
    use crate::testutil::{drain_events, kinds, payload, ScriptedCall, TestHarness};

    /// Seeds a completed migration whose workspace still has bridge metadata.
    async fn seed_synced_migration(harness: &TestHarness, id: &str, baseline: u64) -> Migration {
        let migration = Migration::from_payload(&payload(id), OffsetDateTime::now_utc());
        harness.store.create(migration).await.expect("create");
        let record = harness
            .store
            .update(
                &id.into(),
                MigrationUpdate {
                    status: Some(MigrationStatus::Completed),
                    last_synced_revision: Some(baseline),
                    total_revisions: Some(baseline),
                    revisions_estimated: Some(false),
                    total_commits: Some(baseline),
                    ..Default::default()
                },
            )
            .await
            .expect("update");
        let metadata_dir = harness
            .ctx
            .settings
            .temp_root
            .join(id)
            .join("repo/.git/svn");
        fs::create_dir_all(metadata_dir).expect("workspace metadata");
        record
    }

    #[tokio::test]
    async fn sync_fetches_new_revisions_and_pushes() {
        let harness = TestHarness::new(vec![
            ScriptedCall::succeed("info --show-item revision").with_stdout(&["6"]),
            ScriptedCall::succeed("svn fetch").with_stdout(&[
                "r5 = eee (refs/remotes/origin/trunk)",
                "r6 = fff (refs/remotes/origin/trunk)",
            ]),
            ScriptedCall::succeed("svn rebase"),
            ScriptedCall::succeed("--all"),
            ScriptedCall::succeed("--tags"),
        ]);
        seed_synced_migration(&harness, "mig-1", 4).await;
        let engine = SyncEngine::new(harness.ctx.clone());
        let mut receiver = harness.events.subscribe();

        let synced = engine
            .sync(&"mig-1".into(), CancellationHandle::new())
            .await
            .expect("sync should complete");

        assert_eq!(synced.status, MigrationStatus::Completed);
        assert_eq!(synced.last_synced_revision, Some(6));
        assert_eq!(synced.metadata.total_commits, 6);
        assert_eq!(harness.runner.remaining(), 0);

        let kinds = kinds(&drain_events(&mut receiver));
        assert!(kinds.contains(&MigrationEventKind::Syncing));
        assert_eq!(kinds.last(), Some(&MigrationEventKind::Synced));
    }

    #[tokio::test]
    async fn sync_with_no_new_revisions_skips_the_push() {
        let harness = TestHarness::new(vec![
            ScriptedCall::succeed("info --show-item revision").with_stdout(&["4"]),
            // The bridge replays an already-synced revision; nothing is new.
            ScriptedCall::succeed("svn fetch")
                .with_stdout(&["r4 = ddd (refs/remotes/origin/trunk)"]),
        ]);
        seed_synced_migration(&harness, "mig-1", 4).await;
        let engine = SyncEngine::new(harness.ctx.clone());
        let mut receiver = harness.events.subscribe();

        let synced = engine
            .sync(&"mig-1".into(), CancellationHandle::new())
            .await
            .expect("no-op sync should complete");

        assert_eq!(synced.status, MigrationStatus::Completed);
        assert_eq!(synced.last_synced_revision, Some(4));
        assert_eq!(synced.metadata.total_commits, 4);
        assert_eq!(harness.runner.remaining(), 0);

        let events = drain_events(&mut receiver);
        let synced_event = events
            .iter()
            .find(|event| event.kind == MigrationEventKind::Synced)
            .expect("synced event");
        assert_eq!(synced_event.payload["new_commits"], 0);
    }

    #[tokio::test]
    async fn sync_of_a_missing_migration_fails_fast() {
        let harness = TestHarness::new(Vec::new());
        let engine = SyncEngine::new(harness.ctx.clone());

        let error = engine
            .sync(&"mig-missing".into(), CancellationHandle::new())
            .await
            .expect_err("missing record must fail");

        assert!(matches!(error, MigrationError::NotFound(_)));
    }

    #[tokio::test]
    async fn sync_without_bridge_metadata_reports_resumability() {
        let harness = TestHarness::new(Vec::new());
        let migration = Migration::from_payload(&payload("mig-1"), OffsetDateTime::now_utc());
        harness.store.create(migration).await.expect("create");
        harness
            .store
            .update(
                &"mig-1".into(),
                MigrationUpdate {
                    status: Some(MigrationStatus::Completed),
                    last_synced_revision: Some(4),
                    ..Default::default()
                },
            )
            .await
            .expect("update");
        let engine = SyncEngine::new(harness.ctx.clone());

        let error = engine
            .sync(&"mig-1".into(), CancellationHandle::new())
            .await
            .expect_err("missing workspace must fail");

        assert!(matches!(error, MigrationError::Resumability(_)));
        // Precondition failures never flip a healthy record to failed.
        let record = harness
            .store
            .find_by_id(&"mig-1".into())
            .await
            .expect("find")
            .expect("record");
        assert_eq!(record.status, MigrationStatus::Completed);
    }

    #[tokio::test]
    async fn fetch_failure_marks_the_migration_failed() {
        let harness = TestHarness::new(vec![
            ScriptedCall::succeed("info --show-item revision").with_stdout(&["6"]),
            ScriptedCall::fail(
                "svn fetch",
                MigrationError::ProcessExit {
                    code: 1,
                    stderr_tail: "svn: E175002: connection reset".to_owned(),
                },
            ),
        ]);
        seed_synced_migration(&harness, "mig-1", 4).await;
        let engine = SyncEngine::new(harness.ctx.clone());

        let error = engine
            .sync(&"mig-1".into(), CancellationHandle::new())
            .await
            .expect_err("fetch failure must propagate");

        assert!(matches!(error, MigrationError::ProcessExit { .. }));
        let record = harness
            .store
            .find_by_id(&"mig-1".into())
            .await
            .expect("find")
            .expect("record");
        assert_eq!(record.status, MigrationStatus::Failed);
        // The prior baseline survives the failed attempt.
        assert_eq!(record.last_synced_revision, Some(4));
    }
}
