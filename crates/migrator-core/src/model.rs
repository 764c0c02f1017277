use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::ids::{JobId, MigrationId};
use crate::job::JobPayload;

/// Migration lifecycle state.
///
/// `Registered -> Running -> {Completed | Failed}`; completed or failed
/// migrations re-enter via `Syncing` (incremental sync / resume) or `Running`
/// (resume from the beginning).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Registered,
    Running,
    Syncing,
    Completed,
    Failed,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Running => "running",
            Self::Syncing => "syncing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// In-flight states own the workspace exclusively.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Running | Self::Syncing)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Trunk/branches/tags paths inside the source repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryLayout {
    pub trunk: String,
    pub branches: String,
    pub tags: String,
}

impl Default for RepositoryLayout {
    fn default() -> Self {
        Self {
            trunk: "trunk".to_owned(),
            branches: "branches".to_owned(),
            tags: "tags".to_owned(),
        }
    }
}

impl RepositoryLayout {
    /// The bridge tool's standard-layout shortcut applies only when all three
    /// paths exactly equal the conventional names.
    pub fn is_standard(&self) -> bool {
        self.trunk == "trunk" && self.branches == "branches" && self.tags == "tags"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MigrationMetadata {
    pub project_name: String,
    pub project_path: String,
    pub keep_workspace: bool,
    pub job_id: Option<JobId>,
    pub last_error: Option<String>,
    pub total_commits: u64,
}

/// Durable record of one migration. Owned and mutated only by the engine
/// currently executing for its id; concurrent writers race last-writer-wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub id: MigrationId,
    pub svn_url: String,
    pub svn_username: Option<String>,
    pub svn_password: Option<String>,
    pub gitlab_project_id: u64,
    pub gitlab_url: String,
    pub gitlab_token: String,
    pub layout: RepositoryLayout,
    pub authors_mapping: BTreeMap<String, String>,
    pub status: MigrationStatus,
    pub last_synced_revision: Option<u64>,
    pub total_revisions: u64,
    pub revisions_estimated: bool,
    pub metadata: MigrationMetadata,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Migration {
    pub fn from_payload(payload: &JobPayload, now: OffsetDateTime) -> Self {
        Self {
            id: payload.migration_id.clone(),
            svn_url: payload.svn_url.clone(),
            svn_username: payload.svn_username.clone(),
            svn_password: payload.svn_password.clone(),
            gitlab_project_id: payload.gitlab_project_id,
            gitlab_url: payload.gitlab_url.clone(),
            gitlab_token: payload.gitlab_token.clone(),
            layout: payload.layout.clone(),
            authors_mapping: payload.authors_mapping.clone(),
            status: MigrationStatus::Registered,
            last_synced_revision: None,
            total_revisions: 0,
            revisions_estimated: true,
            metadata: MigrationMetadata {
                project_name: payload.project_name.clone(),
                project_path: payload.project_path.clone(),
                keep_workspace: payload.options.keep_workspace,
                job_id: None,
                last_error: None,
                total_commits: 0,
            },
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update applied atomically by the record store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationUpdate {
    pub status: Option<MigrationStatus>,
    pub last_synced_revision: Option<u64>,
    pub total_revisions: Option<u64>,
    pub revisions_estimated: Option<bool>,
    pub total_commits: Option<u64>,
    pub last_error: Option<String>,
    pub clear_last_error: bool,
    pub job_id: Option<JobId>,
}

impl MigrationUpdate {
    pub fn status(status: MigrationStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn failed(error: &str) -> Self {
        Self {
            status: Some(MigrationStatus::Failed),
            last_error: Some(error.to_owned()),
            ..Self::default()
        }
    }

    /// `last_synced_revision` is monotonically non-decreasing: an update
    /// carrying a lower revision than already recorded keeps the recorded one.
    pub fn apply_to(&self, migration: &mut Migration, now: OffsetDateTime) {
        if let Some(status) = self.status {
            migration.status = status;
        }
        if let Some(revision) = self.last_synced_revision {
            let current = migration.last_synced_revision.unwrap_or(0);
            migration.last_synced_revision = Some(current.max(revision));
        }
        if let Some(total) = self.total_revisions {
            migration.total_revisions = migration.total_revisions.max(total);
        }
        if let Some(estimated) = self.revisions_estimated {
            migration.revisions_estimated = estimated;
        }
        if let Some(commits) = self.total_commits {
            migration.metadata.total_commits = commits;
        }
        if self.clear_last_error {
            migration.metadata.last_error = None;
        }
        if let Some(error) = &self.last_error {
            migration.metadata.last_error = Some(error.clone());
        }
        if let Some(job_id) = self.job_id {
            migration.metadata.job_id = Some(job_id);
        }
        migration.updated_at = now;
    }
}

/// Per-status record counts used to cross-check queue lane counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub registered: usize,
    pub running: usize,
    pub syncing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn record(&mut self, status: MigrationStatus) {
        match status {
            MigrationStatus::Registered => self.registered += 1,
            MigrationStatus::Running => self.running += 1,
            MigrationStatus::Syncing => self.syncing += 1,
            MigrationStatus::Completed => self.completed += 1,
            MigrationStatus::Failed => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Append-only log line belonging to one migration; pruned on migration delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationLogEntry {
    pub migration_id: MigrationId,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: OffsetDateTime,
}
