use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::MigrationId;
use crate::model::RepositoryLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Full,
    Resume,
    Sync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumePoint {
    Beginning,
    LastSynced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MigrationOptions {
    #[serde(default)]
    pub keep_workspace: bool,
}

/// The conceptual job payload carried through the queue. The migration record
/// derived from it, not the job itself, is the durable source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    pub migration_id: MigrationId,
    pub svn_url: String,
    #[serde(default)]
    pub svn_username: Option<String>,
    #[serde(default)]
    pub svn_password: Option<String>,
    pub gitlab_project_id: u64,
    pub gitlab_url: String,
    pub gitlab_token: String,
    pub project_name: String,
    pub project_path: String,
    #[serde(default)]
    pub layout: RepositoryLayout,
    #[serde(default)]
    pub authors_mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub options: MigrationOptions,
    pub job_type: JobType,
    #[serde(default)]
    pub resume_from: Option<ResumePoint>,
}
