use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use migrator_core::{EventSink, LogStore, MigrationRecordStore};
use migrator_gitlab::ProjectLookup;
use migrator_process::ProcessRunner;

pub const DEFAULT_LOG_WINDOW_SIZE: u32 = 100;
pub const DEFAULT_ESTIMATE_PERSIST_STRIDE: u64 = 50;
pub const DEFAULT_INTROSPECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Tunables shared by every engine run.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Parent directory for per-migration workspaces.
    pub temp_root: PathBuf,
    pub git_binary: PathBuf,
    pub svn_binary: PathBuf,
    /// `--log-window-size` passed to the bridge; trades memory for round trips.
    pub log_window_size: u32,
    /// Progress is persisted at most once per this many observed revisions.
    pub estimate_persist_stride: u64,
    /// Timeout for short source-introspection commands (`svn info`).
    pub introspection_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            temp_root: std::env::temp_dir().join("svn-migrator"),
            git_binary: PathBuf::from("git"),
            svn_binary: PathBuf::from("svn"),
            log_window_size: DEFAULT_LOG_WINDOW_SIZE,
            estimate_persist_stride: DEFAULT_ESTIMATE_PERSIST_STRIDE,
            introspection_timeout: DEFAULT_INTROSPECTION_TIMEOUT,
        }
    }
}

/// Collaborator bundle handed to the engines at construction. All live
/// notification, persistence, and subprocess concerns flow through these
/// seams, so tests swap any of them independently.
#[derive(Clone)]
pub struct EngineContext {
    pub store: Arc<dyn MigrationRecordStore>,
    pub logs: Arc<dyn LogStore>,
    pub events: Arc<dyn EventSink>,
    pub runner: Arc<dyn ProcessRunner>,
    pub projects: Arc<dyn ProjectLookup>,
    pub settings: Arc<EngineSettings>,
}
