//! TOML configuration for the migrator binary.
//!
//! The file is located via the `MIGRATOR_CONFIG` environment variable, falling
//! back to `./migrator.toml`. A missing file is not an error: every key has a
//! default, so the binary runs unconfigured. Binary paths can additionally be
//! overridden per-invocation through `MIGRATOR_GIT_BIN` / `MIGRATOR_SVN_BIN`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const ENV_MIGRATOR_CONFIG: &str = "MIGRATOR_CONFIG";
pub const ENV_GIT_BINARY: &str = "MIGRATOR_GIT_BIN";
pub const ENV_SVN_BINARY: &str = "MIGRATOR_SVN_BIN";

const DEFAULT_CONFIG_FILE: &str = "migrator.toml";
const DEFAULT_GIT_BINARY: &str = "git";
const DEFAULT_SVN_BINARY: &str = "svn";
const DEFAULT_QUEUE_DATABASE_PATH: &str = "./migrator-queue.db";
const DEFAULT_MIGRATION_CONCURRENCY: usize = 2;
const DEFAULT_SYNC_CONCURRENCY: usize = 3;
const DEFAULT_MIGRATION_BACKOFF_SECS: u64 = 5;
const DEFAULT_SYNC_BACKOFF_SECS: u64 = 3;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_GITLAB_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_TERMINATION_GRACE_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Message(String),
}

impl ConfigError {
    fn configuration(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigratorConfig {
    #[serde(default = "default_temp_root")]
    pub temp_root: PathBuf,
    #[serde(default = "default_git_binary")]
    pub git_binary: String,
    #[serde(default = "default_svn_binary")]
    pub svn_binary: String,
    #[serde(default)]
    pub keep_workspace: bool,
    #[serde(default)]
    pub queue: QueueConfigToml,
    #[serde(default)]
    pub gitlab: GitLabConfigToml,
    #[serde(default)]
    pub process: ProcessConfigToml,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueConfigToml {
    #[serde(default = "default_queue_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_migration_concurrency")]
    pub migration_concurrency: usize,
    #[serde(default = "default_sync_concurrency")]
    pub sync_concurrency: usize,
    #[serde(default = "default_migration_backoff_secs")]
    pub migration_backoff_secs: u64,
    #[serde(default = "default_sync_backoff_secs")]
    pub sync_backoff_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for QueueConfigToml {
    fn default() -> Self {
        Self {
            database_path: default_queue_database_path(),
            migration_concurrency: default_migration_concurrency(),
            sync_concurrency: default_sync_concurrency(),
            migration_backoff_secs: default_migration_backoff_secs(),
            sync_backoff_secs: default_sync_backoff_secs(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GitLabConfigToml {
    #[serde(default = "default_gitlab_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for GitLabConfigToml {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_gitlab_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessConfigToml {
    #[serde(default = "default_termination_grace_secs")]
    pub termination_grace_secs: u64,
}

impl Default for ProcessConfigToml {
    fn default() -> Self {
        Self {
            termination_grace_secs: default_termination_grace_secs(),
        }
    }
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self {
            temp_root: default_temp_root(),
            git_binary: default_git_binary(),
            svn_binary: default_svn_binary(),
            keep_workspace: false,
            queue: QueueConfigToml::default(),
            gitlab: GitLabConfigToml::default(),
            process: ProcessConfigToml::default(),
        }
    }
}

/// Resolves the config path from `MIGRATOR_CONFIG`, loads it, then applies
/// binary overrides from the environment.
pub fn load_from_env() -> Result<MigratorConfig, ConfigError> {
    let path = config_path_from_env()?;
    let mut config = load_from_path(path)?;
    apply_env_overrides(&mut config)?;
    Ok(config)
}

/// Loads a config file, treating a missing file as an empty one.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<MigratorConfig, ConfigError> {
    let path = path.as_ref();
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => {
            return Err(ConfigError::configuration(format!(
                "Failed to read MIGRATOR_CONFIG from {}: {err}",
                path.display()
            )));
        }
    };

    let mut config: MigratorConfig = toml::from_str(&raw).map_err(|err| {
        ConfigError::configuration(format!(
            "Failed to parse MIGRATOR_CONFIG from {}: {err}",
            path.display()
        ))
    })?;

    normalize_config(&mut config);
    Ok(config)
}

fn config_path_from_env() -> Result<PathBuf, ConfigError> {
    match std::env::var(ENV_MIGRATOR_CONFIG) {
        Ok(raw) => {
            if raw.trim().is_empty() {
                Ok(PathBuf::from(DEFAULT_CONFIG_FILE))
            } else {
                Ok(raw.into())
            }
        }
        Err(std::env::VarError::NotPresent) => Ok(PathBuf::from(DEFAULT_CONFIG_FILE)),
        Err(_) => Err(ConfigError::configuration(
            "MIGRATOR_CONFIG contained invalid UTF-8",
        )),
    }
}

fn apply_env_overrides(config: &mut MigratorConfig) -> Result<(), ConfigError> {
    if let Some(binary) = env_override(ENV_GIT_BINARY)? {
        config.git_binary = binary;
    }
    if let Some(binary) = env_override(ENV_SVN_BINARY)? {
        config.svn_binary = binary;
    }
    Ok(())
}

fn env_override(name: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                Ok(None)
            } else {
                Ok(Some(trimmed.to_owned()))
            }
        }
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(_) => Err(ConfigError::configuration(format!(
            "{name} contained invalid UTF-8"
        ))),
    }
}

fn normalize_config(config: &mut MigratorConfig) {
    if config.temp_root.as_os_str().is_empty() {
        config.temp_root = default_temp_root();
    }
    normalize_non_empty_string(&mut config.git_binary, default_git_binary());
    normalize_non_empty_string(&mut config.svn_binary, default_svn_binary());

    if config.queue.database_path.as_os_str().is_empty() {
        config.queue.database_path = default_queue_database_path();
    }
    if config.queue.migration_concurrency == 0 {
        config.queue.migration_concurrency = default_migration_concurrency();
    }
    if config.queue.sync_concurrency == 0 {
        config.queue.sync_concurrency = default_sync_concurrency();
    }
    if config.queue.max_attempts == 0 {
        config.queue.max_attempts = default_max_attempts();
    }
    if config.gitlab.request_timeout_secs == 0 {
        config.gitlab.request_timeout_secs = default_gitlab_request_timeout_secs();
    }
    if config.process.termination_grace_secs == 0 {
        config.process.termination_grace_secs = default_termination_grace_secs();
    }
}

fn normalize_non_empty_string(value: &mut String, default: String) {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        *value = default;
    } else if trimmed != value {
        *value = trimmed.to_owned();
    }
}

fn default_temp_root() -> PathBuf {
    std::env::temp_dir().join("svn-migrator")
}

fn default_git_binary() -> String {
    DEFAULT_GIT_BINARY.to_owned()
}

fn default_svn_binary() -> String {
    DEFAULT_SVN_BINARY.to_owned()
}

fn default_queue_database_path() -> PathBuf {
    PathBuf::from(DEFAULT_QUEUE_DATABASE_PATH)
}

fn default_migration_concurrency() -> usize {
    DEFAULT_MIGRATION_CONCURRENCY
}

fn default_sync_concurrency() -> usize {
    DEFAULT_SYNC_CONCURRENCY
}

fn default_migration_backoff_secs() -> u64 {
    DEFAULT_MIGRATION_BACKOFF_SECS
}

fn default_sync_backoff_secs() -> u64 {
    DEFAULT_SYNC_BACKOFF_SECS
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_gitlab_request_timeout_secs() -> u64 {
    DEFAULT_GITLAB_REQUEST_TIMEOUT_SECS
}

fn default_termination_grace_secs() -> u64 {
    DEFAULT_TERMINATION_GRACE_SECS
}
