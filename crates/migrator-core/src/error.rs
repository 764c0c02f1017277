use thiserror::Error;

/// Error taxonomy shared across the migration engine, queue, and collaborators.
///
/// Every failure path persists the owning migration record and emits a failure
/// event before one of these propagates; the propagated error primarily drives
/// queue retry accounting.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MigrationError {
    #[error("source or target unreachable: {0}")]
    Connection(String),
    #[error("subprocess exited with code {code}: {stderr_tail}")]
    ProcessExit { code: i32, stderr_tail: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("workspace is not resumable: {0}")]
    Resumability(String),
    #[error("cannot resume: {0}")]
    CannotResume(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("queue exhausted: {0}")]
    QueueExhausted(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl MigrationError {
    /// Whether the queue may re-invoke the whole execute/sync call.
    ///
    /// Missing records, non-resumable workspaces, configuration mistakes, and
    /// explicit cancellations never become retryable by waiting.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::NotFound(_)
                | Self::Resumability(_)
                | Self::CannotResume(_)
                | Self::Conflict(_)
                | Self::Cancelled(_)
                | Self::Configuration(_)
        )
    }
}

impl From<std::io::Error> for MigrationError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error.to_string())
    }
}

pub type MigrationResult<T> = Result<T, MigrationError>;
