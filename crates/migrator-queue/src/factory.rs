use std::path::PathBuf;
use std::sync::Arc;

use crate::ledger::{JobLedger, MemoryJobLedger};
use crate::sqlite::SqliteJobLedger;

/// Where job bookkeeping lives. Chosen explicitly at composition time rather
/// than inferred from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueBackend {
    /// Durable ledger; jobs survive process restarts.
    Sqlite { path: PathBuf },
    /// Process-local ledger for tests and one-shot runs.
    Memory,
}

/// Builds the configured ledger. Opening the sqlite backend bootstraps its
/// schema, which doubles as a write probe; if that fails the queue degrades
/// to the in-memory ledger instead of refusing to start.
pub fn create_ledger(backend: &QueueBackend) -> Arc<dyn JobLedger> {
    match backend {
        QueueBackend::Sqlite { path } => match SqliteJobLedger::open(path) {
            Ok(ledger) => {
                tracing::info!(path = %path.display(), "job ledger opened");
                Arc::new(ledger)
            }
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    %error,
                    "job ledger unavailable; falling back to in-memory queue (jobs will not survive restarts)"
                );
                Arc::new(MemoryJobLedger::new())
            }
        },
        QueueBackend::Memory => Arc::new(MemoryJobLedger::new()),
    }
}
