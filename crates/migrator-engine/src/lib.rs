//! Migration execution engines and the orchestrator that fronts them.
//!
//! [`MigrationEngine`] replays an entire source history into a fresh
//! workspace and pushes it to the target. [`SyncEngine`] fetches only the
//! revisions newer than the recorded baseline. [`MigrationOrchestrator`]
//! enforces per-id exclusivity, global concurrency, and cancellation on top
//! of both.

mod clone;
mod commands;
mod context;
mod orchestrator;
mod progress;
mod sync;

#[cfg(test)]
mod testutil;

pub use clone::MigrationEngine;
pub use context::{
    EngineContext, EngineSettings, DEFAULT_ESTIMATE_PERSIST_STRIDE, DEFAULT_INTROSPECTION_TIMEOUT,
    DEFAULT_LOG_WINDOW_SIZE,
};
pub use migrator_core::MigrationResult;
pub use orchestrator::{MigrationOrchestrator, DEFAULT_MAX_CONCURRENCY};
pub use progress::completion_percentage;
pub use sync::SyncEngine;
