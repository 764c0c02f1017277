//! Per-migration on-disk workspace: path layout, authors file, and the lock
//! reconciler that makes crashed runs safe to repeat.

pub mod paths;
pub mod reconcile;

pub use paths::{create_workspace, delete_workspace, write_authors_file, WorkspacePaths};
pub use reconcile::{reconcile, ReconcileReport};
