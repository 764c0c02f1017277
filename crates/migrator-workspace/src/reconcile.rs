use std::fs;
use std::path::{Path, PathBuf};

use migrator_core::{MigrationError, MigrationResult};

/// Lock artifacts a crashed bridge run leaves directly under `.git`.
const KNOWN_GIT_LOCKS: &[&str] = &["index.lock", "HEAD.lock", "config.lock"];
const BRIDGE_TOOL_MARKERS: &[&str] = &["git-svn", "git svn"];

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub removed_lock_files: Vec<PathBuf>,
    pub killed_processes: Vec<u32>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.removed_lock_files.is_empty() && self.killed_processes.is_empty()
    }
}

/// Clears stale lock artifacts and orphaned bridge subprocesses so a repeated
/// clone/fetch against this workspace cannot deadlock on a crashed prior run.
///
/// Idempotent: a clean workspace is a no-op, and a workspace that does not
/// exist yet is a no-op rather than an error.
pub fn reconcile(repo_dir: &Path) -> MigrationResult<ReconcileReport> {
    let mut report = ReconcileReport::default();
    if !repo_dir.exists() {
        return Ok(report);
    }

    let git_dir = repo_dir.join(".git");
    for lock in KNOWN_GIT_LOCKS {
        remove_lock_file(&git_dir.join(lock), &mut report)?;
    }

    let bridge_dir = git_dir.join("svn");
    remove_lock_file(&bridge_dir.join(".metadata.lock"), &mut report)?;
    if bridge_dir.is_dir() {
        scan_bridge_metadata(&bridge_dir, &mut report)?;
    }

    report.killed_processes = kill_orphaned_bridge_processes(repo_dir);
    if !report.is_clean() {
        tracing::info!(
            repo_dir = %repo_dir.display(),
            removed = report.removed_lock_files.len(),
            killed = report.killed_processes.len(),
            "reconciled stale workspace artifacts"
        );
    }
    Ok(report)
}

fn remove_lock_file(path: &Path, report: &mut ReconcileReport) -> MigrationResult<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            report.removed_lock_files.push(path.to_path_buf());
            Ok(())
        }
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(MigrationError::Io(format!(
            "failed to remove lock file '{}': {error}",
            path.display()
        ))),
    }
}

/// Depth-first walk of the bridge metadata directory removing every `*.lock`
/// artifact, mirroring how the bridge scatters per-ref lock files.
fn scan_bridge_metadata(bridge_dir: &Path, report: &mut ReconcileReport) -> MigrationResult<()> {
    let mut stack = vec![bridge_dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = match fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => continue,
            Err(error) => {
                return Err(MigrationError::Io(format!(
                    "failed to scan bridge metadata '{}': {error}",
                    current.display()
                )))
            }
        };
        for entry in entries {
            let entry = entry.map_err(|error| {
                MigrationError::Io(format!(
                    "failed to inspect entry under '{}': {error}",
                    current.display()
                ))
            })?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path
                .file_name()
                .map(|name| name.to_string_lossy().ends_with(".lock"))
                .unwrap_or(false)
            {
                remove_lock_file(&path, report)?;
            }
        }
    }
    Ok(())
}

/// Force-terminates any process whose command line references both this
/// workspace and the bridge tool. Only implemented where `/proc` exists.
#[cfg(target_os = "linux")]
fn kill_orphaned_bridge_processes(repo_dir: &Path) -> Vec<u32> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let own_pid = std::process::id();
    let workspace = repo_dir.to_string_lossy();
    let mut killed = Vec::new();

    let Ok(entries) = fs::read_dir("/proc") else {
        return killed;
    };
    for entry in entries.flatten() {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
            continue;
        };
        if pid == own_pid {
            continue;
        }
        let Ok(raw_cmdline) = fs::read(entry.path().join("cmdline")) else {
            continue;
        };
        let cmdline = String::from_utf8_lossy(&raw_cmdline).replace('\0', " ");
        let references_bridge = BRIDGE_TOOL_MARKERS
            .iter()
            .any(|marker| cmdline.contains(marker));
        if references_bridge && cmdline.contains(workspace.as_ref()) {
            if kill(Pid::from_raw(pid as i32), Signal::SIGKILL).is_ok() {
                killed.push(pid);
            }
        }
    }
    killed
}

#[cfg(not(target_os = "linux"))]
fn kill_orphaned_bridge_processes(_repo_dir: &Path) -> Vec<u32> {
    Vec::new()
}
