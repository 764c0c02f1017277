use std::collections::VecDeque;
use std::path::Path;

use migrator_core::{Migration, MigrationError, MigrationResult};
use migrator_process::{CancellationHandle, CommandRequest, OutputLine};
use migrator_workspace::WorkspacePaths;

use crate::context::EngineContext;

/// Substrings in push stderr that mean the remote refused the refs rather
/// than the transport failing.
const PUSH_REJECTION_MARKERS: &[&str] = &["rejected", "non-fast-forward"];

pub(crate) fn clone_args(
    migration: &Migration,
    authors_file: Option<&Path>,
    log_window_size: u32,
    destination: &Path,
) -> Vec<String> {
    let mut args = vec![
        "svn".to_owned(),
        "clone".to_owned(),
        migration.svn_url.clone(),
    ];
    if migration.layout.is_standard() {
        args.push("--stdlayout".to_owned());
    } else {
        args.push(format!("--trunk={}", migration.layout.trunk));
        args.push(format!("--branches={}", migration.layout.branches));
        args.push(format!("--tags={}", migration.layout.tags));
    }
    if let Some(authors_file) = authors_file {
        args.push(format!("--authors-file={}", authors_file.display()));
    }
    if let Some(username) = &migration.svn_username {
        args.push("--username".to_owned());
        args.push(username.clone());
    }
    args.push(format!("--log-window-size={log_window_size}"));
    args.push(destination.display().to_string());
    args
}

pub(crate) fn fetch_args(log_window_size: u32) -> Vec<String> {
    vec![
        "svn".to_owned(),
        "fetch".to_owned(),
        format!("--log-window-size={log_window_size}"),
    ]
}

pub(crate) fn head_revision_args(migration: &Migration) -> Vec<String> {
    let mut args = vec![
        "info".to_owned(),
        "--show-item".to_owned(),
        "revision".to_owned(),
        "--non-interactive".to_owned(),
    ];
    if let Some(username) = &migration.svn_username {
        args.push("--username".to_owned());
        args.push(username.clone());
    }
    if let Some(password) = &migration.svn_password {
        args.push("--password".to_owned());
        args.push(password.clone());
    }
    args.push(migration.svn_url.clone());
    args
}

fn rebase_args() -> Vec<String> {
    // --local: the fetch already ran, so rebase against what it brought in.
    vec!["svn".to_owned(), "rebase".to_owned(), "--local".to_owned()]
}

fn push_args(push_url: &str, ref_selector: &str) -> Vec<String> {
    vec![
        "push".to_owned(),
        push_url.to_owned(),
        ref_selector.to_owned(),
    ]
}

/// Asks the source for its head revision so progress can be reported against
/// an exact total. Failures are non-fatal: the engine falls back to treating
/// the highest observed revision as a running estimate.
pub(crate) async fn estimate_head_revision(
    ctx: &EngineContext,
    migration: &Migration,
    cancellation: &CancellationHandle,
) -> Option<u64> {
    let mut request = CommandRequest::new(
        ctx.settings.svn_binary.clone(),
        head_revision_args(migration),
    );
    request.timeout = Some(ctx.settings.introspection_timeout);

    let mut stdout_lines: VecDeque<String> = VecDeque::new();
    let mut on_line = |line: OutputLine| {
        if let OutputLine::Stdout(text) = line {
            stdout_lines.push_back(text);
        }
    };
    match ctx
        .runner
        .run(request, cancellation.clone(), &mut on_line)
        .await
    {
        Ok(_) => stdout_lines
            .iter()
            .find_map(|line| line.trim().parse::<u64>().ok()),
        Err(error) => {
            tracing::warn!(
                migration_id = %migration.id,
                %error,
                "head revision introspection failed; falling back to estimated totals"
            );
            None
        }
    }
}

/// Replays the local branch onto the freshly fetched bridge refs so the
/// subsequent push carries the new revisions.
pub(crate) async fn rebase_local(
    ctx: &EngineContext,
    paths: &WorkspacePaths,
    cancellation: &CancellationHandle,
) -> MigrationResult<()> {
    let mut request = CommandRequest::new(ctx.settings.git_binary.clone(), rebase_args());
    request.cwd = Some(paths.repo_dir().to_path_buf());

    let mut on_line = |_line: OutputLine| {};
    ctx.runner
        .run(request, cancellation.clone(), &mut on_line)
        .await?;
    Ok(())
}

/// Pushes all branches and then all tags to the authenticated remote URL.
/// Ref rejections surface as conflicts; retrying without operator action
/// cannot make a non-fast-forward push succeed.
pub(crate) async fn push_refs(
    ctx: &EngineContext,
    paths: &WorkspacePaths,
    push_url: &str,
    cancellation: &CancellationHandle,
) -> MigrationResult<()> {
    for ref_selector in ["--all", "--tags"] {
        let mut request = CommandRequest::new(
            ctx.settings.git_binary.clone(),
            push_args(push_url, ref_selector),
        );
        request.cwd = Some(paths.repo_dir().to_path_buf());

        let mut on_line = |_line: OutputLine| {};
        let result = ctx
            .runner
            .run(request, cancellation.clone(), &mut on_line)
            .await;
        match result {
            Ok(_) => {}
            Err(MigrationError::ProcessExit { code, stderr_tail })
                if PUSH_REJECTION_MARKERS
                    .iter()
                    .any(|marker| stderr_tail.contains(marker)) =>
            {
                return Err(MigrationError::Conflict(format!(
                    "target rejected push (exit {code}): {stderr_tail}"
                )));
            }
            Err(error) => return Err(error),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::Path;

    use migrator_core::{
        JobPayload, JobType, Migration, MigrationOptions, RepositoryLayout,
    };
    use time::OffsetDateTime;

    use super::{clone_args, head_revision_args};

    fn migration(layout: RepositoryLayout) -> Migration {
        let payload = JobPayload {
            migration_id: "mig-1".into(),
            svn_url: "https://svn.example/repo".to_owned(),
            svn_username: Some("ci".to_owned()),
            svn_password: Some("hunter2".to_owned()),
            gitlab_project_id: 7,
            gitlab_url: "https://gitlab.example".to_owned(),
            gitlab_token: "glpat-x".to_owned(),
            project_name: "repo".to_owned(),
            project_path: "repo".to_owned(),
            layout,
            authors_mapping: BTreeMap::new(),
            options: MigrationOptions::default(),
            job_type: JobType::Full,
            resume_from: None,
        };
        Migration::from_payload(&payload, OffsetDateTime::UNIX_EPOCH)
    }

    #[test]
    fn standard_layout_uses_the_stdlayout_shortcut() {
        let args = clone_args(
            &migration(RepositoryLayout::default()),
            None,
            100,
            Path::new("/tmp/ws/repo"),
        );
        assert!(args.contains(&"--stdlayout".to_owned()));
        assert!(!args.iter().any(|arg| arg.starts_with("--trunk=")));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/ws/repo"));
    }

    #[test]
    fn custom_layout_spells_out_all_three_paths() {
        let layout = RepositoryLayout {
            trunk: "main".to_owned(),
            branches: "branches".to_owned(),
            tags: "releases".to_owned(),
        };
        let args = clone_args(&migration(layout), None, 100, Path::new("/tmp/ws/repo"));
        assert!(!args.contains(&"--stdlayout".to_owned()));
        assert!(args.contains(&"--trunk=main".to_owned()));
        assert!(args.contains(&"--tags=releases".to_owned()));
    }

    #[test]
    fn clone_passes_username_but_never_the_password() {
        let args = clone_args(
            &migration(RepositoryLayout::default()),
            Some(Path::new("/tmp/ws/authors.txt")),
            100,
            Path::new("/tmp/ws/repo"),
        );
        assert!(args.contains(&"--username".to_owned()));
        assert!(args.contains(&"ci".to_owned()));
        assert!(!args.contains(&"hunter2".to_owned()));
        assert!(args.contains(&"--authors-file=/tmp/ws/authors.txt".to_owned()));
    }

    #[test]
    fn introspection_carries_full_credentials() {
        let args = head_revision_args(&migration(RepositoryLayout::default()));
        assert!(args.contains(&"--password".to_owned()));
        assert!(args.contains(&"hunter2".to_owned()));
        assert_eq!(
            args.last().map(String::as_str),
            Some("https://svn.example/repo")
        );
    }
}
