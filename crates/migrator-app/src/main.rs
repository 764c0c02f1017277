use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use migrator_config::MigratorConfig;
use migrator_core::{
    BroadcastEventSink, InMemoryMigrationStore, JobPayload, JobType, MigrationError,
    MigrationEvent, MigrationEventKind, MigrationId, MigrationRecordStore, MigrationResult,
    MigrationStatus,
};
use migrator_engine::{EngineContext, EngineSettings, MigrationOrchestrator};
use migrator_gitlab::GitLabClient;
use migrator_process::TokioProcessRunner;
use migrator_queue::{create_ledger, JobExecutor, QueueBackend, QueueSettings, WorkerJobQueue};
use time::OffsetDateTime;

const TERMINAL_POLL_INTERVAL: Duration = Duration::from_millis(250);
const CLEANUP_RETAIN_TERMINAL: Duration = Duration::from_secs(24 * 60 * 60);

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = parse_cli_args(std::env::args().skip(1).collect())?;
    let config = match &cli.config {
        Some(path) => migrator_config::load_from_path(path)?,
        None => migrator_config::load_from_env()?,
    };
    tracing::info!(
        git = %config.git_binary,
        svn = %config.svn_binary,
        queue_db = %config.queue.database_path.display(),
        "configuration loaded"
    );

    match cli.command {
        CliCommand::Run { payload } => run_payload(&config, &payload).await,
        CliCommand::Cancel { migration_id } => cancel_jobs(&config, &migration_id),
        CliCommand::Status => print_status(&config),
        CliCommand::Cleanup => run_cleanup(&config),
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Enqueues the payload job, streams live events to stdout, and exits once
/// the migration record reaches a terminal status.
async fn run_payload(config: &MigratorConfig, payload_path: &PathBuf) -> Result<()> {
    let mut payload = read_payload(payload_path)?;
    payload.options.keep_workspace |= config.keep_workspace;
    let migration_id = payload.migration_id.clone();

    let store = Arc::new(InMemoryMigrationStore::new());
    let events = Arc::new(BroadcastEventSink::default());
    let mut receiver = events.subscribe();

    let ctx = EngineContext {
        store: store.clone(),
        logs: store.clone(),
        events: events.clone(),
        runner: Arc::new(TokioProcessRunner::new(Duration::from_secs(
            config.process.termination_grace_secs,
        ))),
        projects: Arc::new(GitLabClient::with_timeout(
            &payload.gitlab_url,
            &payload.gitlab_token,
            Duration::from_secs(config.gitlab.request_timeout_secs),
        )?),
        settings: Arc::new(EngineSettings {
            temp_root: config.temp_root.clone(),
            git_binary: PathBuf::from(&config.git_binary),
            svn_binary: PathBuf::from(&config.svn_binary),
            ..EngineSettings::default()
        }),
    };

    let max_concurrency = config.queue.migration_concurrency + config.queue.sync_concurrency;
    let orchestrator = Arc::new(MigrationOrchestrator::new(ctx, max_concurrency));
    let executor = Arc::new(OrchestratorExecutor {
        orchestrator: Arc::clone(&orchestrator),
    });

    let ledger = create_ledger(&QueueBackend::Sqlite {
        path: config.queue.database_path.clone(),
    });
    let queue = WorkerJobQueue::start(
        Arc::clone(&ledger),
        executor,
        store.clone(),
        queue_settings(config),
    )?;

    queue.enqueue(payload).await?;

    // A terminal record can still have a retry waiting in the ledger, so the
    // loop waits until the queue holds no live job for the id. A dead job with
    // no terminal record means the run failed before it ever persisted one
    // (for example a sync of an id this invocation never registered).
    let mut poll = tokio::time::interval(TERMINAL_POLL_INTERVAL);
    let final_status = loop {
        tokio::select! {
            received = receiver.recv() => {
                if let Ok(event) = received {
                    print_event(&event);
                }
            }
            _ = poll.tick() => {
                if ledger.has_live_job(&migration_id)? {
                    continue;
                }
                match store.find_by_id(&migration_id).await? {
                    Some(record) if record.status.is_terminal() => break record.status,
                    _ => break MigrationStatus::Failed,
                }
            }
        }
    };

    queue.shutdown().await;

    if final_status == MigrationStatus::Failed {
        let record = store.find_by_id(&migration_id).await?;
        let detail = record
            .and_then(|record| record.metadata.last_error)
            .unwrap_or_else(|| "no error detail recorded".to_owned());
        anyhow::bail!("migration {migration_id} failed: {detail}");
    }

    println!("migration {migration_id} finished: {}", final_status.as_str());
    Ok(())
}

fn cancel_jobs(config: &MigratorConfig, migration_id: &str) -> Result<()> {
    let ledger = create_ledger(&QueueBackend::Sqlite {
        path: config.queue.database_path.clone(),
    });
    let cancelled = ledger.cancel_waiting(&migration_id.into(), unix_now())?;
    println!("cancelled {cancelled} waiting job(s) for migration {migration_id}");
    Ok(())
}

fn print_status(config: &MigratorConfig) -> Result<()> {
    let ledger = create_ledger(&QueueBackend::Sqlite {
        path: config.queue.database_path.clone(),
    });
    for lane in [migrator_queue::JobLane::Migration, migrator_queue::JobLane::Sync] {
        let counts = ledger.lane_counts(lane)?;
        println!(
            "{} lane: {} waiting, {} active, {} completed, {} failed, {} cancelled",
            lane.as_str(),
            counts.waiting,
            counts.active,
            counts.completed,
            counts.failed,
            counts.cancelled
        );
    }
    Ok(())
}

fn run_cleanup(config: &MigratorConfig) -> Result<()> {
    let ledger = create_ledger(&QueueBackend::Sqlite {
        path: config.queue.database_path.clone(),
    });
    let orphaned = ledger.fail_orphaned_active(unix_now())?;
    let cutoff = unix_now().saturating_sub(CLEANUP_RETAIN_TERMINAL.as_secs());
    let pruned = ledger.prune_terminal_before(cutoff)?;
    println!("cleanup: failed {orphaned} orphaned active job(s), pruned {pruned} terminal job(s)");
    Ok(())
}

fn queue_settings(config: &MigratorConfig) -> QueueSettings {
    QueueSettings {
        migration_workers: config.queue.migration_concurrency,
        sync_workers: config.queue.sync_concurrency,
        max_attempts: config.queue.max_attempts,
        migration_retry_backoff: Duration::from_secs(config.queue.migration_backoff_secs),
        sync_retry_backoff: Duration::from_secs(config.queue.sync_backoff_secs),
        ..QueueSettings::default()
    }
}

fn read_payload(path: &PathBuf) -> Result<JobPayload> {
    let raw = std::fs::read_to_string(path).map_err(|error| {
        anyhow::anyhow!("failed to read payload file {}: {error}", path.display())
    })?;
    let payload: JobPayload = serde_json::from_str(&raw).map_err(|error| {
        anyhow::anyhow!("payload file {} is not a valid job: {error}", path.display())
    })?;
    Ok(payload)
}

fn print_event(event: &MigrationEvent) {
    match event.kind {
        MigrationEventKind::Progress => {
            let revision = event.payload["revision"].as_u64().unwrap_or(0);
            match event.payload["percentage"].as_u64() {
                Some(percentage) => println!(
                    "[{}] {} r{revision} ({percentage}%)",
                    event.kind.as_str(),
                    event.migration_id
                ),
                None => println!(
                    "[{}] {} r{revision}",
                    event.kind.as_str(),
                    event.migration_id
                ),
            }
        }
        MigrationEventKind::Log => {
            let message = event.payload["message"].as_str().unwrap_or("");
            println!("[{}] {} {message}", event.kind.as_str(), event.migration_id);
        }
        _ => println!(
            "[{}] {} {}",
            event.kind.as_str(),
            event.migration_id,
            event.payload
        ),
    }
}

fn unix_now() -> u64 {
    OffsetDateTime::now_utc().unix_timestamp().max(0) as u64
}

/// Bridges claimed queue jobs onto the orchestrator, which enforces the
/// per-migration exclusivity the queue cannot see.
struct OrchestratorExecutor {
    orchestrator: Arc<MigrationOrchestrator>,
}

#[async_trait]
impl JobExecutor for OrchestratorExecutor {
    async fn execute(&self, payload: &JobPayload) -> MigrationResult<()> {
        match payload.job_type {
            JobType::Full => self.orchestrator.run_migration(payload).await.map(drop),
            JobType::Resume => self
                .orchestrator
                .resume(&payload.migration_id, payload.resume_from)
                .await
                .map(drop),
            JobType::Sync => self
                .orchestrator
                .run_sync(&payload.migration_id)
                .await
                .map(drop),
        }
    }

    fn cancel_active(&self, migration_id: &MigrationId) -> bool {
        self.orchestrator.cancel(migration_id)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum CliCommand {
    Run { payload: PathBuf },
    Cancel { migration_id: String },
    Status,
    Cleanup,
}

#[derive(Debug, PartialEq, Eq)]
struct CliArgs {
    config: Option<PathBuf>,
    command: CliCommand,
}

fn parse_cli_args(args: Vec<String>) -> Result<CliArgs, MigrationError> {
    let mut config = None;
    let mut command = None;
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let value = args.next().ok_or_else(|| {
                    MigrationError::Configuration(
                        "Missing value after --config. Use --config <path>.".to_owned(),
                    )
                })?;
                config = Some(PathBuf::from(value));
            }
            "--payload" => {
                let value = args.next().ok_or_else(|| {
                    MigrationError::Configuration(
                        "Missing value after --payload. Use --payload <json-path>.".to_owned(),
                    )
                })?;
                set_command(&mut command, CliCommand::Run {
                    payload: PathBuf::from(value),
                })?;
            }
            "--cancel" => {
                let value = args.next().ok_or_else(|| {
                    MigrationError::Configuration(
                        "Missing value after --cancel. Use --cancel <migration-id>.".to_owned(),
                    )
                })?;
                set_command(&mut command, CliCommand::Cancel {
                    migration_id: value,
                })?;
            }
            "--status" => set_command(&mut command, CliCommand::Status)?,
            "--cleanup" => set_command(&mut command, CliCommand::Cleanup)?,
            "--help" | "-h" => {
                print_cli_help();
                std::process::exit(0);
            }
            value if value.starts_with("--") => {
                return Err(MigrationError::Configuration(format!(
                    "Unknown flag '{value}'. Run with --help for valid flags."
                )));
            }
            unknown => {
                return Err(MigrationError::Configuration(format!(
                    "Unexpected argument '{unknown}'. Run with --help for valid flags."
                )));
            }
        }
    }

    let command = command.ok_or_else(|| {
        MigrationError::Configuration(
            "No command given. Use one of --payload, --cancel, --status, --cleanup.".to_owned(),
        )
    })?;

    Ok(CliArgs { config, command })
}

fn set_command(slot: &mut Option<CliCommand>, command: CliCommand) -> Result<(), MigrationError> {
    if slot.is_some() {
        return Err(MigrationError::Configuration(
            "Only one of --payload, --cancel, --status, --cleanup may be given.".to_owned(),
        ));
    }
    *slot = Some(command);
    Ok(())
}

fn print_cli_help() {
    println!("Usage: migrator [--config <path>] <command>");
    println!();
    println!("  --payload <json-path>   Enqueue the job described by the JSON payload file");
    println!("  --cancel <migration-id> Cancel waiting jobs for a migration");
    println!("  --status                Print queue lane counts");
    println!("  --cleanup               Fail orphaned jobs and prune old terminal jobs");
    println!("  --config <path>         Config file (default: MIGRATOR_CONFIG or ./migrator.toml)");
    println!("  --help                  Show this help message");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| (*value).to_owned()).collect()
    }

    #[test]
    fn payload_flag_parses_into_the_run_command() {
        let parsed = parse_cli_args(args(&["--payload", "job.json"])).expect("parse");
        assert_eq!(parsed.config, None);
        assert_eq!(
            parsed.command,
            CliCommand::Run {
                payload: PathBuf::from("job.json")
            }
        );
    }

    #[test]
    fn config_flag_combines_with_any_command() {
        let parsed =
            parse_cli_args(args(&["--config", "custom.toml", "--status"])).expect("parse");
        assert_eq!(parsed.config, Some(PathBuf::from("custom.toml")));
        assert_eq!(parsed.command, CliCommand::Status);
    }

    #[test]
    fn cancel_flag_captures_the_migration_id() {
        let parsed = parse_cli_args(args(&["--cancel", "mig-1"])).expect("parse");
        assert_eq!(
            parsed.command,
            CliCommand::Cancel {
                migration_id: "mig-1".to_owned()
            }
        );
    }

    #[test]
    fn two_commands_in_one_invocation_are_rejected() {
        let error = parse_cli_args(args(&["--status", "--cleanup"])).expect_err("conflict");
        assert!(error.to_string().contains("Only one of"));
    }

    #[test]
    fn missing_command_is_rejected() {
        let error = parse_cli_args(args(&["--config", "custom.toml"])).expect_err("no command");
        assert!(error.to_string().contains("No command given"));
    }

    #[test]
    fn flag_values_cannot_be_omitted() {
        let error = parse_cli_args(args(&["--payload"])).expect_err("missing value");
        assert!(error.to_string().contains("Missing value after --payload"));
    }

    #[test]
    fn unknown_flags_are_rejected() {
        let error = parse_cli_args(args(&["--frobnicate"])).expect_err("unknown flag");
        assert!(error.to_string().contains("Unknown flag"));
    }

    #[tokio::test]
    async fn sync_of_an_unknown_migration_exits_as_a_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let payload_path = temp.path().join("job.json");
        let payload = serde_json::json!({
            "migration_id": "mig-missing",
            "svn_url": "https://svn.example/repo",
            "gitlab_project_id": 7,
            "gitlab_url": "https://gitlab.example",
            "gitlab_token": "glpat-x",
            "project_name": "repo",
            "project_path": "repo",
            "job_type": "sync",
        });
        std::fs::write(&payload_path, payload.to_string()).expect("write payload");

        let mut config = MigratorConfig::default();
        config.temp_root = temp.path().join("work");
        config.queue.database_path = temp.path().join("jobs.db");

        // There is no record for the id anywhere, so the job dies on its only
        // attempt and the run must report that instead of waiting forever.
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            run_payload(&config, &payload_path),
        )
        .await
        .expect("run must finish once the job is dead");

        let error = result.expect_err("a sync of an unknown id must fail the run");
        assert!(error.to_string().contains("mig-missing"));
    }
}
