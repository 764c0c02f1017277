use std::sync::Arc;

use migrator_core::{
    EventSink, LogLevel, LogStore, MigrationEvent, MigrationEventKind, MigrationId,
    MigrationLogEntry, MigrationRecordStore, MigrationUpdate,
};
use migrator_process::{
    CancellationHandle, CommandRequest, OutputLine, ParsedLine, RevisionProgressParser,
};
use serde_json::json;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::context::EngineContext;

/// Rounded completion percentage, clamped to 100 because estimated totals can
/// lag behind the revisions actually observed. `None` when no total is known.
pub fn completion_percentage(current: u64, total: u64) -> Option<u8> {
    if total == 0 {
        return None;
    }
    let percentage = (current.saturating_mul(100) + total / 2) / total;
    Some(percentage.min(100) as u8)
}

/// What one streamed bridge run observed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct ProgressSummary {
    pub max_revision: Option<u64>,
    /// Commits newer than the baseline; replayed revisions do not count.
    pub new_commits: u64,
}

enum SidecarMessage {
    Persist { revision: u64 },
    Log { level: LogLevel, message: String },
}

/// Consumes progress and log traffic off the hot streaming path. The line
/// callback is synchronous, so durable writes go through this channel instead
/// of blocking the subprocess reader.
fn spawn_sidecar(
    store: Arc<dyn MigrationRecordStore>,
    logs: Arc<dyn LogStore>,
    migration_id: MigrationId,
    mut rx: mpsc::UnboundedReceiver<SidecarMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match message {
                SidecarMessage::Persist { revision } => {
                    let update = MigrationUpdate {
                        last_synced_revision: Some(revision),
                        total_revisions: Some(revision),
                        ..Default::default()
                    };
                    if let Err(error) = store.update(&migration_id, update).await {
                        tracing::warn!(%migration_id, %error, "progress persistence failed");
                    }
                }
                SidecarMessage::Log { level, message } => {
                    let entry = MigrationLogEntry {
                        migration_id: migration_id.clone(),
                        level,
                        message,
                        timestamp: OffsetDateTime::now_utc(),
                    };
                    if let Err(error) = logs.append(entry).await {
                        tracing::warn!(%migration_id, %error, "log persistence failed");
                    }
                }
            }
        }
    })
}

struct ProgressTracker {
    parser: RevisionProgressParser,
    events: Arc<dyn EventSink>,
    migration_id: MigrationId,
    baseline: Option<u64>,
    total_hint: u64,
    persist_stride: u64,
    since_persist: u64,
    last_persisted: Option<u64>,
    summary: ProgressSummary,
    tx: mpsc::UnboundedSender<SidecarMessage>,
}

impl ProgressTracker {
    fn on_line(&mut self, line: OutputLine) {
        let fallback_level = match line {
            OutputLine::Stdout(_) => LogLevel::Info,
            OutputLine::Stderr(_) => LogLevel::Warn,
        };
        let mut chunk = line.text().to_owned();
        chunk.push('\n');
        for parsed in self.parser.feed(&chunk) {
            self.handle(parsed, fallback_level);
        }
    }

    fn handle(&mut self, parsed: ParsedLine, fallback_level: LogLevel) {
        match parsed {
            ParsedLine::Progress(event) => {
                let best = self
                    .summary
                    .max_revision
                    .map_or(event.revision, |seen| seen.max(event.revision));
                self.summary.max_revision = Some(best);
                let is_new = event.is_new_commit
                    && self.baseline.map_or(true, |baseline| event.revision > baseline);
                if is_new {
                    self.summary.new_commits += 1;
                }

                let total = self.total_hint.max(best);
                self.events.emit(MigrationEvent::new(
                    MigrationEventKind::Progress,
                    self.migration_id.clone(),
                    json!({
                        "revision": event.revision,
                        "percentage": completion_percentage(event.revision, self.total_hint),
                        "total_revisions": total,
                        "new_commit": is_new,
                    }),
                ));

                self.since_persist += 1;
                if self.since_persist >= self.persist_stride {
                    self.persist(best);
                }
            }
            ParsedLine::Status(message) => {
                self.events.emit(MigrationEvent::new(
                    MigrationEventKind::Log,
                    self.migration_id.clone(),
                    json!({"message": message}),
                ));
                let _ = self.tx.send(SidecarMessage::Log {
                    level: LogLevel::Info,
                    message,
                });
            }
            ParsedLine::Log(message) => {
                let _ = self.tx.send(SidecarMessage::Log {
                    level: fallback_level,
                    message,
                });
            }
        }
    }

    fn persist(&mut self, revision: u64) {
        self.since_persist = 0;
        self.last_persisted = Some(revision);
        let _ = self.tx.send(SidecarMessage::Persist { revision });
    }

    /// Flushes the trailing partial line and any progress observed since the
    /// last stride boundary, then closes the sidecar channel.
    fn finish(mut self) -> ProgressSummary {
        if let Some(parsed) = self.parser.finish() {
            self.handle(parsed, LogLevel::Info);
        }
        if let Some(best) = self.summary.max_revision {
            if self.last_persisted != Some(best) {
                self.persist(best);
            }
        }
        self.summary
    }
}

/// Runs one bridge subprocess, translating its output stream into progress
/// events, throttled durable updates, and migration log entries.
pub(crate) async fn run_streamed(
    ctx: &EngineContext,
    migration_id: &MigrationId,
    request: CommandRequest,
    baseline: Option<u64>,
    total_hint: u64,
    cancellation: CancellationHandle,
) -> crate::MigrationResult<ProgressSummary> {
    let (tx, rx) = mpsc::unbounded_channel();
    let sidecar = spawn_sidecar(
        Arc::clone(&ctx.store),
        Arc::clone(&ctx.logs),
        migration_id.clone(),
        rx,
    );
    let mut tracker = ProgressTracker {
        parser: RevisionProgressParser::new(),
        events: Arc::clone(&ctx.events),
        migration_id: migration_id.clone(),
        baseline,
        total_hint,
        persist_stride: ctx.settings.estimate_persist_stride.max(1),
        since_persist: 0,
        last_persisted: None,
        summary: ProgressSummary::default(),
        tx,
    };

    let mut on_line = |line: OutputLine| tracker.on_line(line);
    let result = ctx.runner.run(request, cancellation, &mut on_line).await;
    let summary = tracker.finish();
    let _ = sidecar.await;
    result?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::completion_percentage;

    #[test]
    fn percentage_rounds_against_the_known_total() {
        assert_eq!(completion_percentage(50, 200), Some(25));
        assert_eq!(completion_percentage(1, 3), Some(33));
        assert_eq!(completion_percentage(2, 3), Some(67));
        assert_eq!(completion_percentage(200, 200), Some(100));
    }

    #[test]
    fn percentage_is_unknown_without_a_total() {
        assert_eq!(completion_percentage(50, 0), None);
    }

    #[test]
    fn percentage_clamps_when_observation_outruns_the_estimate() {
        assert_eq!(completion_percentage(250, 200), Some(100));
    }
}
