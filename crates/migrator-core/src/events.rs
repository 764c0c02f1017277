use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::ids::MigrationId;

pub const DEFAULT_EVENT_BUFFER_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationEventKind {
    Registered,
    Started,
    Progress,
    Log,
    Completed,
    Failed,
    Syncing,
    Synced,
    Resumed,
}

impl MigrationEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Started => "started",
            Self::Progress => "progress",
            Self::Log => "log",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Resumed => "resumed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationEvent {
    pub kind: MigrationEventKind,
    pub migration_id: MigrationId,
    pub payload: Value,
}

impl MigrationEvent {
    pub fn new(kind: MigrationEventKind, migration_id: MigrationId, payload: Value) -> Self {
        Self {
            kind,
            migration_id,
            payload,
        }
    }
}

/// Live notification seam. Implementations are fire-and-forget: `emit` must
/// never block and must never propagate an error back into the engine.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: MigrationEvent);
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: MigrationEvent) {}
}

/// Fan-out sink backed by a bounded broadcast channel. Events published while
/// nobody subscribes are dropped rather than buffered.
#[derive(Debug)]
pub struct BroadcastEventSink {
    sender: broadcast::Sender<MigrationEvent>,
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_CAPACITY)
    }
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MigrationEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, event: MigrationEvent) {
        if self.sender.receiver_count() > 0 {
            let _ = self.sender.send(event);
        }
    }
}
