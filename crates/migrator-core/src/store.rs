use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::error::{MigrationError, MigrationResult};
use crate::ids::MigrationId;
use crate::model::{Migration, MigrationLogEntry, MigrationUpdate, StatusCounts};

/// Persistence seam for migration records. The concrete backing technology is
/// a deployment concern; the engine only ever talks to this trait.
#[async_trait]
pub trait MigrationRecordStore: Send + Sync {
    /// Insert-or-replace. Retried jobs re-upsert the same id.
    async fn create(&self, migration: Migration) -> MigrationResult<()>;
    async fn update(
        &self,
        id: &MigrationId,
        update: MigrationUpdate,
    ) -> MigrationResult<Migration>;
    async fn find_by_id(&self, id: &MigrationId) -> MigrationResult<Option<Migration>>;
    async fn find_all(&self) -> MigrationResult<Vec<Migration>>;
    /// Deletes the record and prunes its logs.
    async fn delete(&self, id: &MigrationId) -> MigrationResult<()>;
    async fn status_counts(&self) -> MigrationResult<StatusCounts>;
}

/// Durable log storage seam; entries are append-only.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn append(&self, entry: MigrationLogEntry) -> MigrationResult<()>;
}

/// In-memory store used by tests and by single-run CLI invocations. Implements
/// both seams so log pruning on delete stays in one place.
#[derive(Debug, Default)]
pub struct InMemoryMigrationStore {
    migrations: RwLock<HashMap<MigrationId, Migration>>,
    logs: RwLock<Vec<MigrationLogEntry>>,
}

impl InMemoryMigrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn logs_for(&self, id: &MigrationId) -> Vec<MigrationLogEntry> {
        self.logs
            .read()
            .expect("log store lock poisoned")
            .iter()
            .filter(|entry| &entry.migration_id == id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MigrationRecordStore for InMemoryMigrationStore {
    async fn create(&self, migration: Migration) -> MigrationResult<()> {
        let mut migrations = self
            .migrations
            .write()
            .expect("migration store lock poisoned");
        migrations.insert(migration.id.clone(), migration);
        Ok(())
    }

    async fn update(
        &self,
        id: &MigrationId,
        update: MigrationUpdate,
    ) -> MigrationResult<Migration> {
        let mut migrations = self
            .migrations
            .write()
            .expect("migration store lock poisoned");
        let migration = migrations
            .get_mut(id)
            .ok_or_else(|| MigrationError::NotFound(format!("migration {id}")))?;
        update.apply_to(migration, OffsetDateTime::now_utc());
        Ok(migration.clone())
    }

    async fn find_by_id(&self, id: &MigrationId) -> MigrationResult<Option<Migration>> {
        let migrations = self
            .migrations
            .read()
            .expect("migration store lock poisoned");
        Ok(migrations.get(id).cloned())
    }

    async fn find_all(&self) -> MigrationResult<Vec<Migration>> {
        let migrations = self
            .migrations
            .read()
            .expect("migration store lock poisoned");
        let mut all: Vec<Migration> = migrations.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn delete(&self, id: &MigrationId) -> MigrationResult<()> {
        let removed = {
            let mut migrations = self
                .migrations
                .write()
                .expect("migration store lock poisoned");
            migrations.remove(id)
        };
        if removed.is_none() {
            return Err(MigrationError::NotFound(format!("migration {id}")));
        }
        let mut logs = self.logs.write().expect("log store lock poisoned");
        logs.retain(|entry| &entry.migration_id != id);
        Ok(())
    }

    async fn status_counts(&self) -> MigrationResult<StatusCounts> {
        let migrations = self
            .migrations
            .read()
            .expect("migration store lock poisoned");
        let mut counts = StatusCounts::default();
        for migration in migrations.values() {
            counts.record(migration.status);
        }
        Ok(counts)
    }
}

#[async_trait]
impl LogStore for InMemoryMigrationStore {
    async fn append(&self, entry: MigrationLogEntry) -> MigrationResult<()> {
        let mut logs = self.logs.write().expect("log store lock poisoned");
        logs.push(entry);
        Ok(())
    }
}
