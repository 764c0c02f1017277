//! Shared data model, error taxonomy, and collaborator interfaces for the
//! SVN-to-GitLab migration engine.

pub mod error;
pub mod events;
pub mod ids;
pub mod job;
pub mod model;
pub mod store;

pub use error::{MigrationError, MigrationResult};
pub use events::{BroadcastEventSink, EventSink, MigrationEvent, MigrationEventKind, NullEventSink};
pub use ids::{JobId, MigrationId};
pub use job::{JobPayload, JobType, MigrationOptions, ResumePoint};
pub use model::{
    LogLevel, Migration, MigrationLogEntry, MigrationMetadata, MigrationStatus, MigrationUpdate,
    RepositoryLayout, StatusCounts,
};
pub use store::{InMemoryMigrationStore, LogStore, MigrationRecordStore};

#[cfg(test)]
mod tests {
    use crate::ids::MigrationId;
    use crate::job::{JobPayload, JobType};

    #[test]
    fn migration_id_round_trips_as_json_string() {
        let id = MigrationId::new("mig-1");
        let serialized = serde_json::to_string(&id).expect("serialize migration id");
        let deserialized: MigrationId =
            serde_json::from_str(&serialized).expect("deserialize migration id");

        assert_eq!(serialized, "\"mig-1\"");
        assert_eq!(deserialized, id);
    }

    #[test]
    fn job_payload_defaults_layout_and_options_when_omitted() {
        let payload: JobPayload = serde_json::from_str(
            r#"{
                "migration_id": "mig-1",
                "svn_url": "https://svn.example/repo",
                "gitlab_project_id": 42,
                "gitlab_url": "https://gitlab.example",
                "gitlab_token": "glpat-x",
                "project_name": "repo",
                "project_path": "repo",
                "job_type": "full"
            }"#,
        )
        .expect("deserialize payload");

        assert_eq!(payload.job_type, JobType::Full);
        assert_eq!(payload.layout.trunk, "trunk");
        assert_eq!(payload.layout.branches, "branches");
        assert_eq!(payload.layout.tags, "tags");
        assert!(!payload.options.keep_workspace);
        assert!(payload.authors_mapping.is_empty());
        assert!(payload.resume_from.is_none());
    }
}
