use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use migrator_core::{
    BroadcastEventSink, InMemoryMigrationStore, JobPayload, JobType, MigrationError,
    MigrationEvent, MigrationEventKind, MigrationOptions, MigrationResult, RepositoryLayout,
};
use migrator_gitlab::{GitLabProject, ProjectLookup};
use migrator_process::{
    CancellationHandle, CommandExit, CommandRequest, OutputLine, ProcessRunner,
};
use tokio::sync::broadcast;

use crate::context::{EngineContext, EngineSettings};

/// One expected subprocess invocation and its scripted outcome.
pub(crate) struct ScriptedCall {
    expect: &'static str,
    stdout: Vec<&'static str>,
    stderr: Vec<&'static str>,
    result: Result<i32, MigrationError>,
    block_until_cancelled: bool,
}

impl ScriptedCall {
    pub fn succeed(expect: &'static str) -> Self {
        Self {
            expect,
            stdout: Vec::new(),
            stderr: Vec::new(),
            result: Ok(0),
            block_until_cancelled: false,
        }
    }

    pub fn fail(expect: &'static str, error: MigrationError) -> Self {
        Self {
            expect,
            stdout: Vec::new(),
            stderr: Vec::new(),
            result: Err(error),
            block_until_cancelled: false,
        }
    }

    pub fn block_until_cancelled(expect: &'static str) -> Self {
        Self {
            expect,
            stdout: Vec::new(),
            stderr: Vec::new(),
            result: Ok(0),
            block_until_cancelled: true,
        }
    }

    pub fn with_stdout(mut self, lines: &[&'static str]) -> Self {
        self.stdout = lines.to_vec();
        self
    }

    pub fn with_stderr(mut self, lines: &[&'static str]) -> Self {
        self.stderr = lines.to_vec();
        self
    }
}

/// Plays back a fixed command script; any unexpected invocation panics the
/// test immediately.
pub(crate) struct MockRunner {
    script: Mutex<VecDeque<ScriptedCall>>,
    pub calls: Mutex<Vec<String>>,
}

impl MockRunner {
    pub fn new(script: Vec<ScriptedCall>) -> Self {
        Self {
            script: Mutex::new(VecDeque::from(script)),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().expect("script lock").len()
    }
}

#[async_trait]
impl ProcessRunner for MockRunner {
    async fn run(
        &self,
        request: CommandRequest,
        cancellation: CancellationHandle,
        on_line: &mut (dyn FnMut(OutputLine) + Send),
    ) -> MigrationResult<CommandExit> {
        if cancellation.is_cancelled() {
            return Err(MigrationError::Cancelled(format!(
                "`{}` was cancelled before it started",
                request.rendered()
            )));
        }
        let rendered = request.rendered();
        self.calls.lock().expect("calls lock").push(rendered.clone());
        let call = self
            .script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or_else(|| panic!("unexpected command: {rendered}"));
        assert!(
            rendered.contains(call.expect),
            "expected a command containing {:?}, got {rendered:?}",
            call.expect
        );
        if call.block_until_cancelled {
            cancellation.cancelled().await;
            return Err(MigrationError::Cancelled(format!(
                "`{rendered}` was terminated on request"
            )));
        }
        for line in call.stdout {
            on_line(OutputLine::Stdout(line.to_owned()));
        }
        for line in call.stderr {
            on_line(OutputLine::Stderr(line.to_owned()));
        }
        call.result.map(|exit_code| CommandExit {
            exit_code,
            duration: Duration::ZERO,
        })
    }
}

pub(crate) struct StaticProjects {
    result: MigrationResult<GitLabProject>,
}

impl StaticProjects {
    pub fn found() -> Self {
        Self {
            result: Ok(GitLabProject {
                id: 7,
                path_with_namespace: "group/repo".to_owned(),
                http_url_to_repo: "https://gitlab.example/group/repo.git".to_owned(),
            }),
        }
    }

    pub fn failing(error: MigrationError) -> Self {
        Self { result: Err(error) }
    }
}

#[async_trait]
impl ProjectLookup for StaticProjects {
    async fn find_project(&self, _project_id: u64) -> MigrationResult<GitLabProject> {
        self.result.clone()
    }
}

pub(crate) struct TestHarness {
    /// Held so the workspace root outlives the test body.
    pub _temp: tempfile::TempDir,
    pub store: Arc<InMemoryMigrationStore>,
    pub events: Arc<BroadcastEventSink>,
    pub runner: Arc<MockRunner>,
    pub ctx: EngineContext,
}

impl TestHarness {
    pub fn new(script: Vec<ScriptedCall>) -> Self {
        Self::with_projects(script, StaticProjects::found())
    }

    pub fn with_projects(script: Vec<ScriptedCall>, projects: StaticProjects) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(InMemoryMigrationStore::new());
        let events = Arc::new(BroadcastEventSink::default());
        let runner = Arc::new(MockRunner::new(script));
        let settings = EngineSettings {
            temp_root: temp.path().join("work"),
            ..EngineSettings::default()
        };
        let ctx = EngineContext {
            store: store.clone(),
            logs: store.clone(),
            events: events.clone(),
            runner: runner.clone(),
            projects: Arc::new(projects),
            settings: Arc::new(settings),
        };
        Self {
            _temp: temp,
            store,
            events,
            runner,
            ctx,
        }
    }
}

pub(crate) fn payload(id: &str) -> JobPayload {
    JobPayload {
        migration_id: id.into(),
        svn_url: "https://svn.example/repo".to_owned(),
        svn_username: None,
        svn_password: None,
        gitlab_project_id: 7,
        gitlab_url: "https://gitlab.example".to_owned(),
        gitlab_token: "glpat-x".to_owned(),
        project_name: "repo".to_owned(),
        project_path: "repo".to_owned(),
        layout: RepositoryLayout::default(),
        authors_mapping: BTreeMap::new(),
        options: MigrationOptions::default(),
        job_type: JobType::Full,
        resume_from: None,
    }
}

/// Collects every event already buffered on the receiver.
pub(crate) fn drain_events(
    receiver: &mut broadcast::Receiver<MigrationEvent>,
) -> Vec<MigrationEvent> {
    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        events.push(event);
    }
    events
}

pub(crate) fn kinds(events: &[MigrationEvent]) -> Vec<MigrationEventKind> {
    events.iter().map(|event| event.kind).collect()
}
