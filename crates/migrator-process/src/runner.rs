use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use migrator_core::{MigrationError, MigrationResult};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Instant};

const READ_CHUNK_SIZE: usize = 8 * 1024;
const LINE_CHANNEL_CAPACITY: usize = 256;
const STDERR_TAIL_LINES: usize = 20;
const STDERR_TAIL_MAX_BYTES: usize = 4 * 1024;
const ESCALATION_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub const DEFAULT_TERMINATION_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

impl CommandRequest {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            cwd: None,
            env: Vec::new(),
            timeout: None,
        }
    }

    pub fn rendered(&self) -> String {
        let mut rendered = self.program.to_string_lossy().into_owned();
        for arg in &self.args {
            rendered.push(' ');
            rendered.push_str(arg);
        }
        rendered
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandExit {
    pub exit_code: i32,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

impl OutputLine {
    pub fn text(&self) -> &str {
        match self {
            Self::Stdout(text) | Self::Stderr(text) => text,
        }
    }
}

/// Cooperative cancellation signal shared between the queue, the
/// orchestrator, and the runner. Signalling sends SIGTERM to the active
/// subprocess and escalates to SIGKILL after a grace period.
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for CancellationHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationHandle {
    pub fn new() -> Self {
        let (sender, _receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        if *receiver.borrow() {
            return;
        }
        while receiver.changed().await.is_ok() {
            if *receiver.borrow() {
                return;
            }
        }
        // The sender half lives inside this handle, so the channel only closes
        // when every clone is gone and nobody can cancel anymore.
        std::future::pending::<()>().await;
    }
}

/// Executes one external command, streaming every output line to `on_line`.
/// Implementations must never buffer the whole output in memory.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(
        &self,
        request: CommandRequest,
        cancellation: CancellationHandle,
        on_line: &mut (dyn FnMut(OutputLine) + Send),
    ) -> MigrationResult<CommandExit>;
}

#[derive(Debug, Clone)]
pub struct TokioProcessRunner {
    termination_grace: Duration,
}

impl Default for TokioProcessRunner {
    fn default() -> Self {
        Self::new(DEFAULT_TERMINATION_GRACE)
    }
}

impl TokioProcessRunner {
    pub fn new(termination_grace: Duration) -> Self {
        Self { termination_grace }
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
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

        let mut command = Command::new(&request.program);
        command.args(&request.args);
        if let Some(cwd) = &request.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &request.env {
            command.env(key, value);
        }
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.kill_on_drop(true);

        let started = Instant::now();
        let mut child = command.spawn().map_err(|error| match error.kind() {
            std::io::ErrorKind::NotFound => MigrationError::Configuration(format!(
                "command `{}` was not found; install it or fix the configured binary path",
                request.program.display()
            )),
            _ => MigrationError::Io(format!(
                "failed to spawn `{}`: {error}",
                request.rendered()
            )),
        })?;
        let pid = child.id();

        let stdout = child.stdout.take().ok_or_else(|| {
            MigrationError::Internal("child stdout was not captured".to_owned())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            MigrationError::Internal("child stderr was not captured".to_owned())
        })?;

        let (line_tx, mut line_rx) = mpsc::channel::<OutputLine>(LINE_CHANNEL_CAPACITY);
        let stdout_task = tokio::spawn(stream_lines(stdout, OutputLine::Stdout, line_tx.clone()));
        let stderr_task = tokio::spawn(stream_lines(stderr, OutputLine::Stderr, line_tx));

        let exited = Arc::new(AtomicBool::new(false));
        let termination_reason: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let escalation_task = tokio::spawn(escalate_on_trigger(
            cancellation.clone(),
            request.timeout,
            pid,
            Arc::clone(&exited),
            Arc::clone(&termination_reason),
            self.termination_grace,
        ));

        let mut stderr_tail: VecDeque<String> = VecDeque::new();
        while let Some(line) = line_rx.recv().await {
            if let OutputLine::Stderr(text) = &line {
                push_tail(&mut stderr_tail, text);
            }
            on_line(line);
        }

        let status = child
            .wait()
            .await
            .map_err(|error| MigrationError::Io(format!("failed to reap child: {error}")))?;
        exited.store(true, Ordering::SeqCst);
        escalation_task.abort();
        let _ = stdout_task.await;
        let _ = stderr_task.await;

        let reason = termination_reason
            .lock()
            .expect("termination reason lock poisoned")
            .take();
        if let Some(reason) = reason {
            return Err(MigrationError::Cancelled(format!(
                "`{}` {reason}",
                request.rendered()
            )));
        }

        if status.success() {
            Ok(CommandExit {
                exit_code: status.code().unwrap_or(0),
                duration: started.elapsed(),
            })
        } else {
            Err(MigrationError::ProcessExit {
                code: status.code().unwrap_or(-1),
                stderr_tail: render_tail(&stderr_tail),
            })
        }
    }
}

/// Incremental line splitter: reads fixed-size chunks and emits complete
/// lines, so memory stays bounded regardless of how much the child prints.
async fn stream_lines<R>(
    mut reader: R,
    wrap: fn(String) -> OutputLine,
    tx: mpsc::Sender<OutputLine>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    let mut buffer: Vec<u8> = Vec::new();
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(read) => {
                buffer.extend_from_slice(&chunk[..read]);
                while let Some(newline_index) = buffer.iter().position(|byte| *byte == b'\n') {
                    let mut line = buffer.drain(..=newline_index).collect::<Vec<_>>();
                    if matches!(line.last(), Some(b'\n')) {
                        line.pop();
                    }
                    if matches!(line.last(), Some(b'\r')) {
                        line.pop();
                    }
                    let text = String::from_utf8_lossy(&line).into_owned();
                    if tx.send(wrap(text)).await.is_err() {
                        return;
                    }
                }
            }
            Err(_) => break,
        }
    }
    if !buffer.is_empty() {
        let text = String::from_utf8_lossy(&buffer).into_owned();
        let _ = tx.send(wrap(text)).await;
    }
}

/// Waits for a cancellation signal or the request timeout, then terminates
/// the child: SIGTERM first, SIGKILL once the grace period elapses.
async fn escalate_on_trigger(
    cancellation: CancellationHandle,
    timeout: Option<Duration>,
    pid: Option<u32>,
    exited: Arc<AtomicBool>,
    termination_reason: Arc<Mutex<Option<String>>>,
    grace: Duration,
) {
    let reason = match timeout {
        Some(limit) => {
            tokio::select! {
                _ = cancellation.cancelled() => "was terminated on request".to_owned(),
                _ = sleep(limit) => format!("timed out after {limit:?}"),
            }
        }
        None => {
            cancellation.cancelled().await;
            "was terminated on request".to_owned()
        }
    };

    if exited.load(Ordering::SeqCst) {
        return;
    }
    {
        let mut slot = termination_reason
            .lock()
            .expect("termination reason lock poisoned");
        *slot = Some(reason);
    }

    let Some(pid) = pid else {
        return;
    };
    send_terminate(pid);
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if exited.load(Ordering::SeqCst) {
            return;
        }
        sleep(ESCALATION_POLL_INTERVAL).await;
    }
    if !exited.load(Ordering::SeqCst) {
        tracing::warn!(pid, grace_secs = grace.as_secs(), "child outlived SIGTERM grace; sending SIGKILL");
        send_kill(pid);
    }
}

fn push_tail(tail: &mut VecDeque<String>, line: &str) {
    if tail.len() == STDERR_TAIL_LINES {
        tail.pop_front();
    }
    let mut line = line.to_owned();
    line.truncate(STDERR_TAIL_MAX_BYTES / STDERR_TAIL_LINES);
    tail.push_back(line);
}

fn render_tail(tail: &VecDeque<String>) -> String {
    if tail.is_empty() {
        return "(no stderr output)".to_owned();
    }
    tail.iter().cloned().collect::<Vec<_>>().join("\n")
}

#[cfg(unix)]
fn send_terminate(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
}

#[cfg(unix)]
fn send_kill(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
}

#[cfg(not(unix))]
fn send_terminate(_pid: u32) {}

#[cfg(not(unix))]
fn send_kill(_pid: u32) {}
