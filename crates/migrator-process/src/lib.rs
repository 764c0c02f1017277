//! Subprocess orchestration: cancellable line-streamed command execution and
//! the stateful progress parser for bridge-tool output.

pub mod parser;
pub mod runner;

pub use parser::{ParsedLine, ProgressEvent, RevisionProgressParser};
pub use runner::{
    CancellationHandle, CommandExit, CommandRequest, OutputLine, ProcessRunner, TokioProcessRunner,
};
