use thiserror::Error;

use crate::plugin::StageKind;

#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("stage {index} ({name}) failed to start: {reason}")]
    StartupFailure {
        index: usize,
        name: String,
        reason: String,
    },
    #[error("unknown {kind} plugin: {name}")]
    UnknownPlugin { kind: StageKind, name: String },
    #[error("plugin {name} cannot be used as {expected} stage")]
    WrongKind { name: String, expected: StageKind },
    #[error("stage index {index} out of range (0..{len})")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("input stage cannot be suspended")]
    InputNotSuspendable,
    #[error("stage {0} is not suspended")]
    NotSuspended(usize),
    #[error("stage {index} is {state}, cannot {action}")]
    InvalidState {
        index: usize,
        state: String,
        action: &'static str,
    },
    #[error("restart of stage {index} failed: {reason}")]
    RestartFailure { index: usize, reason: String },
    #[error("pipeline has no stages")]
    EmptyChain,
    #[error("pipeline is terminated")]
    Terminated,
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),
    #[error("cannot encode reply: {0}")]
    Encode(String),
}

/// Error reported by an input source or output sink.
#[derive(Debug, Error)]
pub enum StageIoError {
    /// Ends the stage gracefully.
    #[error("{0:#}")]
    Recoverable(anyhow::Error),
    /// Aborts the whole pipeline.
    #[error("fatal: {0:#}")]
    Fatal(anyhow::Error),
}

impl StageIoError {
    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        Self::Fatal(err.into())
    }
}

impl From<anyhow::Error> for StageIoError {
    fn from(value: anyhow::Error) -> Self {
        Self::Recoverable(value)
    }
}

impl From<std::io::Error> for StageIoError {
    fn from(value: std::io::Error) -> Self {
        Self::Recoverable(value.into())
    }
}
