pub mod claudecode;
pub mod codex;
pub mod events;
pub mod registry;
pub mod shared;

use std::fmt;
use std::path::PathBuf;
use std::pin::Pin;
use std::str::FromStr;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use events::{AgentEvent, ContinuationToken};

/// The agent transports this crate knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Long-lived bidirectional Claude Code session.
    Claude,
    /// One `codex exec` subprocess per call.
    Codex,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "claude" => Ok(Self::Claude),
            "codex" => Ok(Self::Codex),
            other => Err(format!(
                "unknown backend '{}', expected 'claude' or 'codex'",
                other
            )),
        }
    }
}

/// Errors raised by a backend while executing a turn.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The agent process reported a failed turn or exited without a terminal event.
    #[error("agent process failed: {message}")]
    ProcessFailure { message: String },

    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error talking to agent: {0}")]
    Io(#[from] std::io::Error),

    /// The session transport reported an error.
    #[error("session error: {0}")]
    Session(String),

    /// `cancel()` was called while the turn was in flight.
    #[error("execution cancelled")]
    Cancelled,
}

impl BackendError {
    pub fn process_failure(message: impl Into<String>) -> Self {
        Self::ProcessFailure {
            message: message.into(),
        }
    }
}

/// Lazy, pull-based event sequence produced by one `execute` call.
pub type EventStream<'a> =
    Pin<Box<dyn Stream<Item = Result<AgentEvent, BackendError>> + Send + 'a>>;

/// Inputs for a single agent turn.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub cwd: PathBuf,
    pub prompt: String,
    /// JSON schema for structured output, if the caller wants one.
    pub output_schema: Option<Value>,
    pub continuation: Option<ContinuationToken>,
}

impl ExecuteRequest {
    pub fn new(cwd: impl Into<PathBuf>, prompt: impl Into<String>) -> Self {
        Self {
            cwd: cwd.into(),
            prompt: prompt.into(),
            output_schema: None,
            continuation: None,
        }
    }

    pub fn with_schema(mut self, schema: Option<Value>) -> Self {
        self.output_schema = schema;
        self
    }

    pub fn with_continuation(mut self, continuation: Option<ContinuationToken>) -> Self {
        self.continuation = continuation;
        self
    }
}

/// An agent transport.
///
/// An instance owns at most one live transport resource at a time and is never
/// driven by two concurrent `execute` calls.
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Start a fresh turn. The returned stream is finite and not restartable.
    fn execute(&self, request: ExecuteRequest) -> EventStream<'_>;

    /// Abort in-flight work. A no-op when idle; safe to call repeatedly.
    async fn cancel(&self);

    /// Build the backend-specific syntax that references a skill inside a prompt.
    fn format_skill_invocation(&self, skill_key: &str, args: Option<&str>) -> String;
}
