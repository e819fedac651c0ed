//! Drives a single backend turn to completion.
//!
//! The runner aggregates Text output, watches for the "unknown skill" signal,
//! routes events to a renderer or a progress callback, and keeps the
//! [`ActiveBackends`] set current so an interrupt handler can cancel
//! whatever is running.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use futures::StreamExt;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::events::{AgentEvent, ContinuationToken};
use crate::backend::{Backend, BackendError, ExecuteRequest};

/// Text the agent CLIs print when a referenced skill is not installed.
pub const UNKNOWN_SKILL_PATTERN: &str = r"Unknown skill: ([\w:-]+)";

const STATUS_LIMIT: usize = 80;

fn unknown_skill_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(UNKNOWN_SKILL_PATTERN).expect("Invalid unknown-skill regex pattern"))
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("skill '{capability}' is not available")]
    CapabilityNotAvailable { capability: String },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("agent turn ended without a result")]
    MissingResult,
}

impl RunnerError {
    /// True when the turn stopped because someone asked it to.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Backend(BackendError::Cancelled))
    }
}

// ── Active backends ───────────────────────────────────────────────

/// Set of backends with a turn in flight, plus the run-wide cancellation.
///
/// Owned by the top-level caller and shared by clone; the runner brackets
/// every turn with [`ActiveBackends::register`], and an interrupt handler
/// calls [`ActiveBackends::cancel_all`]. Cancellation is permanent: turns
/// that have not started yet are refused.
#[derive(Clone, Default)]
pub struct ActiveBackends {
    entries: Arc<Mutex<HashMap<u64, Arc<dyn Backend>>>>,
    next_id: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl ActiveBackends {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `backend` until the returned guard is dropped.
    pub fn register(&self, backend: Arc<dyn Backend>) -> ActiveGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, backend);
        ActiveGuard {
            active: self.clone(),
            id,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Completes once [`ActiveBackends::cancel_all`] has been called.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Cancel the run: refuse new turns and cancel every tracked backend.
    /// Returns how many backends were signalled.
    pub async fn cancel_all(&self) -> usize {
        // Snapshot so the lock is not held across cancel().await.
        let backends: Vec<Arc<dyn Backend>> = self.lock().values().cloned().collect();
        self.cancel.cancel();
        if backends.is_empty() {
            return 0;
        }
        info!(count = backends.len(), "Cancelling active agent turns");
        futures::future::join_all(backends.iter().map(|backend| backend.cancel())).await;
        backends.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Arc<dyn Backend>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Removes its backend from [`ActiveBackends`] on drop.
pub struct ActiveGuard {
    active: ActiveBackends,
    id: u64,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.lock().remove(&self.id);
    }
}

// ── Event sinks ───────────────────────────────────────────────────

/// Interactive sink for a single turn's events.
pub trait EventRenderer: Send + Sync {
    fn render(&self, event: &AgentEvent);
}

/// Renderer that writes events to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogRenderer;

impl EventRenderer for LogRenderer {
    fn render(&self, event: &AgentEvent) {
        match event {
            AgentEvent::Text { text } => debug!("{}", text),
            AgentEvent::Thinking { text } => debug!(thinking = %text),
            AgentEvent::ToolStart { id, name, input } => {
                info!(tool = %name, id = %id, "{}", summarize_input(input))
            }
            AgentEvent::ToolResult {
                id,
                output,
                is_error,
            } => {
                if *is_error {
                    warn!(id = %id, "Tool failed: {}", first_line(output))
                } else {
                    debug!(id = %id, "Tool finished: {}", first_line(output))
                }
            }
            AgentEvent::Cost {
                cost_usd,
                input_tokens,
                output_tokens,
            } => info!(?cost_usd, ?input_tokens, ?output_tokens, "Turn usage"),
            AgentEvent::Result { .. } => {}
        }
    }
}

/// Receives short status lines; used instead of a renderer when many turns
/// run at once.
pub type ProgressCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Status line for `event`, if it warrants one.
fn progress_status(event: &AgentEvent) -> Option<String> {
    match event {
        AgentEvent::Text { text } => {
            let line = first_line(text);
            (!line.is_empty()).then_some(line)
        }
        AgentEvent::ToolStart { name, input, .. } => {
            let detail = summarize_input(input);
            Some(if detail.is_empty() {
                name.clone()
            } else {
                format!("{}: {}", name, detail)
            })
        }
        _ => None,
    }
}

fn first_line(text: &str) -> String {
    let line = text.trim().lines().next().unwrap_or("").trim();
    if line.chars().count() > STATUS_LIMIT {
        format!("{}...", line.chars().take(STATUS_LIMIT).collect::<String>())
    } else {
        line.to_string()
    }
}

fn summarize_input(input: &Value) -> String {
    ["command", "file_path", "file", "path", "pattern"]
        .iter()
        .find_map(|key| input.get(key).and_then(Value::as_str))
        .map(first_line)
        .unwrap_or_default()
}

// ── Runner ────────────────────────────────────────────────────────

/// Per-call options for [`AgentRunner::run`].
#[derive(Clone, Default)]
pub struct RunOptions {
    pub output_schema: Option<Value>,
    pub continuation: Option<ContinuationToken>,
    /// When set, events go here instead of the renderer.
    pub progress: Option<ProgressCallback>,
}

impl RunOptions {
    pub fn with_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn with_continuation(mut self, continuation: Option<ContinuationToken>) -> Self {
        self.continuation = continuation;
        self
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutput {
    Text(String),
    Structured(Value),
}

impl AgentOutput {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Structured(_) => None,
        }
    }

    pub fn as_structured(&self) -> Option<&Value> {
        match self {
            Self::Structured(value) => Some(value),
            Self::Text(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub output: AgentOutput,
    pub continuation: Option<ContinuationToken>,
}

#[derive(Clone)]
pub struct AgentRunner {
    active: ActiveBackends,
    renderer: Arc<dyn EventRenderer>,
}

impl AgentRunner {
    pub fn new(active: ActiveBackends) -> Self {
        Self::with_renderer(active, Arc::new(LogRenderer))
    }

    pub fn with_renderer(active: ActiveBackends, renderer: Arc<dyn EventRenderer>) -> Self {
        Self { active, renderer }
    }

    pub fn active(&self) -> &ActiveBackends {
        &self.active
    }

    /// Run one turn on `backend` and collect its output.
    pub async fn run(
        &self,
        backend: Arc<dyn Backend>,
        cwd: &Path,
        prompt: &str,
        options: RunOptions,
    ) -> Result<RunOutput, RunnerError> {
        if self.active.is_cancelled() {
            return Err(BackendError::Cancelled.into());
        }
        let _registered = self.active.register(Arc::clone(&backend));
        let wants_structured = options.output_schema.is_some();
        let request = ExecuteRequest::new(cwd, prompt)
            .with_schema(options.output_schema)
            .with_continuation(options.continuation);

        debug!(backend = %backend.kind(), cwd = %cwd.display(), "Starting agent turn");

        let mut stream = backend.execute(request);
        let mut text = String::new();
        let mut terminal: Option<(Option<Value>, Option<ContinuationToken>)> = None;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.active.cancelled() => None,
                event = stream.next() => Some(event),
            };
            let event = match next {
                // Dropping the stream tears down the transport.
                None => return Err(BackendError::Cancelled.into()),
                Some(None) => break,
                Some(Some(event)) => event?,
            };

            if let AgentEvent::Text { text: chunk } = &event {
                if let Some(capability) = self.missing_capability(chunk) {
                    // Dropping the stream tears down the transport.
                    drop(stream);
                    warn!(backend = %backend.kind(), skill = %capability, "Skill not available");
                    return Err(RunnerError::CapabilityNotAvailable { capability });
                }
                text.push_str(chunk);
            }

            match &options.progress {
                Some(progress) => {
                    if let Some(status) = progress_status(&event) {
                        progress(&status);
                    }
                }
                None => self.renderer.render(&event),
            }

            if let AgentEvent::Result {
                structured_output,
                continuation,
            } = event
            {
                terminal = Some((structured_output, continuation));
                break;
            }
        }

        let (structured, continuation) = terminal.ok_or(RunnerError::MissingResult)?;
        let output = match structured {
            Some(value) if wants_structured => AgentOutput::Structured(value),
            _ => AgentOutput::Text(text),
        };
        Ok(RunOutput {
            output,
            continuation,
        })
    }

    fn missing_capability(&self, text: &str) -> Option<String> {
        unknown_skill_regex()
            .captures(text)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }
}
