use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::BackendKind;

/// Backend-agnostic agent events.
///
/// Every `Backend::execute` call yields zero or more non-terminal events and
/// finishes with exactly one [`AgentEvent::Result`] (or an error).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Incremental agent prose.
    Text { text: String },
    /// Reasoning trace, kept apart from `Text`.
    Thinking { text: String },
    /// A tool/capability invocation began. `id` is unique within one call.
    ToolStart { id: String, name: String, input: Value },
    /// Completion of the `ToolStart` with the same `id`.
    ToolResult {
        id: String,
        output: String,
        is_error: bool,
    },
    /// Usage accounting. Which fields are present depends on the backend.
    Cost {
        cost_usd: Option<f64>,
        input_tokens: Option<u64>,
        output_tokens: Option<u64>,
    },
    /// Terminal event of a successful call.
    Result {
        structured_output: Option<Value>,
        continuation: Option<ContinuationToken>,
    },
}

impl AgentEvent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn thinking(text: impl Into<String>) -> Self {
        Self::Thinking { text: text.into() }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Result { .. })
    }
}

/// Opaque handle that lets a later call resume the same multi-turn context.
///
/// Tokens are tagged with the backend kind that produced them; a backend of a
/// different kind ignores them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuationToken {
    pub backend: BackendKind,
    pub data: Value,
}

impl ContinuationToken {
    pub fn new(backend: BackendKind, data: Value) -> Self {
        Self { backend, data }
    }

    /// True if this token was produced by a backend of `kind`.
    pub fn belongs_to(&self, kind: BackendKind) -> bool {
        self.backend == kind
    }

    /// Look up a string field in the token payload.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}
