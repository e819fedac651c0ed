use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::shared::{self, ProcessSlot, SlotGuard, DEFAULT_TERMINATE_GRACE};
use crate::backend::BackendError;

pub const DEFAULT_CLAUDE_MODEL: &str = "opus";

/// Configuration for the Claude Code session transport.
#[derive(Debug, Clone)]
pub struct ClaudeCodeConfig {
    pub cli_path: String,
    /// Arguments placed before the session flags, for wrapper launchers.
    pub launcher_args: Vec<String>,
    pub model: String,
    pub permission_mode: String,
    /// Stream token deltas instead of whole assistant messages.
    pub include_partial_messages: bool,
    pub terminate_grace: Duration,
}

impl Default for ClaudeCodeConfig {
    fn default() -> Self {
        Self {
            cli_path: std::env::var("CLAUDE_CLI_PATH").unwrap_or_else(|_| "claude".to_string()),
            launcher_args: Vec::new(),
            model: DEFAULT_CLAUDE_MODEL.to_string(),
            permission_mode: "bypassPermissions".to_string(),
            include_partial_messages: false,
            terminate_grace: DEFAULT_TERMINATE_GRACE,
        }
    }
}

// ── Session protocol messages ─────────────────────────────────────

/// Messages a Claude Code session emits in stream-json mode.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum SessionMessage {
    #[serde(rename = "system")]
    System(SystemMessage),
    #[serde(rename = "stream_event")]
    StreamEvent(StreamEventWrapper),
    #[serde(rename = "assistant")]
    Assistant(AssistantMessage),
    #[serde(rename = "user")]
    User(UserMessage),
    #[serde(rename = "result")]
    Result(ResultMessage),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemMessage {
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamEventWrapper {
    pub event: StreamEvent,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { index: u32, delta: Delta },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Delta {
    #[serde(rename = "type")]
    pub delta_type: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub thinking: Option<String>,
    #[serde(default)]
    pub partial_json: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantMessage {
    pub message: MessageBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserMessage {
    pub message: MessageBody,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageBody {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "thinking")]
    Thinking { thinking: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Option<ToolResultContent>,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

/// Tool result content: a plain string or a list of content blocks.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Structured(Vec<Value>),
}

impl ToolResultContent {
    pub fn to_string_lossy(&self) -> String {
        match self {
            ToolResultContent::Text(s) => s.clone(),
            ToolResultContent::Structured(items) => {
                let parts: Vec<String> = items
                    .iter()
                    .filter_map(|item| {
                        let obj = item.as_object()?;
                        if obj.get("type").and_then(Value::as_str) == Some("image") {
                            Some("[image]".to_string())
                        } else {
                            obj.get("text").and_then(Value::as_str).map(str::to_string)
                        }
                    })
                    .collect();
                if parts.is_empty() {
                    Value::Array(items.clone()).to_string()
                } else {
                    parts.join("\n")
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultMessage {
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub structured_output: Option<Value>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl ResultMessage {
    /// Best available description of a failed session result.
    pub fn error_message(&self) -> String {
        let raw = self
            .result
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| self.errors.first().map(String::as_str).filter(|s| !s.is_empty()))
            .unwrap_or(self.subtype.as_str());
        if raw.is_empty() {
            return "Unknown error".to_string();
        }
        Self::parse_error_json(raw).unwrap_or_else(|| raw.to_string())
    }

    /// Pull the message out of errors like `402 {"error":{"message":"..."}}`.
    fn parse_error_json(raw: &str) -> Option<String> {
        let json_str = raw.find('{').map(|idx| &raw[idx..])?;
        let parsed: Value = serde_json::from_str(json_str).ok()?;
        parsed
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
            .or_else(|| parsed.get("message").and_then(Value::as_str))
            .map(str::to_string)
    }
}

// ── Session transport ─────────────────────────────────────────────

/// Per-session settings passed to a [`SessionConnector`].
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub cwd: PathBuf,
    pub model: String,
    pub permission_mode: String,
    pub include_partial_messages: bool,
    pub output_schema: Option<Value>,
}

/// Opens bidirectional agent sessions.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, options: SessionOptions) -> Result<Box<dyn AgentSession>, BackendError>;
}

/// An open session: send a query, then pull messages until a result arrives.
#[async_trait]
pub trait AgentSession: Send {
    async fn query(&mut self, prompt: &str) -> Result<(), BackendError>;

    /// Next protocol message, or `None` once the session output has ended.
    async fn next_message(&mut self) -> Result<Option<SessionMessage>, BackendError>;

    /// Finish the session normally.
    async fn close(&mut self);

    /// Stop the session immediately.
    async fn abort(&mut self);
}

/// Connector that runs the Claude Code CLI in stream-json input/output mode.
pub struct ClaudeCliConnector {
    config: ClaudeCodeConfig,
}

impl ClaudeCliConnector {
    pub fn new(config: ClaudeCodeConfig) -> Self {
        Self { config }
    }

    fn session_args(&self, options: &SessionOptions) -> Vec<String> {
        let mut args = self.config.launcher_args.clone();
        args.extend(
            [
                "--print",
                "--input-format",
                "stream-json",
                "--output-format",
                "stream-json",
                "--verbose",
                "--model",
                options.model.as_str(),
                "--permission-mode",
                options.permission_mode.as_str(),
            ]
            .into_iter()
            .map(str::to_string),
        );
        if options.include_partial_messages {
            args.push("--include-partial-messages".to_string());
        }
        if let Some(schema) = &options.output_schema {
            args.push("--json-schema".to_string());
            args.push(schema.to_string());
        }
        args
    }
}

#[async_trait]
impl SessionConnector for ClaudeCliConnector {
    async fn connect(&self, options: SessionOptions) -> Result<Box<dyn AgentSession>, BackendError> {
        let mut cmd = Command::new(&self.config.cli_path);
        cmd.args(self.session_args(&options))
            .current_dir(&options.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        info!(
            "Spawning Claude CLI: directory={}, model={}, schema={}",
            options.cwd.display(),
            options.model,
            options.output_schema.is_some()
        );

        let mut child = shared::spawn(&mut cmd, &self.config.cli_path)?;
        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Session("failed to capture Claude stdout".into()))?;
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| shared::drain_stderr(stderr, "Claude"));

        let process = ProcessSlot::new();
        let guard = process.guard(self.config.terminate_grace);
        process.install(child).await;

        Ok(Box::new(ClaudeCliSession {
            stdin,
            lines: BufReader::new(stdout).lines(),
            process,
            _guard: guard,
            stderr_task,
            grace: self.config.terminate_grace,
        }))
    }
}

/// A running `claude` process. Stdin stays open for the session's lifetime.
pub struct ClaudeCliSession {
    stdin: Option<ChildStdin>,
    lines: Lines<BufReader<ChildStdout>>,
    process: ProcessSlot,
    _guard: SlotGuard,
    stderr_task: Option<JoinHandle<String>>,
    grace: Duration,
}

impl ClaudeCliSession {
    async fn stderr_tail(&mut self) -> String {
        match self.stderr_task.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        }
    }
}

#[async_trait]
impl AgentSession for ClaudeCliSession {
    async fn query(&mut self, prompt: &str) -> Result<(), BackendError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| BackendError::Session("session input is closed".into()))?;
        let message = json!({
            "type": "user",
            "message": { "role": "user", "content": prompt },
        });
        let mut line = message.to_string();
        line.push('\n');
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn next_message(&mut self) -> Result<Option<SessionMessage>, BackendError> {
        loop {
            let Some(line) = self.lines.next_line().await? else {
                let status = self.process.reap().await;
                if let Some(Ok(status)) = &status {
                    if !status.success() {
                        let tail = self.stderr_tail().await;
                        warn!("Claude CLI exited with status {}: {}", status, tail);
                    }
                }
                return Ok(None);
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<SessionMessage>(line) {
                Ok(message) => return Ok(Some(message)),
                Err(e) => {
                    warn!(
                        "Skipping unparseable Claude message: {} - line: {}",
                        e,
                        shared::truncate_for_log(line)
                    );
                }
            }
        }
    }

    async fn close(&mut self) {
        // Closing stdin ends the session; the CLI exits on its own.
        drop(self.stdin.take());
        match tokio::time::timeout(self.grace, self.process.reap()).await {
            Ok(Some(Ok(status))) => debug!("Claude CLI exited: {}", status),
            Ok(Some(Err(e))) => warn!("Failed to wait for Claude CLI: {}", e),
            Ok(None) => {}
            // The timed-out wait dropped the child, which kills it.
            Err(_) => warn!("Claude CLI did not exit after its session closed, killed"),
        }
    }

    async fn abort(&mut self) {
        drop(self.stdin.take());
        self.process.terminate(self.grace).await;
    }
}
