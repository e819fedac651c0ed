pub mod client;

use std::collections::HashMap;
use std::io::Write;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::events::{AgentEvent, ContinuationToken};
use crate::backend::shared::{self, ProcessSlot};
use crate::backend::{Backend, BackendError, BackendKind, EventStream, ExecuteRequest};

use client::{command_string, item_text, CodexConfig, CodexEvent, CodexItem};

/// Backend that runs one `codex exec` process per turn and translates its
/// NDJSON output into [`AgentEvent`]s.
pub struct CodexBackend {
    config: CodexConfig,
    process: ProcessSlot,
    cancelled: AtomicBool,
}

impl CodexBackend {
    pub fn new() -> Self {
        Self::with_config(CodexConfig::default())
    }

    pub fn with_config(config: CodexConfig) -> Self {
        Self {
            config,
            process: ProcessSlot::new(),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &CodexConfig {
        &self.config
    }
}

impl Default for CodexBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for CodexBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Codex
    }

    fn execute(&self, request: ExecuteRequest) -> EventStream<'_> {
        // The turn starts at the call, not the first poll: a cancel() in
        // between must survive, while one on an idle backend must not.
        self.cancelled.store(false, Ordering::SeqCst);
        Box::pin(async_stream::try_stream! {
            if self.cancelled.load(Ordering::SeqCst) {
                Err::<(), BackendError>(BackendError::Cancelled)?;
            }

            // Deleted when dropped, whichever way this stream ends.
            let schema_file = match &request.output_schema {
                Some(schema) => Some(write_schema_file(schema)?),
                None => None,
            };

            let resume_thread = match &request.continuation {
                Some(token) if token.belongs_to(BackendKind::Codex) => {
                    let thread = token.get_str("thread_id").map(str::to_string);
                    if thread.is_none() {
                        warn!("Codex continuation token has no thread_id, starting a new thread");
                    }
                    thread
                }
                Some(token) => {
                    debug!(
                        "Ignoring continuation token from {} backend",
                        token.backend
                    );
                    None
                }
                None => None,
            };

            let args = self.config.exec_args(
                &request.cwd,
                schema_file.as_ref().map(|f| f.path()),
                resume_thread.as_deref(),
            );

            let mut cmd = Command::new(&self.config.cli_path);
            cmd.args(&args)
                .current_dir(&request.cwd)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());

            info!(
                "Spawning Codex CLI: directory={}, model={}, resume={:?}, schema={}",
                request.cwd.display(),
                self.config.model,
                resume_thread,
                schema_file.is_some()
            );

            let mut child = shared::spawn(&mut cmd, &self.config.cli_path)?;
            let stdin = child.stdin.take();
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| BackendError::process_failure("failed to capture Codex stdout"))?;
            let stderr_task = child
                .stderr
                .take()
                .map(|stderr| shared::drain_stderr(stderr, "Codex"));

            let _guard = self.process.guard(self.config.terminate_grace);
            self.process.install(child).await;
            // A cancel() that ran before install found no process to stop.
            if self.cancelled.load(Ordering::SeqCst) {
                self.process.terminate(self.config.terminate_grace).await;
                Err::<(), BackendError>(BackendError::Cancelled)?;
            }

            // The prompt is the whole of stdin; closing it marks the prompt complete.
            if let Some(mut stdin) = stdin {
                let prompt = request.prompt.clone();
                tokio::spawn(async move {
                    if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                        warn!("Failed to write prompt to Codex stdin: {}", e);
                        return;
                    }
                    if let Err(e) = stdin.shutdown().await {
                        debug!("Failed to close Codex stdin: {}", e);
                    }
                });
            }

            let mut translator = CodexTranslator::new(request.output_schema.is_some());
            let mut lines = BufReader::new(stdout).lines();
            let mut final_events: Option<Vec<AgentEvent>> = None;
            let mut failure: Option<BackendError> = None;

            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        failure = Some(BackendError::Io(e));
                        break;
                    }
                };
                match translator.handle_line(&line) {
                    Ok(Translation::Events(events)) => {
                        for event in events {
                            yield event;
                        }
                    }
                    Ok(Translation::Finished(events)) => {
                        final_events = Some(events);
                        break;
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            drop(lines);

            let status = self.process.reap().await;
            let stderr_tail = match stderr_task {
                Some(task) if status.is_some() => task.await.unwrap_or_default(),
                Some(task) => {
                    task.abort();
                    String::new()
                }
                None => String::new(),
            };
            if let Some(Ok(status)) = &status {
                if !status.success() {
                    warn!("Codex CLI exited with status: {}", status);
                }
            }

            if let Some(err) = failure {
                Err::<(), BackendError>(err)?;
            }

            if self.cancelled.load(Ordering::SeqCst) {
                Err::<(), BackendError>(BackendError::Cancelled)?;
            }

            match final_events {
                Some(events) => {
                    for event in events {
                        yield event;
                    }
                }
                None => {
                    Err::<(), BackendError>(shared::anomalous_exit(
                        "codex",
                        status,
                        translator.last_error(),
                        &stderr_tail,
                    ))?;
                }
            }
        })
    }

    async fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if self.process.terminate(self.config.terminate_grace).await {
            info!("Codex turn cancelled");
        }
    }

    fn format_skill_invocation(&self, skill_key: &str, args: Option<&str>) -> String {
        // Codex skills are referenced as `$name`; namespaces are dropped.
        let name = skill_key.rsplit(':').next().unwrap_or(skill_key);
        match args.filter(|a| !a.is_empty()) {
            Some(args) => format!("${} {}", name, args),
            None => format!("${}", name),
        }
    }
}

fn write_schema_file(schema: &Value) -> Result<NamedTempFile, BackendError> {
    let mut file = tempfile::Builder::new()
        .prefix("daydream-schema-")
        .suffix(".json")
        .tempfile()?;
    serde_json::to_writer(&mut file, schema).map_err(std::io::Error::from)?;
    file.flush()?;
    Ok(file)
}

/// Outcome of feeding one output line to the translator.
#[derive(Debug, PartialEq)]
pub(crate) enum Translation {
    Events(Vec<AgentEvent>),
    /// `turn.completed` was seen; these are the closing Cost and Result events.
    Finished(Vec<AgentEvent>),
}

/// Per-turn state for turning Codex NDJSON into [`AgentEvent`]s.
pub(crate) struct CodexTranslator {
    wants_structured: bool,
    thread_id: Option<String>,
    last_agent_text: Option<String>,
    /// Ids generated for items the CLI sent without one, so start and
    /// completion still pair up.
    generated_ids: HashMap<String, String>,
    last_error: Option<String>,
}

impl CodexTranslator {
    pub(crate) fn new(wants_structured: bool) -> Self {
        Self {
            wants_structured,
            thread_id: None,
            last_agent_text: None,
            generated_ids: HashMap::new(),
            last_error: None,
        }
    }

    pub(crate) fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub(crate) fn handle_line(&mut self, line: &str) -> Result<Translation, BackendError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Translation::Events(Vec::new()));
        }
        match serde_json::from_str::<CodexEvent>(line) {
            Ok(event) => self.handle_event(event),
            Err(e) => {
                warn!(
                    "Skipping unparseable Codex line: {} - line: {}",
                    e,
                    shared::truncate_for_log(line)
                );
                Ok(Translation::Events(Vec::new()))
            }
        }
    }

    pub(crate) fn handle_event(&mut self, event: CodexEvent) -> Result<Translation, BackendError> {
        let mut events = Vec::new();
        match event {
            CodexEvent::ThreadStarted { thread_id } => {
                debug!("Codex thread started: thread_id={}", thread_id);
                self.thread_id = Some(thread_id);
            }

            CodexEvent::ItemStarted { item } => self.item_started(item, &mut events),

            CodexEvent::ItemCompleted { item } => self.item_completed(item, &mut events),

            CodexEvent::TurnCompleted { usage } => {
                let usage = usage.unwrap_or_default();
                events.push(AgentEvent::Cost {
                    cost_usd: None,
                    input_tokens: usage.input_tokens,
                    output_tokens: usage.output_tokens,
                });

                let structured_output = if self.wants_structured {
                    self.last_agent_text.as_deref().and_then(decode_structured)
                } else {
                    None
                };

                let continuation = self.thread_id.as_ref().map(|thread_id| {
                    ContinuationToken::new(BackendKind::Codex, json!({ "thread_id": thread_id }))
                });

                events.push(AgentEvent::Result {
                    structured_output,
                    continuation,
                });
                return Ok(Translation::Finished(events));
            }

            CodexEvent::TurnFailed { error } => {
                let message = error
                    .and_then(|e| e.message)
                    .or_else(|| self.last_error.clone())
                    .unwrap_or_else(|| "Unknown Codex error".to_string());
                return Err(BackendError::process_failure(message));
            }

            CodexEvent::Error { message } => {
                warn!("Codex reported an error: {:?}", message);
                if message.is_some() {
                    self.last_error = message;
                }
            }

            CodexEvent::Unknown => {
                debug!("Skipping unknown Codex event type");
            }
        }
        Ok(Translation::Events(events))
    }

    fn item_started(&mut self, item: CodexItem, events: &mut Vec<AgentEvent>) {
        match item {
            CodexItem::CommandExecution { id, command, .. } => {
                let command = command_string(&command);
                let id = self.start_id(id, "command_execution", &command);
                events.push(AgentEvent::ToolStart {
                    id,
                    name: "shell".to_string(),
                    input: json!({ "command": command }),
                });
            }
            CodexItem::McpToolCall {
                id,
                server,
                tool,
                arguments,
                ..
            } => {
                let tool = tool.unwrap_or_else(|| "unknown".to_string());
                let id = self.start_id(id, "mcp_tool_call", &tool);
                let name = match server {
                    Some(server) => format!("{}.{}", server, tool),
                    None => tool,
                };
                let input = if arguments.is_null() {
                    json!({})
                } else {
                    arguments
                };
                events.push(AgentEvent::ToolStart { id, name, input });
            }
            // Messages and reasoning carry no text until they complete.
            CodexItem::AgentMessage { .. } | CodexItem::Reasoning { .. } => {}
            CodexItem::FileChange { .. } => {
                debug!("Ignoring item.started for file_change");
            }
            CodexItem::Other => {
                debug!("Skipping unknown Codex item type");
            }
        }
    }

    fn item_completed(&mut self, item: CodexItem, events: &mut Vec<AgentEvent>) {
        match item {
            CodexItem::AgentMessage { text, content, .. } => {
                let text = item_text(text.as_deref(), &content);
                if !text.is_empty() {
                    self.last_agent_text = Some(text.clone());
                    events.push(AgentEvent::Text { text });
                }
            }
            CodexItem::Reasoning { text, content, .. } => {
                let text = item_text(text.as_deref(), &content);
                if !text.is_empty() {
                    events.push(AgentEvent::Thinking { text });
                }
            }
            CodexItem::CommandExecution {
                id,
                command,
                aggregated_output,
                exit_code,
                status,
            } => {
                let id = self.completion_id(id, "command_execution", &command_string(&command));
                let (output, is_error) = if status.as_deref() == Some("declined") {
                    ("Command declined by sandbox".to_string(), true)
                } else {
                    (
                        aggregated_output.unwrap_or_default(),
                        exit_code.map_or(true, |code| code != 0),
                    )
                };
                events.push(AgentEvent::ToolResult {
                    id,
                    output,
                    is_error,
                });
            }
            CodexItem::FileChange {
                id,
                file_path,
                action,
                changes,
            } => {
                // No item.started exists on the wire for file changes, so
                // the start/result pair is synthesised together.
                let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
                let (input, output) = describe_file_change(file_path, action, &changes);
                events.push(AgentEvent::ToolStart {
                    id: id.clone(),
                    name: "patch".to_string(),
                    input,
                });
                events.push(AgentEvent::ToolResult {
                    id,
                    output,
                    is_error: false,
                });
            }
            CodexItem::McpToolCall {
                id,
                tool,
                result,
                error,
                ..
            } => {
                let tool = tool.unwrap_or_else(|| "unknown".to_string());
                let id = self.completion_id(id, "mcp_tool_call", &tool);
                let is_error = error.as_ref().is_some_and(|e| match e {
                    Value::Null => false,
                    Value::String(s) => !s.trim().is_empty(),
                    _ => true,
                });
                let output = if is_error {
                    error.as_ref().map(value_text).unwrap_or_default()
                } else {
                    result
                        .as_ref()
                        .map(|r| r.get("content").map(value_text).unwrap_or_else(|| value_text(r)))
                        .unwrap_or_default()
                };
                events.push(AgentEvent::ToolResult {
                    id,
                    output,
                    is_error,
                });
            }
            CodexItem::Other => {
                debug!("Skipping unknown Codex item type");
            }
        }
    }

    fn start_id(&mut self, id: Option<String>, kind: &str, key: &str) -> String {
        id.unwrap_or_else(|| {
            let generated = Uuid::new_v4().to_string();
            self.generated_ids
                .insert(format!("{}:{}", kind, key), generated.clone());
            generated
        })
    }

    fn completion_id(&mut self, id: Option<String>, kind: &str, key: &str) -> String {
        id.unwrap_or_else(|| {
            self.generated_ids
                .remove(&format!("{}:{}", kind, key))
                .unwrap_or_else(|| Uuid::new_v4().to_string())
        })
    }
}

/// Decode the final agent message as structured output.
///
/// The CLI does not separate prose from the JSON payload, so a fenced block
/// is accepted too. Anything that does not decode yields `None`.
fn decode_structured(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }
    let inner = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))?;
    serde_json::from_str(inner.trim()).ok()
}

fn describe_file_change(
    file_path: Option<String>,
    action: Option<String>,
    changes: &[client::FileChangeEntry],
) -> (Value, String) {
    if changes.is_empty() {
        let file = file_path.unwrap_or_else(|| "unknown".to_string());
        let action = action.unwrap_or_else(|| "modified".to_string());
        let output = format!("{}: {}", action, file);
        return (json!({ "file": file, "action": action }), output);
    }

    let summary: Vec<String> = changes
        .iter()
        .map(|change| {
            let kind = change
                .kind
                .as_ref()
                .map(value_text)
                .unwrap_or_else(|| "update".to_string());
            format!("{}: {}", kind, change.path)
        })
        .collect();
    let files: Vec<&str> = changes.iter().map(|c| c.path.as_str()).collect();
    (json!({ "files": files }), summary.join("\n"))
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.get("text")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| value_text(item))
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(obj) => obj
            .get("type")
            .and_then(Value::as_str)
            .filter(|t| *t != "text")
            .map(|_| value.to_string())
            .or_else(|| obj.get("text").and_then(Value::as_str).map(str::to_string))
            .or_else(|| obj.get("message").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| value.to_string()),
        other => other.to_string(),
    }
}
