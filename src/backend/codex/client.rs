use std::ffi::OsString;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::backend::shared::DEFAULT_TERMINATE_GRACE;

pub const DEFAULT_CODEX_MODEL: &str = "gpt-5.3-codex";

/// Configuration for the Codex CLI.
#[derive(Debug, Clone)]
pub struct CodexConfig {
    pub cli_path: String,
    /// Arguments placed before `exec`, for launchers such as `npx @openai/codex`.
    pub launcher_args: Vec<String>,
    pub model: String,
    pub sandbox: String,
    pub terminate_grace: Duration,
}

impl Default for CodexConfig {
    fn default() -> Self {
        Self {
            cli_path: std::env::var("CODEX_CLI_PATH").unwrap_or_else(|_| "codex".to_string()),
            launcher_args: Vec::new(),
            model: DEFAULT_CODEX_MODEL.to_string(),
            sandbox: "danger-full-access".to_string(),
            terminate_grace: DEFAULT_TERMINATE_GRACE,
        }
    }
}

impl CodexConfig {
    /// Arguments for one `codex exec` turn. The prompt itself goes to stdin.
    pub fn exec_args(
        &self,
        cwd: &Path,
        schema_path: Option<&Path>,
        resume_thread: Option<&str>,
    ) -> Vec<OsString> {
        let mut args: Vec<OsString> = self.launcher_args.iter().map(OsString::from).collect();
        args.extend(
            [
                "exec",
                "--experimental-json",
                "--model",
                self.model.as_str(),
                "--sandbox",
                self.sandbox.as_str(),
                "--cd",
            ]
            .into_iter()
            .map(OsString::from),
        );
        args.push(cwd.as_os_str().to_owned());

        if let Some(path) = schema_path {
            args.push("--output-schema".into());
            args.push(path.as_os_str().to_owned());
        }

        if let Some(thread_id) = resume_thread {
            args.push("resume".into());
            args.push(thread_id.into());
        }

        args
    }
}

/// Events emitted by `codex exec --experimental-json`, one JSON object per line.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum CodexEvent {
    #[serde(rename = "thread.started")]
    ThreadStarted { thread_id: String },

    #[serde(rename = "item.started")]
    ItemStarted { item: CodexItem },

    #[serde(rename = "item.completed")]
    ItemCompleted { item: CodexItem },

    #[serde(rename = "turn.completed")]
    TurnCompleted {
        #[serde(default)]
        usage: Option<TurnUsage>,
    },

    #[serde(rename = "turn.failed")]
    TurnFailed {
        #[serde(default)]
        error: Option<ErrorInfo>,
    },

    /// Out-of-band error report; the turn may still fail or complete afterwards.
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: Option<String>,
    },

    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TurnUsage {
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub cached_input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorInfo {
    #[serde(default)]
    pub message: Option<String>,
}

/// The `item` payload of `item.started` / `item.completed`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CodexItem {
    AgentMessage {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        content: Vec<Value>,
    },
    Reasoning {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        content: Vec<Value>,
    },
    CommandExecution {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        command: Value,
        #[serde(default)]
        aggregated_output: Option<String>,
        #[serde(default)]
        exit_code: Option<i64>,
        #[serde(default)]
        status: Option<String>,
    },
    FileChange {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        file_path: Option<String>,
        #[serde(default)]
        action: Option<String>,
        #[serde(default)]
        changes: Vec<FileChangeEntry>,
    },
    McpToolCall {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        server: Option<String>,
        #[serde(default)]
        tool: Option<String>,
        #[serde(default)]
        arguments: Value,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<Value>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileChangeEntry {
    pub path: String,
    #[serde(default)]
    pub kind: Option<Value>,
}

/// Text of an agent message or reasoning item.
///
/// Newer CLIs put it in `text`; older ones use a list of content blocks.
pub fn item_text(text: Option<&str>, content: &[Value]) -> String {
    if let Some(text) = text.filter(|t| !t.is_empty()) {
        return text.to_string();
    }
    content
        .iter()
        .filter_map(|block| {
            let kind = block.get("type").and_then(Value::as_str).unwrap_or("text");
            if kind == "text" || kind == "output_text" {
                block.get("text").and_then(Value::as_str)
            } else {
                None
            }
        })
        .collect()
}

/// Render a command that may be a plain string or an argv array.
pub fn command_string(command: &Value) -> String {
    match command {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .map(|p| p.as_str().map(str::to_string).unwrap_or_else(|| p.to_string()))
            .collect::<Vec<_>>()
            .join(" "),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_thread_started() {
        let json =
            r#"{"type":"thread.started","thread_id":"019c21ae-c46c-7a40-a5f5-36ab53521a27"}"#;
        match serde_json::from_str::<CodexEvent>(json).unwrap() {
            CodexEvent::ThreadStarted { thread_id } => {
                assert_eq!(thread_id, "019c21ae-c46c-7a40-a5f5-36ab53521a27");
            }
            other => panic!("Expected ThreadStarted event, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_turn_failed() {
        let json =
            r#"{"type":"turn.failed","error":{"message":"unexpected status 401 Unauthorized: "}}"#;
        match serde_json::from_str::<CodexEvent>(json).unwrap() {
            CodexEvent::TurnFailed { error } => {
                assert!(error.unwrap().message.unwrap().contains("401 Unauthorized"));
            }
            other => panic!("Expected TurnFailed event, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_event_and_item_types_are_tolerated() {
        let event: CodexEvent = serde_json::from_str(r#"{"type":"turn.started"}"#).unwrap();
        assert!(matches!(event, CodexEvent::Unknown));

        let event: CodexEvent = serde_json::from_str(
            r#"{"type":"item.completed","item":{"id":"i1","type":"web_search","query":"x"}}"#,
        )
        .unwrap();
        assert!(matches!(
            event,
            CodexEvent::ItemCompleted {
                item: CodexItem::Other
            }
        ));
    }

    #[test]
    fn test_parse_turn_completed_usage() {
        let json = r#"{"type":"turn.completed","usage":{"input_tokens":100,"cached_input_tokens":20,"output_tokens":50}}"#;
        match serde_json::from_str::<CodexEvent>(json).unwrap() {
            CodexEvent::TurnCompleted { usage } => {
                let usage = usage.unwrap();
                assert_eq!(usage.input_tokens, Some(100));
                assert_eq!(usage.output_tokens, Some(50));
            }
            other => panic!("Expected TurnCompleted event, got {:?}", other),
        }
    }

    #[test]
    fn item_text_prefers_text_field_then_content_blocks() {
        assert_eq!(item_text(Some("hi"), &[]), "hi");
        let blocks = vec![
            json!({"type": "text", "text": "a"}),
            json!({"type": "image", "url": "x"}),
            json!({"type": "output_text", "text": "b"}),
        ];
        assert_eq!(item_text(None, &blocks), "ab");
        assert_eq!(item_text(Some(""), &blocks), "ab");
    }

    #[test]
    fn command_string_joins_argv() {
        assert_eq!(command_string(&json!("ls -la")), "ls -la");
        assert_eq!(command_string(&json!(["bash", "-lc", "ls"])), "bash -lc ls");
        assert_eq!(command_string(&Value::Null), "");
    }

    #[test]
    fn exec_args_include_schema_and_resume() {
        let config = CodexConfig {
            cli_path: "codex".into(),
            launcher_args: vec!["wrapper.sh".into()],
            model: "gpt-test".into(),
            sandbox: "danger-full-access".into(),
            terminate_grace: DEFAULT_TERMINATE_GRACE,
        };
        let args = config.exec_args(
            Path::new("/work"),
            Some(Path::new("/tmp/schema.json")),
            Some("th_prev"),
        );
        let args: Vec<String> = args
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args[0], "wrapper.sh");
        assert_eq!(args[1], "exec");
        let model_at = args.iter().position(|a| a == "--model").unwrap();
        assert_eq!(args[model_at + 1], "gpt-test");
        let cd_at = args.iter().position(|a| a == "--cd").unwrap();
        assert_eq!(args[cd_at + 1], "/work");
        let schema_at = args.iter().position(|a| a == "--output-schema").unwrap();
        assert_eq!(args[schema_at + 1], "/tmp/schema.json");
        assert_eq!(&args[args.len() - 2..], ["resume", "th_prev"]);
    }

    #[test]
    fn exec_args_without_extras() {
        let config = CodexConfig::default();
        let args = config.exec_args(Path::new("/work"), None, None);
        assert!(!args.iter().any(|a| a == "--output-schema"));
        assert!(!args.iter().any(|a| a == "resume"));
    }
}
