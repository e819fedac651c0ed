//! Feedback items and their extraction from agent output.

use std::fmt;
use std::sync::{LazyLock, OnceLock};

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use super::PhaseError;
use crate::runner::AgentOutput;

/// Schema requested from the agent during the Parse phase.
pub static FEEDBACK_SCHEMA: LazyLock<Value> = LazyLock::new(|| {
    json!({
        "type": "object",
        "properties": {
            "issues": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "id": { "type": "integer" },
                        "description": { "type": "string" },
                        "file": { "type": "string" },
                        "line": { "type": "integer" }
                    },
                    "required": ["id", "description", "file", "line"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["issues"],
        "additionalProperties": false
    })
});

/// One actionable issue from a review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackItem {
    #[serde(default, deserialize_with = "id_from_number_or_string")]
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "file")]
    pub file_path: String,
    #[serde(default, alias = "line", deserialize_with = "lenient_line")]
    pub line_number: Option<u64>,
}

impl FeedbackItem {
    /// `file:line`, or just the file when no line is known.
    pub fn location(&self) -> String {
        match self.line_number {
            Some(line) => format!("{}:{}", self.file_path, line),
            None => self.file_path.clone(),
        }
    }
}

impl fmt::Display for FeedbackItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} ({})", self.id, self.description, self.location())
    }
}

fn id_from_number_or_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

fn lenient_line<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Feedback items from a runner result, structured or textual.
pub fn from_output(output: &AgentOutput) -> Result<Vec<FeedbackItem>, PhaseError> {
    match output {
        AgentOutput::Structured(value) => items_from_value(value).ok_or_else(|| {
            PhaseError::FeedbackParse(format!(
                "structured output has no issue list: {}",
                truncate(&value.to_string())
            ))
        }),
        AgentOutput::Text(text) => extract_feedback(text),
    }
}

/// Items from `{"issues": [...]}` or a bare array. `None` for any other shape.
pub fn items_from_value(value: &Value) -> Option<Vec<FeedbackItem>> {
    let array = match value {
        Value::Array(items) => items,
        Value::Object(obj) => obj.get("issues")?.as_array()?,
        _ => return None,
    };
    let mut items = Vec::with_capacity(array.len());
    for (index, raw) in array.iter().enumerate() {
        match serde_json::from_value::<FeedbackItem>(raw.clone()) {
            Ok(mut item) => {
                if item.id.is_empty() {
                    item.id = (index + 1).to_string();
                }
                items.push(item);
            }
            Err(e) => {
                debug!("Skipping malformed feedback entry {}: {}", index, e);
            }
        }
    }
    Some(items)
}

fn fenced_block_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"```(?:json)?\s*\n?([\s\S]*?)\n?```").expect("Invalid fenced block regex")
    })
}

fn array_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"\[[\s\S]*?\]").expect("Invalid array regex"))
}

/// Recover feedback items from free text.
///
/// Fenced code blocks are tried first, then bracketed arrays, then the whole
/// text. An empty array means the review found nothing to fix.
pub fn extract_feedback(text: &str) -> Result<Vec<FeedbackItem>, PhaseError> {
    let fenced = fenced_block_regex()
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim());
    let arrays = array_regex().find_iter(text).map(|m| m.as_str());

    for candidate in fenced.chain(arrays) {
        if let Ok(value @ Value::Array(_)) = serde_json::from_str::<Value>(candidate) {
            if let Some(items) = items_from_value(&value) {
                return Ok(items);
            }
        }
    }

    if let Ok(value) = serde_json::from_str::<Value>(text.trim()) {
        if let Some(items) = items_from_value(&value) {
            return Ok(items);
        }
    }

    Err(PhaseError::FeedbackParse(format!(
        "no JSON issue list in agent output: {}",
        truncate(text)
    )))
}

fn truncate(text: &str) -> String {
    const LIMIT: usize = 200;
    let text = text.trim();
    if text.chars().count() > LIMIT {
        format!("{}...", text.chars().take(LIMIT).collect::<String>())
    } else {
        text.to_string()
    }
}
