use std::sync::Arc;

use super::claudecode::client::ClaudeCodeConfig;
use super::claudecode::ClaudeBackend;
use super::codex::client::CodexConfig;
use super::codex::CodexBackend;
use super::{Backend, BackendKind};

/// Source of backend instances.
///
/// Every call returns a fresh instance, so callers that run turns in
/// parallel never share transport state.
pub trait BackendProvider: Send + Sync {
    fn create(&self, kind: BackendKind) -> Arc<dyn Backend>;
}

#[derive(Debug, Clone)]
pub struct BackendInfo {
    pub kind: BackendKind,
    pub model: String,
    pub cli_path: String,
}

/// Builds real backends from per-kind configuration.
#[derive(Debug, Clone, Default)]
pub struct BackendRegistry {
    claude: ClaudeCodeConfig,
    codex: CodexConfig,
}

impl BackendRegistry {
    pub fn new(claude: ClaudeCodeConfig, codex: CodexConfig) -> Self {
        Self { claude, codex }
    }

    /// Override the model of one backend kind. Model names are not portable
    /// between CLIs, so each kind is set separately.
    pub fn with_model(mut self, kind: BackendKind, model: Option<&str>) -> Self {
        if let Some(model) = model.map(str::trim).filter(|m| !m.is_empty()) {
            match kind {
                BackendKind::Claude => self.claude.model = model.to_string(),
                BackendKind::Codex => self.codex.model = model.to_string(),
            }
        }
        self
    }

    pub fn info(&self, kind: BackendKind) -> BackendInfo {
        match kind {
            BackendKind::Claude => BackendInfo {
                kind,
                model: self.claude.model.clone(),
                cli_path: self.claude.cli_path.clone(),
            },
            BackendKind::Codex => BackendInfo {
                kind,
                model: self.codex.model.clone(),
                cli_path: self.codex.cli_path.clone(),
            },
        }
    }

    pub fn list(&self) -> Vec<BackendInfo> {
        [BackendKind::Claude, BackendKind::Codex]
            .into_iter()
            .map(|kind| self.info(kind))
            .collect()
    }
}

impl BackendProvider for BackendRegistry {
    fn create(&self, kind: BackendKind) -> Arc<dyn Backend> {
        match kind {
            BackendKind::Claude => Arc::new(ClaudeBackend::with_config(self.claude.clone())),
            BackendKind::Codex => Arc::new(CodexBackend::with_config(self.codex.clone())),
        }
    }
}
