//! Configuration management for daydream.
//!
//! Configuration can be set via environment variables:
//! - `DAYDREAM_TARGET` - Optional. Project to review. Defaults to the current directory.
//! - `DAYDREAM_SKILL` - Optional. `python`, `frontend` or a full skill key. Defaults to `python`.
//! - `DAYDREAM_BACKEND` - Optional. `claude` or `codex`. Defaults to `claude`.
//! - `DAYDREAM_REVIEW_BACKEND`, `DAYDREAM_FIX_BACKEND`, `DAYDREAM_TEST_BACKEND` - Optional.
//!   Per-phase backend overrides.
//! - `DAYDREAM_MODEL` - Optional. Model override for the `DAYDREAM_BACKEND` kind only.
//! - `DAYDREAM_CLAUDE_MODEL`, `DAYDREAM_CODEX_MODEL` - Optional. Per-kind model overrides.
//!   These win over `DAYDREAM_MODEL`.
//! - `DAYDREAM_LOOP` - Optional. Repeat review/fix/test until clean. Defaults to `false`.
//! - `DAYDREAM_MAX_ITERATIONS` - Optional. Loop cap. Defaults to `5`.
//! - `DAYDREAM_FIX_CONCURRENCY` - Optional. Parallel fixes. Defaults to `4`.
//! - `DAYDREAM_MAX_TEST_RETRIES` - Optional. Automatic test-heal retries. Defaults to `2`.
//! - `DAYDREAM_REVIEW_ONLY` - Optional. Stop after parsing feedback. Defaults to `false`.
//! - `DAYDREAM_CLEANUP` - Optional. Remove the review file after a successful run.
//! - `DAYDREAM_COMMIT` - Optional. Commit and push after the tests pass.
//! - `DAYDREAM_DEBUG` - Optional. Also write a debug log into the target directory.
//! - `DAYDREAM_TERMINATE_GRACE_SECS` - Optional. Seconds between SIGTERM and kill. Defaults to `5`.
//! - `CLAUDE_CLI_PATH`, `CODEX_CLI_PATH` - Optional. Agent executables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::backend::claudecode::client::ClaudeCodeConfig;
use crate::backend::codex::client::CodexConfig;
use crate::backend::registry::BackendRegistry;
use crate::backend::shared::DEFAULT_TERMINATE_GRACE;
use crate::backend::BackendKind;
use crate::orchestrator::{PhaseBackends, RunConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Short skill names and the skills they stand for.
pub const SKILL_ALIASES: &[(&str, &str)] = &[
    ("python", "beagle:review-python"),
    ("frontend", "beagle:review-frontend"),
];

/// Map a short skill name to its full key. Namespaced keys pass through.
pub fn resolve_skill(name: &str) -> Result<String, ConfigError> {
    let name = name.trim();
    if let Some((_, key)) = SKILL_ALIASES.iter().find(|(alias, _)| *alias == name) {
        return Ok(key.to_string());
    }
    match name.split_once(':') {
        Some((namespace, skill)) if !namespace.is_empty() && !skill.is_empty() => {
            Ok(name.to_string())
        }
        _ => Err(ConfigError::InvalidValue(
            "DAYDREAM_SKILL".to_string(),
            format!(
                "unknown skill '{}' (expected python, frontend or namespace:skill)",
                name
            ),
        )),
    }
}

/// Daydream configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Project directory under review
    pub target: PathBuf,

    /// Fully qualified review skill key
    pub skill: String,

    pub backends: PhaseBackends,

    /// Model override for Claude turns
    pub claude_model: Option<String>,

    /// Model override for Codex turns
    pub codex_model: Option<String>,

    pub loop_mode: bool,
    pub max_iterations: u32,
    pub fix_concurrency: usize,
    pub max_test_retries: u32,
    pub review_only: bool,
    pub cleanup: bool,
    pub commit: bool,

    /// Write a debug log file into the target
    pub debug: bool,

    pub claude_cli_path: String,
    pub codex_cli_path: String,
    pub terminate_grace: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for unparseable numbers, booleans,
    /// backend names or skills.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which returns a variable's value if set.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let target = get("DAYDREAM_TARGET")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        let skill = resolve_skill(get("DAYDREAM_SKILL").as_deref().unwrap_or("python"))?;

        let default_backend: BackendKind =
            parse_or("DAYDREAM_BACKEND", get("DAYDREAM_BACKEND"), BackendKind::Claude)?;
        let backends = PhaseBackends {
            review: parse_or(
                "DAYDREAM_REVIEW_BACKEND",
                get("DAYDREAM_REVIEW_BACKEND"),
                default_backend,
            )?,
            fix: parse_or("DAYDREAM_FIX_BACKEND", get("DAYDREAM_FIX_BACKEND"), default_backend)?,
            test: parse_or(
                "DAYDREAM_TEST_BACKEND",
                get("DAYDREAM_TEST_BACKEND"),
                default_backend,
            )?,
        };

        let fix_concurrency: usize =
            parse_or("DAYDREAM_FIX_CONCURRENCY", get("DAYDREAM_FIX_CONCURRENCY"), 4)?;
        if fix_concurrency == 0 {
            return Err(ConfigError::InvalidValue(
                "DAYDREAM_FIX_CONCURRENCY".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let max_iterations: u32 =
            parse_or("DAYDREAM_MAX_ITERATIONS", get("DAYDREAM_MAX_ITERATIONS"), 5)?;
        if max_iterations == 0 {
            return Err(ConfigError::InvalidValue(
                "DAYDREAM_MAX_ITERATIONS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let grace_secs: u64 = parse_or(
            "DAYDREAM_TERMINATE_GRACE_SECS",
            get("DAYDREAM_TERMINATE_GRACE_SECS"),
            DEFAULT_TERMINATE_GRACE.as_secs(),
        )?;

        // Model names only mean something to one CLI, so the shared
        // variable is scoped to the default backend.
        let shared_model = get("DAYDREAM_MODEL");
        let model_for = |kind: BackendKind| {
            let var = match kind {
                BackendKind::Claude => "DAYDREAM_CLAUDE_MODEL",
                BackendKind::Codex => "DAYDREAM_CODEX_MODEL",
            };
            get(var)
                .or_else(|| shared_model.clone().filter(|_| kind == default_backend))
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
        };

        Ok(Self {
            target,
            skill,
            backends,
            claude_model: model_for(BackendKind::Claude),
            codex_model: model_for(BackendKind::Codex),
            loop_mode: parse_bool("DAYDREAM_LOOP", get("DAYDREAM_LOOP"))?,
            max_iterations,
            fix_concurrency,
            max_test_retries: parse_or(
                "DAYDREAM_MAX_TEST_RETRIES",
                get("DAYDREAM_MAX_TEST_RETRIES"),
                2,
            )?,
            review_only: parse_bool("DAYDREAM_REVIEW_ONLY", get("DAYDREAM_REVIEW_ONLY"))?,
            cleanup: parse_bool("DAYDREAM_CLEANUP", get("DAYDREAM_CLEANUP"))?,
            commit: parse_bool("DAYDREAM_COMMIT", get("DAYDREAM_COMMIT"))?,
            debug: parse_bool("DAYDREAM_DEBUG", get("DAYDREAM_DEBUG"))?,
            claude_cli_path: get("CLAUDE_CLI_PATH").unwrap_or_else(|| "claude".to_string()),
            codex_cli_path: get("CODEX_CLI_PATH").unwrap_or_else(|| "codex".to_string()),
            terminate_grace: Duration::from_secs(grace_secs),
        })
    }

    /// Override the target directory, e.g. from the command line.
    pub fn with_target(mut self, target: impl Into<PathBuf>) -> Self {
        self.target = target.into();
        self
    }

    /// Backend factory configured from this config.
    pub fn registry(&self) -> BackendRegistry {
        let claude = ClaudeCodeConfig {
            cli_path: self.claude_cli_path.clone(),
            terminate_grace: self.terminate_grace,
            ..ClaudeCodeConfig::default()
        };
        let codex = CodexConfig {
            cli_path: self.codex_cli_path.clone(),
            terminate_grace: self.terminate_grace,
            ..CodexConfig::default()
        };
        BackendRegistry::new(claude, codex)
            .with_model(BackendKind::Claude, self.claude_model.as_deref())
            .with_model(BackendKind::Codex, self.codex_model.as_deref())
    }

    /// Orchestrator settings derived from this config.
    pub fn run_config(&self) -> RunConfig {
        RunConfig {
            target: self.target.clone(),
            skill: self.skill.clone(),
            backends: self.backends,
            loop_mode: self.loop_mode,
            max_iterations: self.max_iterations,
            fix_concurrency: self.fix_concurrency,
            max_test_retries: self.max_test_retries,
            review_only: self.review_only,
            cleanup: self.cleanup,
            commit: self.commit,
        }
    }
}

fn parse_or<T>(var: &str, value: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(var.to_string(), format!("{}", e))),
        None => Ok(default),
    }
}

fn parse_bool(var: &str, value: Option<String>) -> Result<bool, ConfigError> {
    let Some(raw) = value else {
        return Ok(false);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue(
            var.to_string(),
            format!("expected a boolean, got '{}'", other),
        )),
    }
}
