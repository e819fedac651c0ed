//! Review → Parse → Fix → Test workflow.
//!
//! A run is either a single pass over the phases or a continuous loop that
//! repeats the whole cycle until a review comes back clean, the tests fail,
//! or the iteration cap is hit.

pub mod feedback;
pub mod phases;
pub mod verdict;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::backend::registry::BackendProvider;
use crate::backend::BackendKind;
use crate::runner::{AgentRunner, RunnerError};

use self::feedback::FeedbackItem;
use self::phases::{successful_items, AutoHeal, FixOutcome, Phases, TestHealPolicy};

/// File the review skill writes its findings to, relative to the target.
pub const REVIEW_OUTPUT_FILE: &str = ".review-output.md";

#[derive(Debug, Error)]
pub enum PhaseError {
    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("could not parse review feedback: {0}")]
    FeedbackParse(String),

    #[error("target is not a directory: {}", .0.display())]
    InvalidTarget(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PhaseError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Runner(e) if e.is_cancellation())
    }

    /// Name of the missing skill, if that is why the run stopped.
    pub fn missing_capability(&self) -> Option<&str> {
        match self {
            Self::Runner(RunnerError::CapabilityNotAvailable { capability }) => {
                Some(capability.as_str())
            }
            _ => None,
        }
    }
}

/// Backend kind used by each phase. Parse shares the review backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PhaseBackends {
    pub review: BackendKind,
    pub fix: BackendKind,
    pub test: BackendKind,
}

impl PhaseBackends {
    pub fn uniform(kind: BackendKind) -> Self {
        Self {
            review: kind,
            fix: kind,
            test: kind,
        }
    }
}

impl Default for PhaseBackends {
    fn default() -> Self {
        Self::uniform(BackendKind::Claude)
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub target: PathBuf,
    /// Fully qualified skill key, e.g. `beagle:review-python`.
    pub skill: String,
    pub backends: PhaseBackends,
    pub loop_mode: bool,
    pub max_iterations: u32,
    pub fix_concurrency: usize,
    pub max_test_retries: u32,
    pub review_only: bool,
    pub cleanup: bool,
    pub commit: bool,
}

impl RunConfig {
    pub fn new(target: impl Into<PathBuf>, skill: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            skill: skill.into(),
            backends: PhaseBackends::default(),
            loop_mode: false,
            max_iterations: 5,
            fix_concurrency: 4,
            max_test_retries: 2,
            review_only: false,
            cleanup: false,
            commit: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Single pass finished with passing tests.
    Completed,
    /// Single pass finished but the tests still fail.
    TestsFailed,
    ReviewOnly,
    /// Loop stopped because a review found nothing left to fix.
    Converged,
    /// Loop used every iteration and feedback was still outstanding.
    MaxIterationsReached,
    /// Loop stopped because the tests failed in this iteration.
    TestFailure { iteration: u32 },
    /// Every fix attempt failed; later steps were skipped.
    AllFixesFailed,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed | Self::ReviewOnly | Self::Converged)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub skill: String,
    pub target: PathBuf,
    pub feedback_count: usize,
    pub fixes_applied: usize,
    pub fixes_failed: usize,
    pub test_retries: u32,
    pub tests_passed: bool,
    pub iterations_used: u32,
    pub loop_mode: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub summary: RunSummary,
    pub outcome: RunOutcome,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        if self.outcome.is_success() {
            0
        } else {
            1
        }
    }
}

/// How to get a missing skill installed.
pub fn install_hint(skill: &str) -> String {
    if skill.starts_with("beagle:") {
        format!(
            "The Beagle plugin providing '{}' is not installed.\n\
             Install it with:\n  /install-plugin beagle@existential-birds\n\
             or enable it in ~/.claude/settings.json:\n  \
             \"enabledPlugins\": {{ \"beagle@existential-birds\": true }}",
            skill
        )
    } else {
        format!(
            "The plugin providing '{}' is not installed.\n\
             Check the enabled plugins in ~/.claude/settings.json.",
            skill
        )
    }
}

pub struct Orchestrator {
    config: RunConfig,
    phases: Phases,
    heal: Arc<dyn TestHealPolicy>,
}

impl Orchestrator {
    pub fn new(
        config: RunConfig,
        runner: AgentRunner,
        provider: Arc<dyn BackendProvider>,
    ) -> Result<Self, PhaseError> {
        if !config.target.is_dir() {
            return Err(PhaseError::InvalidTarget(config.target.clone()));
        }
        let phases = Phases::new(
            runner,
            provider,
            config.backends,
            config.target.clone(),
            config.fix_concurrency,
        );
        let heal = Arc::new(AutoHeal {
            max_retries: config.max_test_retries,
        });
        Ok(Self {
            config,
            phases,
            heal,
        })
    }

    /// Replace the automatic test-heal policy, e.g. with an interactive one.
    pub fn with_heal_policy(mut self, heal: Arc<dyn TestHealPolicy>) -> Self {
        self.heal = heal;
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub async fn run(&self) -> Result<RunReport, PhaseError> {
        info!(
            dir = %self.config.target.display(),
            skill = %self.config.skill,
            review = %self.config.backends.review,
            fix = %self.config.backends.fix,
            test = %self.config.backends.test,
            loop_mode = self.config.loop_mode,
            "Starting review run"
        );
        if self.config.loop_mode && !self.config.review_only {
            self.run_loop().await
        } else {
            self.run_single().await
        }
    }

    fn summary(&self) -> RunSummary {
        RunSummary {
            skill: self.config.skill.clone(),
            target: self.config.target.clone(),
            tests_passed: true,
            loop_mode: self.config.loop_mode,
            ..RunSummary::default()
        }
    }

    async fn review_and_parse(&self) -> Result<Vec<FeedbackItem>, PhaseError> {
        self.phases.review(&self.config.skill).await?;
        self.phases.parse_feedback().await
    }

    async fn run_single(&self) -> Result<RunReport, PhaseError> {
        let mut summary = self.summary();
        summary.iterations_used = 1;

        let items = self.review_and_parse().await?;
        summary.feedback_count = items.len();

        if self.config.review_only {
            for item in &items {
                info!(item = %item.id, "{}", item);
            }
            info!("Review-only mode, skipping fixes and tests");
            return Ok(RunReport {
                summary,
                outcome: RunOutcome::ReviewOnly,
            });
        }

        let mut fixed = Vec::new();
        if items.is_empty() {
            info!("No actionable issues found, skipping fixes");
        } else {
            let outcomes = self.phases.fix_all(&items).await?;
            record_fixes(&mut summary, &outcomes);
            if summary.fixes_applied == 0 {
                error!("Every fix failed, stopping before tests");
                return Ok(RunReport {
                    summary,
                    outcome: RunOutcome::AllFixesFailed,
                });
            }
            fixed = successful_items(&outcomes);
        }

        let tests = self.phases.test_and_heal(self.heal.as_ref()).await?;
        summary.test_retries = tests.retries;
        summary.tests_passed = tests.passed;
        if !tests.passed {
            return Ok(RunReport {
                summary,
                outcome: RunOutcome::TestsFailed,
            });
        }

        self.finish(&fixed).await?;
        Ok(RunReport {
            summary,
            outcome: RunOutcome::Completed,
        })
    }

    async fn run_loop(&self) -> Result<RunReport, PhaseError> {
        let mut summary = self.summary();
        let cap = self.config.max_iterations.max(1);
        let mut fixed = Vec::new();

        for iteration in 1..=cap {
            summary.iterations_used = iteration;
            info!(iteration, max = cap, "Starting iteration");

            remove_review_output(&self.config.target).await?;
            let items = self.review_and_parse().await?;

            if items.is_empty() {
                info!(iteration, "No issues left, converged");
                self.finish(&fixed).await?;
                return Ok(RunReport {
                    summary,
                    outcome: RunOutcome::Converged,
                });
            }
            summary.feedback_count += items.len();

            let outcomes = self.phases.fix_all(&items).await?;
            let before = summary.fixes_applied;
            record_fixes(&mut summary, &outcomes);
            if summary.fixes_applied == before {
                error!(iteration, "Every fix failed, stopping");
                return Ok(RunReport {
                    summary,
                    outcome: RunOutcome::AllFixesFailed,
                });
            }
            fixed.extend(successful_items(&outcomes));

            let tests = self.phases.test_and_heal(self.heal.as_ref()).await?;
            summary.test_retries += tests.retries;
            summary.tests_passed = tests.passed;
            if !tests.passed {
                error!(iteration, "Tests failed, stopping loop");
                return Ok(RunReport {
                    summary,
                    outcome: RunOutcome::TestFailure { iteration },
                });
            }
        }

        warn!(
            iterations = cap,
            "Reached maximum iterations with feedback outstanding"
        );
        Ok(RunReport {
            summary,
            outcome: RunOutcome::MaxIterationsReached,
        })
    }

    /// Post-steps of a successful run.
    async fn finish(&self, fixed: &[FeedbackItem]) -> Result<(), PhaseError> {
        if self.config.commit && !fixed.is_empty() {
            self.phases.commit(fixed).await?;
        }
        if self.config.cleanup {
            remove_review_output(&self.config.target).await?;
        }
        Ok(())
    }
}

fn record_fixes(summary: &mut RunSummary, outcomes: &[FixOutcome]) {
    let applied = outcomes.iter().filter(|o| o.success).count();
    summary.fixes_applied += applied;
    summary.fixes_failed += outcomes.len() - applied;
}

async fn remove_review_output(target: &Path) -> Result<(), PhaseError> {
    match tokio::fs::remove_file(target.join(REVIEW_OUTPUT_FILE)).await {
        Ok(()) => {
            info!("Removed {}", REVIEW_OUTPUT_FILE);
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
