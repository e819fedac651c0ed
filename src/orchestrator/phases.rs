//! The individual workflow phases.
//!
//! Each phase asks the [`BackendProvider`] for a fresh backend, so no two
//! turns ever share transport state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::feedback::{self, FeedbackItem, FEEDBACK_SCHEMA};
use super::verdict::detect_test_success;
use super::{PhaseBackends, PhaseError, REVIEW_OUTPUT_FILE};
use crate::backend::events::ContinuationToken;
use crate::backend::registry::BackendProvider;
use crate::backend::{Backend, BackendError, BackendKind};
use crate::runner::{AgentRunner, ProgressCallback, RunOptions, RunnerError};

pub const COMMIT_SKILL: &str = "beagle:commit-push";

const TEST_PROMPT: &str = "Run the project's test suite. Report if tests pass or fail.";
const TEST_FIX_PROMPT: &str = "The tests failed. Analyze the failures and fix them.";

fn review_prompt(skill_invocation: &str) -> String {
    format!(
        "{}\n\nWrite the full review output to {} in the project root.\n",
        skill_invocation, REVIEW_OUTPUT_FILE
    )
}

fn parse_prompt() -> String {
    format!(
        r#"Read the review output file at {}.

Extract ONLY actionable issues that need fixing. Skip these sections entirely:
- "Good Patterns" or "Strengths"
- "Summary" sections
- Any positive observations

Return the issues as JSON in this shape:
{{"issues": [{{"id": 1, "description": "Brief description of the issue", "file": "path/to/file.py", "line": 42}}]}}

If there are no actionable issues, return {{"issues": []}}.

Output ONLY the JSON, no other text.
"#,
        REVIEW_OUTPUT_FILE
    )
}

fn fix_prompt(item: &FeedbackItem) -> String {
    let line = item
        .line_number
        .map(|l| l.to_string())
        .unwrap_or_else(|| "Unknown".to_string());
    let file = if item.file_path.is_empty() {
        "Unknown file"
    } else {
        item.file_path.as_str()
    };
    format!(
        "Fix this issue:\n{}\n\nFile: {}\nLine: {}\n\nMake the minimal change needed.\n",
        item.description, file, line
    )
}

fn commit_prompt(skill_invocation: &str, fixed: &[FeedbackItem]) -> String {
    let mut prompt = skill_invocation.to_string();
    if !fixed.is_empty() {
        prompt.push_str("\n\nThe following review issues were fixed:\n");
        for item in fixed {
            prompt.push_str(&format!("- {}\n", item));
        }
    }
    prompt
}

/// Result of fixing one feedback item.
#[derive(Debug, Clone)]
pub struct FixOutcome {
    pub item: FeedbackItem,
    pub success: bool,
    pub error: Option<String>,
}

/// Items whose fix succeeded, in their original order.
pub fn successful_items(outcomes: &[FixOutcome]) -> Vec<FeedbackItem> {
    outcomes
        .iter()
        .filter(|o| o.success)
        .map(|o| o.item.clone())
        .collect()
}

/// What to do after a failed test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealAction {
    /// Run the tests again unchanged.
    Retry,
    /// Ask the agent to fix the failures, then run the tests again.
    FixAndRetry,
    /// Treat the run as passed.
    Ignore,
    /// Give up; the tests count as failed.
    Abort,
}

/// Decides how to react to a failed test run.
#[async_trait]
pub trait TestHealPolicy: Send + Sync {
    /// `retries` is how many retries have already been spent.
    async fn decide(&self, retries: u32, test_output: &str) -> HealAction;
}

/// Fix and retry up to `max_retries` times, then abort.
#[derive(Debug, Clone, Copy)]
pub struct AutoHeal {
    pub max_retries: u32,
}

#[async_trait]
impl TestHealPolicy for AutoHeal {
    async fn decide(&self, retries: u32, _test_output: &str) -> HealAction {
        if retries < self.max_retries {
            HealAction::FixAndRetry
        } else {
            HealAction::Abort
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestOutcome {
    pub passed: bool,
    pub retries: u32,
}

/// Shared state every phase needs.
#[derive(Clone)]
pub struct Phases {
    runner: AgentRunner,
    provider: Arc<dyn BackendProvider>,
    backends: PhaseBackends,
    cwd: PathBuf,
    fix_concurrency: usize,
}

impl Phases {
    pub fn new(
        runner: AgentRunner,
        provider: Arc<dyn BackendProvider>,
        backends: PhaseBackends,
        cwd: PathBuf,
        fix_concurrency: usize,
    ) -> Self {
        Self {
            runner,
            provider,
            backends,
            cwd,
            fix_concurrency: fix_concurrency.max(1),
        }
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    fn backend(&self, kind: BackendKind) -> Arc<dyn Backend> {
        self.provider.create(kind)
    }

    /// Run the review skill; the agent writes its findings to the review file.
    pub async fn review(&self, skill: &str) -> Result<(), PhaseError> {
        let backend = self.backend(self.backends.review);
        info!(backend = %backend.kind(), skill = %skill, "Running review");
        let prompt = review_prompt(&backend.format_skill_invocation(skill, None));
        self.runner
            .run(backend, &self.cwd, &prompt, RunOptions::default())
            .await?;

        let output_path = self.cwd.join(REVIEW_OUTPUT_FILE);
        if output_path.exists() {
            info!("Review output written to {}", output_path.display());
        } else {
            warn!("Review output file was not created");
        }
        Ok(())
    }

    /// Turn the review file into feedback items.
    pub async fn parse_feedback(&self) -> Result<Vec<FeedbackItem>, PhaseError> {
        let backend = self.backend(self.backends.review);
        info!(backend = %backend.kind(), "Parsing feedback");
        let options = RunOptions::default().with_schema(FEEDBACK_SCHEMA.clone());
        let output = self
            .runner
            .run(backend, &self.cwd, &parse_prompt(), options)
            .await?;

        match feedback::from_output(&output.output) {
            Ok(items) => {
                info!("Found {} actionable issues", items.len());
                Ok(items)
            }
            Err(e) => {
                error!("Error parsing feedback: {}", e);
                Err(e)
            }
        }
    }

    /// Fix every item, each in its own turn on its own backend.
    ///
    /// At most `fix_concurrency` turns run at once. A failing item does not
    /// stop the others; outcomes come back in item order. Once the run is
    /// cancelled, queued items are not started, and the cancellation is
    /// returned as an error after every task has finished. Dropping the
    /// returned future aborts the tasks.
    pub async fn fix_all(&self, items: &[FeedbackItem]) -> Result<Vec<FixOutcome>, PhaseError> {
        let total = items.len();
        info!(
            count = total,
            concurrency = self.fix_concurrency,
            "Applying fixes"
        );
        let semaphore = Arc::new(Semaphore::new(self.fix_concurrency));
        let active = self.runner.active().clone();

        let mut tasks = JoinSet::new();
        for (index, item) in items.iter().cloned().enumerate() {
            let phases = self.clone();
            let semaphore = Arc::clone(&semaphore);
            let active = active.clone();
            // One view cannot show several turns; use status lines instead.
            let progress = (total > 1).then(|| item_progress(&item));
            tasks.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = active.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                let result = match permit {
                    Some(_permit) if !active.is_cancelled() => {
                        info!(item = %item.id, "Fixing {}/{}: {}", index + 1, total, item.description);
                        phases.fix_one(&item, progress).await
                    }
                    _ => Err(RunnerError::Backend(BackendError::Cancelled)),
                };
                (index, item, result)
            });
        }

        let mut slots: Vec<Option<FixOutcome>> = vec![None; total];
        let mut cancelled = false;
        let mut task_error: Option<String> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, item, Ok(()))) => {
                    info!(item = %item.id, "Fix applied");
                    slots[index] = Some(FixOutcome {
                        item,
                        success: true,
                        error: None,
                    });
                }
                Ok((index, item, Err(e))) => {
                    if e.is_cancellation() {
                        cancelled = true;
                        debug!(item = %item.id, "Fix cancelled");
                    } else {
                        warn!(item = %item.id, "Fix failed: {}", e);
                    }
                    slots[index] = Some(FixOutcome {
                        item,
                        success: false,
                        error: Some(e.to_string()),
                    });
                }
                Err(join_error) => {
                    warn!("Fix task failed: {}", join_error);
                    task_error = Some(join_error.to_string());
                }
            }
        }

        if cancelled {
            return Err(PhaseError::Runner(RunnerError::Backend(
                BackendError::Cancelled,
            )));
        }

        // A panicked task leaves its slot empty.
        let outcomes = slots
            .into_iter()
            .zip(items)
            .map(|(slot, item)| {
                slot.unwrap_or_else(|| FixOutcome {
                    item: item.clone(),
                    success: false,
                    error: Some(
                        task_error
                            .clone()
                            .unwrap_or_else(|| "fix task failed".to_string()),
                    ),
                })
            })
            .collect();
        Ok(outcomes)
    }

    async fn fix_one(
        &self,
        item: &FeedbackItem,
        progress: Option<ProgressCallback>,
    ) -> Result<(), RunnerError> {
        let backend = self.backend(self.backends.fix);
        let mut options = RunOptions::default();
        if let Some(progress) = progress {
            options = options.with_progress(progress);
        }
        self.runner
            .run(backend, &self.cwd, &fix_prompt(item), options)
            .await
            .map(|_| ())
    }

    /// Run the tests, healing failures as `policy` decides.
    ///
    /// All turns share one backend, each resuming from the previous turn's
    /// continuation token.
    pub async fn test_and_heal(
        &self,
        policy: &dyn TestHealPolicy,
    ) -> Result<TestOutcome, PhaseError> {
        let backend = self.backend(self.backends.test);
        let mut continuation: Option<ContinuationToken> = None;
        let mut retries = 0u32;

        loop {
            if retries > 0 {
                info!(backend = %backend.kind(), "Test retry {}", retries);
            } else {
                info!(backend = %backend.kind(), "Running test suite");
            }

            let run = self
                .runner
                .run(
                    Arc::clone(&backend),
                    &self.cwd,
                    TEST_PROMPT,
                    RunOptions::default().with_continuation(continuation.take()),
                )
                .await?;
            continuation = run.continuation;
            let output = run.output.as_text().unwrap_or_default().to_string();

            if detect_test_success(&output) {
                info!("Tests passed");
                return Ok(TestOutcome {
                    passed: true,
                    retries,
                });
            }

            warn!("Tests may have failed or result is unclear");
            match policy.decide(retries, &output).await {
                HealAction::Retry => {
                    retries += 1;
                }
                HealAction::FixAndRetry => {
                    info!("Launching agent to fix test failures");
                    let fix = self
                        .runner
                        .run(
                            Arc::clone(&backend),
                            &self.cwd,
                            TEST_FIX_PROMPT,
                            RunOptions::default().with_continuation(continuation.take()),
                        )
                        .await?;
                    continuation = fix.continuation;
                    retries += 1;
                }
                HealAction::Ignore => {
                    warn!("Ignoring test failures, continuing");
                    return Ok(TestOutcome {
                        passed: true,
                        retries,
                    });
                }
                HealAction::Abort => {
                    error!("Giving up on failing tests after {} retries", retries);
                    return Ok(TestOutcome {
                        passed: false,
                        retries,
                    });
                }
            }
        }
    }

    /// Commit and push, describing only the items that were fixed.
    pub async fn commit(&self, fixed: &[FeedbackItem]) -> Result<(), PhaseError> {
        let backend = self.backend(self.backends.fix);
        info!(backend = %backend.kind(), "Running commit-push skill");
        let prompt = commit_prompt(&backend.format_skill_invocation(COMMIT_SKILL, None), fixed);
        self.runner
            .run(backend, &self.cwd, &prompt, RunOptions::default())
            .await?;
        info!("Commit and push complete");
        Ok(())
    }
}

fn item_progress(item: &FeedbackItem) -> ProgressCallback {
    let id = item.id.clone();
    Arc::new(move |status: &str| info!(item = %id, "{}", status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{ScriptedProvider, Turn};
    use crate::backend::ExecuteRequest;
    use crate::runner::ActiveBackends;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    fn backends(kind: BackendKind) -> PhaseBackends {
        PhaseBackends {
            review: kind,
            fix: kind,
            test: kind,
        }
    }

    fn phases(dir: &Path, provider: Arc<ScriptedProvider>, concurrency: usize) -> Phases {
        Phases::new(
            AgentRunner::new(ActiveBackends::new()),
            provider,
            backends(BackendKind::Claude),
            dir.to_path_buf(),
            concurrency,
        )
    }

    fn item(id: u32) -> FeedbackItem {
        FeedbackItem {
            id: id.to_string(),
            description: format!("issue number {}", id),
            file_path: format!("src/file{}.py", id),
            line_number: Some(id as u64),
        }
    }

    #[tokio::test]
    async fn review_invokes_skill_and_tolerates_missing_file() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(ScriptedProvider::new(|_| Turn::text("reviewed")));
        let phases = phases(dir.path(), provider.clone(), 4);

        phases.review("beagle:review-python").await.unwrap();

        let prompts = provider.all_prompts();
        assert!(prompts[0].starts_with("/beagle:review-python\n"));
        assert!(prompts[0].contains(REVIEW_OUTPUT_FILE));
    }

    #[tokio::test]
    async fn parse_requests_schema_and_returns_items() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(ScriptedProvider::new(|request: &ExecuteRequest| {
            assert!(request.output_schema.is_some());
            Turn::structured(json!({"issues": [
                {"id": 1, "description": "a", "file": "a.py", "line": 1},
                {"id": 2, "description": "b", "file": "b.py", "line": 2}
            ]}))
        }));
        let phases = phases(dir.path(), provider, 4);
        let items = phases.parse_feedback().await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].file_path, "b.py");
    }

    #[tokio::test]
    async fn parse_falls_back_to_text() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(ScriptedProvider::new(|_| {
            Turn::text("```json\n[{\"id\": 7, \"description\": \"x\", \"file\": \"x.py\", \"line\": 3}]\n```")
        }));
        let items = phases(dir.path(), provider, 4).parse_feedback().await.unwrap();
        assert_eq!(items[0].id, "7");
    }

    #[tokio::test]
    async fn parse_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(ScriptedProvider::new(|_| Turn::text("no json at all")));
        let err = phases(dir.path(), provider, 4)
            .parse_feedback()
            .await
            .unwrap_err();
        assert!(matches!(err, PhaseError::FeedbackParse(_)));
    }

    #[tokio::test]
    async fn parallel_fix_isolates_failures() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(ScriptedProvider::new(|request: &ExecuteRequest| {
            if request.prompt.contains("issue number 2") || request.prompt.contains("issue number 4")
            {
                Turn::failure("agent crashed")
            } else {
                Turn::text("fixed")
            }
        }));
        let phases = phases(dir.path(), provider.clone(), 4);
        let items: Vec<FeedbackItem> = (1..=5).map(item).collect();

        let outcomes = phases.fix_all(&items).await.unwrap();

        assert_eq!(outcomes.len(), 5);
        let ids: Vec<&str> = outcomes.iter().map(|o| o.item.id.as_str()).collect();
        assert_eq!(ids, ["1", "2", "3", "4", "5"]);
        assert!(!outcomes[1].success);
        assert!(outcomes[1].error.as_deref().unwrap().contains("agent crashed"));

        let fixed: Vec<String> = successful_items(&outcomes)
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(fixed, ["1", "3", "5"]);

        // Every item ran on its own backend.
        assert_eq!(provider.created_count(), 5);
    }

    /// Provider whose turns sleep briefly while counting concurrent turns.
    struct CountingProvider {
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    struct SleepyBackend {
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Backend for SleepyBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Codex
        }

        fn execute(&self, _request: ExecuteRequest) -> crate::backend::EventStream<'_> {
            Box::pin(async_stream::stream! {
                let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.current.fetch_sub(1, Ordering::SeqCst);
                yield Ok::<_, crate::backend::BackendError>(
                    crate::backend::events::AgentEvent::Result {
                        structured_output: None,
                        continuation: None,
                    },
                );
            })
        }

        async fn cancel(&self) {}

        fn format_skill_invocation(&self, skill_key: &str, _args: Option<&str>) -> String {
            skill_key.to_string()
        }
    }

    impl BackendProvider for CountingProvider {
        fn create(&self, _kind: BackendKind) -> Arc<dyn Backend> {
            Arc::new(SleepyBackend {
                current: Arc::clone(&self.current),
                peak: Arc::clone(&self.peak),
            })
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn fix_concurrency_is_bounded() {
        let dir = TempDir::new().unwrap();
        let peak = Arc::new(AtomicUsize::new(0));
        let provider = Arc::new(CountingProvider {
            current: Arc::new(AtomicUsize::new(0)),
            peak: Arc::clone(&peak),
        });
        let phases = Phases::new(
            AgentRunner::new(ActiveBackends::new()),
            provider,
            backends(BackendKind::Codex),
            dir.path().to_path_buf(),
            2,
        );
        let items: Vec<FeedbackItem> = (1..=6).map(item).collect();
        let outcomes = phases.fix_all(&items).await.unwrap();
        assert!(outcomes.iter().all(|o| o.success));
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    /// Backends whose turns wait until their own cancel(), counting how many
    /// turns start and how many are torn down.
    #[derive(Default)]
    struct WaitingProvider {
        executes: Arc<AtomicUsize>,
        dropped: Arc<AtomicUsize>,
    }

    struct WaitingBackend {
        cancel: tokio_util::sync::CancellationToken,
        executes: Arc<AtomicUsize>,
        dropped: Arc<AtomicUsize>,
    }

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Backend for WaitingBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Codex
        }

        fn execute(&self, _request: ExecuteRequest) -> crate::backend::EventStream<'_> {
            self.executes.fetch_add(1, Ordering::SeqCst);
            let counter = DropCounter(Arc::clone(&self.dropped));
            Box::pin(async_stream::stream! {
                let _counter = counter;
                self.cancel.cancelled().await;
                yield Err::<crate::backend::events::AgentEvent, _>(
                    crate::backend::BackendError::Cancelled,
                );
            })
        }

        async fn cancel(&self) {
            self.cancel.cancel();
        }

        fn format_skill_invocation(&self, skill_key: &str, _args: Option<&str>) -> String {
            skill_key.to_string()
        }
    }

    impl BackendProvider for WaitingProvider {
        fn create(&self, _kind: BackendKind) -> Arc<dyn Backend> {
            Arc::new(WaitingBackend {
                cancel: tokio_util::sync::CancellationToken::new(),
                executes: Arc::clone(&self.executes),
                dropped: Arc::clone(&self.dropped),
            })
        }
    }

    fn waiting_phases(dir: &Path, active: &ActiveBackends) -> (Phases, Arc<WaitingProvider>) {
        let provider = Arc::new(WaitingProvider::default());
        let phases = Phases::new(
            AgentRunner::new(active.clone()),
            provider.clone(),
            backends(BackendKind::Codex),
            dir.to_path_buf(),
            2,
        );
        (phases, provider)
    }

    async fn wait_for_running(active: &ActiveBackends, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while active.len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_all_stops_running_and_queued_fixes() {
        let dir = TempDir::new().unwrap();
        let active = ActiveBackends::new();
        let (phases, provider) = waiting_phases(dir.path(), &active);
        let items: Vec<FeedbackItem> = (1..=6).map(item).collect();
        let task = tokio::spawn(async move { phases.fix_all(&items).await });

        wait_for_running(&active, 2).await;
        assert_eq!(active.cancel_all().await, 2);

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ref e) if e.is_cancellation()));
        assert_eq!(provider.executes.load(Ordering::SeqCst), 2);
        assert!(active.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropping_fix_all_aborts_its_turns() {
        let dir = TempDir::new().unwrap();
        let active = ActiveBackends::new();
        let (phases, provider) = waiting_phases(dir.path(), &active);
        let items: Vec<FeedbackItem> = (1..=4).map(item).collect();
        let task = tokio::spawn(async move { phases.fix_all(&items).await });

        wait_for_running(&active, 2).await;
        task.abort();

        tokio::time::timeout(Duration::from_secs(5), async {
            while provider.dropped.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        wait_for_running_to_clear(&active).await;
        assert_eq!(provider.executes.load(Ordering::SeqCst), 2);
    }

    async fn wait_for_running_to_clear(active: &ActiveBackends) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !active.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_heal_threads_continuation_on_one_backend() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&calls);
        let provider = Arc::new(ScriptedProvider::new(move |_request: &ExecuteRequest| {
            let mut n = counter.lock().unwrap();
            *n += 1;
            let token = crate::backend::events::ContinuationToken::new(
                BackendKind::Codex,
                json!({"thread_id": format!("t{}", n)}),
            );
            match *n {
                1 => Turn::text_with("2 failed, 3 passed", Some(token)),
                2 => Turn::text_with("Fixed the failing assertions", Some(token)),
                _ => Turn::text_with("All 5 tests passed", Some(token)),
            }
        }));
        let phases = phases(dir.path(), provider.clone(), 4);

        let outcome = phases
            .test_and_heal(&AutoHeal { max_retries: 2 })
            .await
            .unwrap();
        assert_eq!(
            outcome,
            TestOutcome {
                passed: true,
                retries: 1
            }
        );

        assert_eq!(provider.created_count(), 1);
        let created = provider.created.lock().unwrap();
        let requests = created[0].1.requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].continuation, None);
        assert_eq!(
            requests[1].continuation.as_ref().unwrap().get_str("thread_id"),
            Some("t1")
        );
        assert_eq!(requests[1].prompt, TEST_FIX_PROMPT);
        assert_eq!(
            requests[2].continuation.as_ref().unwrap().get_str("thread_id"),
            Some("t2")
        );
    }

    #[tokio::test]
    async fn auto_heal_gives_up_after_max_retries() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(ScriptedProvider::new(|_| Turn::text("1 failed")));
        let outcome = phases(dir.path(), provider.clone(), 4)
            .test_and_heal(&AutoHeal { max_retries: 2 })
            .await
            .unwrap();
        assert_eq!(
            outcome,
            TestOutcome {
                passed: false,
                retries: 2
            }
        );
        // test, fix, test, fix, test
        assert_eq!(provider.all_prompts().len(), 5);
    }

    struct Scripted(Mutex<Vec<HealAction>>);

    #[async_trait]
    impl TestHealPolicy for Scripted {
        async fn decide(&self, _retries: u32, _output: &str) -> HealAction {
            self.0.lock().unwrap().remove(0)
        }
    }

    #[tokio::test]
    async fn retry_then_ignore_counts_as_passed() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(ScriptedProvider::new(|_| Turn::text("unclear")));
        let policy = Scripted(Mutex::new(vec![HealAction::Retry, HealAction::Ignore]));
        let outcome = phases(dir.path(), provider.clone(), 4)
            .test_and_heal(&policy)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            TestOutcome {
                passed: true,
                retries: 1
            }
        );
        assert!(provider.all_prompts().iter().all(|p| p == TEST_PROMPT));
    }

    #[tokio::test]
    async fn commit_lists_only_fixed_items() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(ScriptedProvider::new(|_| Turn::text("pushed")));
        let phases = phases(dir.path(), provider.clone(), 4);
        phases.commit(&[item(1), item(3)]).await.unwrap();

        let prompt = &provider.all_prompts()[0];
        assert!(prompt.starts_with("/beagle:commit-push"));
        assert!(prompt.contains("issue number 1"));
        assert!(prompt.contains("issue number 3"));
        assert!(!prompt.contains("issue number 2"));
    }

    #[test]
    fn auto_heal_decisions() {
        let policy = AutoHeal { max_retries: 2 };
        assert_eq!(
            tokio_test::block_on(policy.decide(0, "1 failed")),
            HealAction::FixAndRetry
        );
        assert_eq!(
            tokio_test::block_on(policy.decide(1, "1 failed")),
            HealAction::FixAndRetry
        );
        assert_eq!(
            tokio_test::block_on(policy.decide(2, "1 failed")),
            HealAction::Abort
        );
        let never = AutoHeal { max_retries: 0 };
        assert_eq!(tokio_test::block_on(never.decide(0, "")), HealAction::Abort);
    }

    #[test]
    fn fix_prompt_handles_unknown_location() {
        let prompt = fix_prompt(&FeedbackItem {
            id: "1".into(),
            description: "Tidy".into(),
            file_path: String::new(),
            line_number: None,
        });
        assert!(prompt.contains("File: Unknown file"));
        assert!(prompt.contains("Line: Unknown"));
    }
}
