//! Process plumbing shared by the Codex subprocess backend and the Claude Code
//! session transport.
//!
//! Both spawn an agent CLI, speak NDJSON over its stdio, and must be able to
//! stop it from outside the task that is reading its output.

use std::collections::VecDeque;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::BackendError;

/// Grace window between SIGTERM and SIGKILL.
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Number of stderr lines kept for failure messages.
const STDERR_TAIL_LINES: usize = 20;

const LOG_LINE_LIMIT: usize = 200;

/// Slot holding the currently running CLI process.
///
/// The reading side installs the child and reaps it when output ends; the
/// cancelling side takes it out and terminates it. Whoever takes the child
/// first owns it, so the process is reaped exactly once.
#[derive(Clone, Default)]
pub struct ProcessSlot {
    child: Arc<Mutex<Option<Child>>>,
}

impl ProcessSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn install(&self, child: Child) {
        let mut slot = self.child.lock().await;
        if slot.is_some() {
            warn!("Replacing a CLI process that was never reaped");
        }
        *slot = Some(child);
    }

    pub async fn is_running(&self) -> bool {
        self.child.lock().await.is_some()
    }

    /// Take the child out and wait for it to exit.
    ///
    /// Returns `None` if the process was already taken (e.g. by `terminate`).
    pub async fn reap(&self) -> Option<std::io::Result<ExitStatus>> {
        let child = self.child.lock().await.take();
        match child {
            Some(mut child) => Some(child.wait().await),
            None => None,
        }
    }

    /// Gracefully stop the process: SIGTERM, then SIGKILL once `grace` expires.
    ///
    /// Returns `false` (and does nothing) when no process is running.
    pub async fn terminate(&self, grace: Duration) -> bool {
        let child = self.child.lock().await.take();
        match child {
            Some(child) => {
                terminate_child(child, grace).await;
                true
            }
            None => false,
        }
    }
}

async fn terminate_child(mut child: Child, grace: Duration) {
    send_sigterm(&mut child);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            info!("CLI process terminated: {}", status);
        }
        Ok(Err(e)) => {
            warn!("Failed to wait for CLI process after SIGTERM: {}", e);
        }
        Err(_) => {
            warn!(
                "CLI process still running {}ms after SIGTERM, killing",
                grace.as_millis()
            );
            if let Err(e) = child.kill().await {
                warn!("Failed to kill CLI process: {}", e);
            } else {
                info!("CLI process killed");
            }
        }
    }
}

impl ProcessSlot {
    /// Guard that terminates whatever is still in the slot when dropped.
    ///
    /// An event stream holds one so that a consumer abandoning the stream
    /// midway does not leave the CLI running.
    pub fn guard(&self, grace: Duration) -> SlotGuard {
        SlotGuard {
            slot: self.clone(),
            grace,
        }
    }
}

pub struct SlotGuard {
    slot: ProcessSlot,
    grace: Duration,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        // Take the child synchronously so a later turn on the same backend
        // cannot be hit by this cleanup. A failed try_lock means `terminate`
        // already holds the slot.
        let Ok(mut slot) = self.slot.child.try_lock() else {
            return;
        };
        let Some(child) = slot.take() else {
            return;
        };
        let grace = self.grace;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("Terminating CLI process left behind by a dropped event stream");
                handle.spawn(terminate_child(child, grace));
            }
            // No runtime: dropping the child kills it (kill_on_drop).
            Err(_) => drop(child),
        }
    }
}

#[cfg(unix)]
fn send_sigterm(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: `pid` belongs to a child we own and have not reaped yet.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            warn!(
                "SIGTERM to pid {} failed: {}",
                pid,
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        warn!("Failed to stop CLI process: {}", e);
    }
}

/// Spawn `cmd`, mapping failures to a typed error that names the program.
pub fn spawn(cmd: &mut Command, program: &str) -> Result<Child, BackendError> {
    cmd.kill_on_drop(true).spawn().map_err(|source| {
        error!("Failed to spawn {}: {}", program, source);
        BackendError::Spawn {
            program: program.to_string(),
            source,
        }
    })
}

/// Consume stderr so the child never blocks on a full pipe.
///
/// Lines are logged at debug level; the task resolves to the last few lines.
pub fn drain_stderr(stderr: ChildStderr, label: &'static str) -> JoinHandle<String> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
        while let Ok(Some(line)) = lines.next_line().await {
            if line.is_empty() {
                continue;
            }
            debug!("{} stderr: {}", label, line);
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        tail.into_iter().collect::<Vec<_>>().join("\n")
    })
}

/// Shorten a protocol line for logging.
pub fn truncate_for_log(line: &str) -> String {
    if line.chars().count() > LOG_LINE_LIMIT {
        format!("{}...", line.chars().take(LOG_LINE_LIMIT).collect::<String>())
    } else {
        line.to_string()
    }
}

/// Build the error reported when a CLI exits without finishing its turn.
pub fn anomalous_exit(
    program: &str,
    status: Option<std::io::Result<ExitStatus>>,
    last_error: Option<&str>,
    stderr_tail: &str,
) -> BackendError {
    let status = match status {
        Some(Ok(status)) => status.to_string(),
        Some(Err(e)) => format!("unknown status ({})", e),
        None => "terminated".to_string(),
    };
    let mut message = format!("{} exited ({}) before completing the turn", program, status);
    if let Some(detail) = last_error.filter(|s| !s.trim().is_empty()) {
        message.push_str(": ");
        message.push_str(detail.trim());
    } else if !stderr_tail.trim().is_empty() {
        message.push_str(": ");
        message.push_str(stderr_tail.trim());
    }
    BackendError::process_failure(message)
}
