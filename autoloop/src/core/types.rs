//! Shared deterministic types for the loop core.
//!
//! These types define stable contracts between the agent invoker, the outcome
//! validator and the loop runner. They carry no I/O and serialize with stable,
//! lowercase/kebab-case names so checkpoints and iteration logs stay readable.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Lifecycle of a single plan phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

/// One discrete unit of plan-driven work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    pub id: String,
    /// Plan artifact the prompt is built from. Re-read on every attempt.
    pub plan_path: PathBuf,
    /// Zero-based position in discovery order.
    #[serde(default)]
    pub ordinal: usize,
    #[serde(default)]
    pub status: PhaseStatus,
    /// Tracked issues that must all be closed for the phase to pass.
    #[serde(default)]
    pub issue_ids: Vec<String>,
}

impl Phase {
    pub fn new(id: impl Into<String>, plan_path: impl Into<PathBuf>, ordinal: usize) -> Self {
        Self {
            id: id.into(),
            plan_path: plan_path.into(),
            ordinal,
            status: PhaseStatus::Pending,
            issue_ids: Vec::new(),
        }
    }

    pub fn with_issues(mut self, issue_ids: Vec<String>) -> Self {
        self.issue_ids = issue_ids;
        self
    }
}

/// Why a single agent invocation did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum InvocationFailure {
    /// The agent executable could not be found on `PATH`.
    NotFound,
    /// The agent ran past its timeout and was killed.
    TimeoutExceeded { timeout_secs: u64 },
    /// The agent exited with a non-zero status (`None` when killed by a signal).
    NonzeroExit { code: Option<i32> },
    /// The process could not be started for a reason other than a missing binary.
    SpawnFailed { message: String },
    /// A pause/stop request killed the agent mid-run.
    Interrupted,
}

impl fmt::Display for InvocationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvocationFailure::NotFound => write!(f, "executable-not-found"),
            InvocationFailure::TimeoutExceeded { timeout_secs } => {
                write!(f, "timeout-exceeded after {timeout_secs}s")
            }
            InvocationFailure::NonzeroExit { code: Some(code) } => {
                write!(f, "nonzero-exit (code {code})")
            }
            InvocationFailure::NonzeroExit { code: None } => {
                write!(f, "nonzero-exit (terminated by signal)")
            }
            InvocationFailure::SpawnFailed { message } => write!(f, "spawn-failed: {message}"),
            InvocationFailure::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Outcome of one agent invocation. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInvocationResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
    pub failure: Option<InvocationFailure>,
}

impl AgentInvocationResult {
    pub fn succeeded(stdout: String, stderr: String, elapsed: Duration) -> Self {
        Self {
            success: true,
            stdout,
            stderr,
            elapsed,
            failure: None,
        }
    }

    pub fn failed(
        failure: InvocationFailure,
        stdout: String,
        stderr: String,
        elapsed: Duration,
    ) -> Self {
        Self {
            success: false,
            stdout,
            stderr,
            elapsed,
            failure: Some(failure),
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self.failure, Some(InvocationFailure::Interrupted))
    }

    /// Exit code of the agent, if it exited on its own.
    pub fn exit_code(&self) -> Option<i32> {
        match (&self.failure, self.success) {
            (None, true) => Some(0),
            (Some(InvocationFailure::NonzeroExit { code }), _) => *code,
            _ => None,
        }
    }
}

/// Normalized tracker status. Only "closed"-equivalent terms map to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueState {
    Open,
    Closed,
}

/// An issue as observed through the external tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedIssue {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    /// Status string exactly as reported by the tracker.
    pub raw_status: String,
    pub state: IssueState,
    /// Ids of issues blocking this one.
    #[serde(default)]
    pub blocked_by: Vec<String>,
}

/// Evidence gathered while validating one attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub agent_success: bool,
    /// Issue ids that had to be closed.
    pub issues_checked: Vec<String>,
    /// Subset of `issues_checked` not observed as closed.
    pub open_issues: Vec<String>,
    /// Pending working-tree changes; advisory only.
    pub pending_changes: Option<usize>,
    /// Why the working-tree status could not be read.
    pub vcs_error: Option<String>,
    /// Whether the tracker sync ran; `None` when it was not attempted.
    pub synced: Option<bool>,
    pub passed: bool,
}

impl ValidationReport {
    /// One-line summary suitable for retry feedback.
    pub fn failure_summary(&self) -> Option<String> {
        if self.passed {
            return None;
        }
        if !self.agent_success {
            return Some("the agent run did not succeed".to_string());
        }
        Some(format!(
            "tracked issues still open: {}",
            self.open_issues.join(", ")
        ))
    }
}

/// Top-level state of a loop run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }
}

/// Category that drove a run into `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum FailureReason {
    /// Setup is broken (missing plan, malformed phase id). Never retried.
    Configuration { message: String },
    /// Every allowed attempt ran without passing validation.
    IterationsExhausted {
        attempts: u32,
        /// True when no attempt ever got a successful exit from the agent.
        agent_never_succeeded: bool,
        #[serde(default)]
        last_failure: Option<String>,
    },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Configuration { message } => write!(f, "configuration-error: {message}"),
            FailureReason::IterationsExhausted { .. } => write!(f, "iterations-exhausted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_reason_displays_stable_tag() {
        let reason = FailureReason::IterationsExhausted {
            attempts: 3,
            agent_never_succeeded: false,
            last_failure: Some("open issues: I-2".to_string()),
        };
        assert_eq!(reason.to_string(), "iterations-exhausted");
    }

    #[test]
    fn timeout_failure_mentions_timeout() {
        let failure = InvocationFailure::TimeoutExceeded { timeout_secs: 60 };
        assert!(failure.to_string().contains("timeout"));
    }

    #[test]
    fn exit_code_reports_zero_on_success_and_code_on_failure() {
        let ok = AgentInvocationResult::succeeded(String::new(), String::new(), Duration::ZERO);
        assert_eq!(ok.exit_code(), Some(0));

        let failed = AgentInvocationResult::failed(
            InvocationFailure::NonzeroExit { code: Some(2) },
            String::new(),
            String::new(),
            Duration::ZERO,
        );
        assert_eq!(failed.exit_code(), Some(2));
        assert!(!failed.success);
    }

    #[test]
    fn phase_status_serializes_lowercase() {
        let json = serde_json::to_string(&PhaseStatus::Completed).expect("serialize");
        assert_eq!(json, "\"completed\"");
    }
}
