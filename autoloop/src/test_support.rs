//! Test doubles for the loop's external collaborators.
//!
//! Available to unit tests and, through the `test-support` feature, to the
//! integration tests under `tests/`.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::core::status::normalize_status;
use crate::core::types::{AgentInvocationResult, InvocationFailure, IssueState, TrackedIssue};
use crate::io::agent::AgentInvoker;
use crate::io::control::LoopControl;
use crate::io::git::{StatusEntry, VcsStatus};
use crate::io::init::LoopPaths;
use crate::io::tracker::{IssueTracker, TrackerError, TrackerResult};
use crate::looping::Sleeper;

/// Temporary working directory with a plan artifact slot.
pub struct TestWorkspace {
    temp: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        Ok(Self {
            temp: tempfile::tempdir()?,
        })
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn paths(&self) -> LoopPaths {
        LoopPaths::new(self.root())
    }

    pub fn plan_path(&self) -> PathBuf {
        self.root().join("PLAN.md")
    }

    pub fn write_plan(&self, content: &str) -> Result<PathBuf> {
        let path = self.plan_path();
        fs::write(&path, content)?;
        Ok(path)
    }
}

#[derive(Debug, Clone)]
enum StepAction {
    Pause(LoopControl),
    Stop(LoopControl),
}

/// One scripted agent invocation.
#[derive(Debug, Clone)]
pub struct ScriptedStep {
    pub result: AgentInvocationResult,
    /// Issues the "agent" closes in the fake tracker while running.
    pub close_issues: Vec<String>,
    action: Option<StepAction>,
}

impl ScriptedStep {
    pub fn success() -> Self {
        Self::from_result(AgentInvocationResult::succeeded(
            "done".to_string(),
            String::new(),
            Duration::from_millis(10),
        ))
    }

    pub fn failure(code: i32) -> Self {
        Self::from_result(AgentInvocationResult::failed(
            InvocationFailure::NonzeroExit { code: Some(code) },
            String::new(),
            format!("agent exited with {code}"),
            Duration::from_millis(10),
        ))
    }

    /// Requests a pause on `control` and reports the run as interrupted.
    pub fn interrupted_by_pause(control: &LoopControl) -> Self {
        Self {
            action: Some(StepAction::Pause(control.clone())),
            ..Self::interrupted()
        }
    }

    /// Requests a stop on `control` and reports the run as interrupted.
    pub fn interrupted_by_stop(control: &LoopControl) -> Self {
        Self {
            action: Some(StepAction::Stop(control.clone())),
            ..Self::interrupted()
        }
    }

    pub fn closing(mut self, issue_ids: &[&str]) -> Self {
        self.close_issues = issue_ids.iter().map(|id| id.to_string()).collect();
        self
    }

    fn interrupted() -> Self {
        Self::from_result(AgentInvocationResult::failed(
            InvocationFailure::Interrupted,
            String::new(),
            String::new(),
            Duration::from_millis(10),
        ))
    }

    fn from_result(result: AgentInvocationResult) -> Self {
        Self {
            result,
            close_issues: Vec::new(),
            action: None,
        }
    }
}

/// Agent that replays scripted results and records every prompt.
pub struct ScriptedAgent {
    steps: Mutex<VecDeque<ScriptedStep>>,
    prompts: Mutex<Vec<String>>,
    tracker: Option<FakeTracker>,
}

impl ScriptedAgent {
    pub fn new(steps: Vec<ScriptedStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            prompts: Mutex::new(Vec::new()),
            tracker: None,
        }
    }

    /// Tracker whose issues the scripted steps close.
    pub fn with_tracker(mut self, tracker: FakeTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn invocations(&self) -> usize {
        self.prompts.lock().expect("prompts lock").len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompts lock").clone()
    }
}

impl AgentInvoker for ScriptedAgent {
    fn invoke(&self, prompt: &str, _timeout: Duration) -> AgentInvocationResult {
        self.prompts
            .lock()
            .expect("prompts lock")
            .push(prompt.to_string());
        let Some(step) = self.steps.lock().expect("steps lock").pop_front() else {
            return AgentInvocationResult::failed(
                InvocationFailure::NonzeroExit { code: Some(99) },
                String::new(),
                "no scripted step left".to_string(),
                Duration::ZERO,
            );
        };
        if let Some(tracker) = &self.tracker {
            for id in &step.close_issues {
                tracker.set_status(id, "closed");
            }
        }
        match &step.action {
            Some(StepAction::Pause(control)) => control.request_pause(),
            Some(StepAction::Stop(control)) => control.request_stop(),
            None => {}
        }
        step.result
    }
}

#[derive(Debug, Default)]
struct FakeTrackerState {
    issues: Vec<TrackedIssue>,
    unreachable: bool,
    sync_fails: bool,
    calls: Vec<String>,
}

/// In-memory tracker; clones share state.
#[derive(Debug, Clone, Default)]
pub struct FakeTracker {
    state: Arc<Mutex<FakeTrackerState>>,
}

impl FakeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_issue(self, id: &str, status: &str) -> Self {
        self.with_blocked_issue(id, status, &[])
    }

    pub fn with_blocked_issue(self, id: &str, status: &str, blocked_by: &[&str]) -> Self {
        self.lock().issues.push(TrackedIssue {
            id: id.to_string(),
            title: None,
            raw_status: status.to_string(),
            state: normalize_status(status),
            blocked_by: blocked_by.iter().map(|b| b.to_string()).collect(),
        });
        self
    }

    /// Every command fails as if the tracker were not installed.
    pub fn unreachable(self) -> Self {
        self.lock().unreachable = true;
        self
    }

    pub fn failing_sync(self) -> Self {
        self.lock().sync_fails = true;
        self
    }

    pub fn set_status(&self, id: &str, status: &str) {
        if let Some(issue) = self.lock().issues.iter_mut().find(|i| i.id == id) {
            issue.raw_status = status.to_string();
            issue.state = normalize_status(status);
        }
    }

    pub fn status_of(&self, id: &str) -> Option<String> {
        self.lock()
            .issues
            .iter()
            .find(|i| i.id == id)
            .map(|i| i.raw_status.clone())
    }

    /// Commands received so far, e.g. `show I-1`, `update I-1 in_progress`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeTrackerState> {
        self.state.lock().expect("fake tracker lock")
    }

    fn begin(&self, call: String) -> TrackerResult<std::sync::MutexGuard<'_, FakeTrackerState>> {
        let mut state = self.lock();
        state.calls.push(call);
        if state.unreachable {
            return Err(TrackerError::NotInstalled {
                program: "fake-tracker".to_string(),
            });
        }
        Ok(state)
    }
}

fn unknown_issue(command: String) -> TrackerError {
    TrackerError::CommandFailed {
        command,
        code: Some(1),
        stderr: "issue not found".to_string(),
    }
}

impl IssueTracker for FakeTracker {
    fn fetch_ready_issues(&self, limit: u32) -> TrackerResult<Vec<TrackedIssue>> {
        let state = self.begin(format!("ready {limit}"))?;
        let is_closed = |id: &str| {
            state
                .issues
                .iter()
                .any(|i| i.id == id && i.state == IssueState::Closed)
        };
        Ok(state
            .issues
            .iter()
            .filter(|i| i.state == IssueState::Open)
            .filter(|i| i.blocked_by.iter().all(|b| is_closed(b)))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    fn update_status(&self, issue_id: &str, status: &str) -> TrackerResult<()> {
        let command = format!("update {issue_id} {status}");
        let mut state = self.begin(command.clone())?;
        let issue = state
            .issues
            .iter_mut()
            .find(|i| i.id == issue_id)
            .ok_or_else(|| unknown_issue(command))?;
        issue.raw_status = status.to_string();
        issue.state = normalize_status(status);
        Ok(())
    }

    fn show_issue(&self, issue_id: &str) -> TrackerResult<TrackedIssue> {
        let command = format!("show {issue_id}");
        let state = self.begin(command.clone())?;
        state
            .issues
            .iter()
            .find(|i| i.id == issue_id)
            .cloned()
            .ok_or_else(|| unknown_issue(command))
    }

    fn sync(&self) -> TrackerResult<()> {
        let state = self.begin("sync".to_string())?;
        if state.sync_fails {
            return Err(TrackerError::CommandFailed {
                command: "sync".to_string(),
                code: Some(1),
                stderr: "remote unavailable".to_string(),
            });
        }
        Ok(())
    }
}

/// Working-tree status with a fixed answer.
pub struct FakeVcs {
    outcome: std::result::Result<usize, String>,
}

impl FakeVcs {
    pub fn with_changes(count: usize) -> Self {
        Self { outcome: Ok(count) }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            outcome: Err(message.to_string()),
        }
    }
}

impl VcsStatus for FakeVcs {
    fn pending_changes(&self, _workdir: &Path) -> Result<Vec<StatusEntry>> {
        match &self.outcome {
            Ok(count) => Ok((0..*count)
                .map(|i| StatusEntry {
                    code: "??".to_string(),
                    path: format!("file-{i}.txt"),
                })
                .collect()),
            Err(message) => Err(anyhow!("{message}")),
        }
    }
}

/// Records requested sleeps without waiting.
#[derive(Default)]
pub struct RecordingSleeper {
    sleeps: Mutex<Vec<Duration>>,
    resume: Option<LoopControl>,
    pause_at: Option<(usize, LoopControl)>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Withdraw any pause request on `control` the first time the loop waits.
    pub fn resuming(mut self, control: &LoopControl) -> Self {
        self.resume = Some(control.clone());
        self
    }

    /// Request a pause on `control` during the `call`-th sleep (0-based).
    pub fn pausing_at(mut self, call: usize, control: &LoopControl) -> Self {
        self.pause_at = Some((call, control.clone()));
        self
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().expect("sleeps lock").clone()
    }
}

impl Sleeper for RecordingSleeper {
    /// Reports the full duration as slept unless `wake` fires.
    fn sleep(&self, duration: Duration, wake: &dyn Fn() -> bool) -> Duration {
        let call = {
            let mut sleeps = self.sleeps.lock().expect("sleeps lock");
            sleeps.push(duration);
            sleeps.len() - 1
        };
        if let Some(control) = &self.resume
            && control.is_pause_requested()
        {
            control.request_resume();
        }
        if let Some((at, control)) = &self.pause_at
            && *at == call
        {
            control.request_pause();
        }
        if wake() { Duration::ZERO } else { duration }
    }
}
