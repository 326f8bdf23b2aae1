//! Autonomous loop runner.
//!
//! Drives one phase at a time through prompt -> agent -> validation attempts,
//! bounded by the run's `max_iterations` with a fixed delay between attempts.
//! The [`LoopRun`] is threaded through explicitly and checkpointed after every
//! transition and every finished attempt, so a restarted process resumes the
//! iteration count instead of starting over.

use std::fs;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::id::validate_id;
use crate::core::plan::discover_phases;
use crate::core::run::{LoopRun, RunMode, RunTarget, TransitionError};
use crate::core::types::{
    AgentInvocationResult, FailureReason, Phase, PhaseStatus, RunState, ValidationReport,
};
use crate::io::agent::AgentInvoker;
use crate::io::checkpoint::{Checkpoint, write_checkpoint};
use crate::io::control::LoopControl;
use crate::io::git::{Git, VcsStatus};
use crate::io::init::{LoopPaths, ensure_layout};
use crate::io::iteration_log::{IterationMeta, write_iteration};
use crate::io::prompt::{DEFAULT_PROMPT_BUDGET, PromptBuilder, PromptError};
use crate::io::tracker::IssueTracker;
use crate::validate::OutcomeValidator;

pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(3600);

/// How often a paused run re-checks for resume/stop.
const PAUSE_POLL: Duration = Duration::from_secs(1);
/// Granularity of interruptible sleeps.
const SLEEP_SLICE: Duration = Duration::from_millis(200);
/// Stderr lines carried into retry feedback.
const FEEDBACK_STDERR_LINES: usize = 20;

/// Waits between attempts and while paused.
pub trait Sleeper {
    /// Sleep up to `duration`, waking early once `wake` returns true.
    /// Returns how long was actually slept.
    fn sleep(&self, duration: Duration, wake: &dyn Fn() -> bool) -> Duration;
}

/// Real-time sleeper that polls `wake` every 200ms.
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration, wake: &dyn Fn() -> bool) -> Duration {
        let start = Instant::now();
        let deadline = start + duration;
        loop {
            let now = Instant::now();
            if wake() {
                return (now - start).min(duration);
            }
            if now >= deadline {
                return duration;
            }
            std::thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}

/// Tunables that are not part of the persisted run.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub agent_timeout: Duration,
    pub prompt_budget_bytes: usize,
    /// Ready issues requested per tracker query in tracker-driven mode.
    pub ready_limit: u32,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            agent_timeout: DEFAULT_AGENT_TIMEOUT,
            prompt_budget_bytes: DEFAULT_PROMPT_BUDGET,
            ready_limit: 1,
        }
    }
}

/// Why [`LoopRunner::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// Every selected phase passed validation.
    Completed,
    Failed(FailureReason),
    /// A stop request arrived; the run is left `Paused` and can be resumed.
    Stopped,
}

#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub run: LoopRun,
    pub stop: LoopStop,
}

enum PhaseEnd {
    Passed,
    Exhausted,
    Misconfigured(String),
    Stopped,
}

pub struct LoopRunner<'a, A: ?Sized, T: ?Sized, V: ?Sized, S: ?Sized> {
    paths: LoopPaths,
    agent: &'a A,
    tracker: &'a T,
    vcs: &'a V,
    sleeper: &'a S,
    control: LoopControl,
    settings: LoopSettings,
}

impl<'a, A, T, V, S> LoopRunner<'a, A, T, V, S>
where
    A: AgentInvoker + ?Sized,
    T: IssueTracker + ?Sized,
    V: VcsStatus + ?Sized,
    S: Sleeper + ?Sized,
{
    pub fn new(paths: LoopPaths, agent: &'a A, tracker: &'a T, vcs: &'a V, sleeper: &'a S) -> Self {
        Self {
            paths,
            agent,
            tracker,
            vcs,
            sleeper,
            control: LoopControl::new(),
            settings: LoopSettings::default(),
        }
    }

    pub fn with_control(mut self, control: LoopControl) -> Self {
        self.control = control;
        self
    }

    pub fn with_settings(mut self, settings: LoopSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Drive `run` until it completes, fails or is stopped.
    ///
    /// Only plumbing failures (e.g. an unwritable checkpoint) are returned as
    /// errors; configuration problems end the run as `Failed`.
    #[instrument(skip_all, fields(run_id = %run.run_id))]
    pub fn run(&self, mut run: LoopRun, target: &RunTarget) -> Result<LoopOutcome> {
        ensure_layout(&self.paths)?;
        if let Some(stop) = finished_stop(&run) {
            return Ok(LoopOutcome { run, stop });
        }
        match run.state {
            RunState::Idle => run.start(now())?,
            RunState::Paused => run.resume()?,
            RunState::Running => info!("continuing a run that did not shut down cleanly"),
            RunState::Completed | RunState::Failed => {}
        }
        self.checkpoint(&run, target)?;

        let phases = match self.plan_phases(target) {
            Ok(phases) => phases,
            Err(message) => return self.fail(run, target, FailureReason::Configuration { message }),
        };

        loop {
            if self.control.is_stop_requested() {
                return self.stop(run, target);
            }
            let next = match self.next_phase(&run, target, &phases) {
                Ok(Some(phase)) => phase,
                Ok(None) => {
                    run.complete()?;
                    self.checkpoint(&run, target)?;
                    info!(
                        phases = run.context.completed_phases.len(),
                        elapsed_secs = run.elapsed.as_secs(),
                        "run completed"
                    );
                    return Ok(LoopOutcome {
                        run,
                        stop: LoopStop::Completed,
                    });
                }
                Err(message) => {
                    return self.fail(run, target, FailureReason::Configuration { message });
                }
            };

            let resuming = run
                .phase
                .as_ref()
                .is_some_and(|p| p.id == next.id && p.status == PhaseStatus::Running);
            if resuming {
                if let Some(current) = run.phase.as_mut() {
                    current.plan_path = next.plan_path;
                    current.issue_ids = next.issue_ids;
                }
                info!(phase = ?run.phase_id(), iter = run.iteration, "resuming phase");
            } else {
                if target.mode == RunMode::Tracker {
                    self.claim_issue(&mut run, &next.id);
                }
                info!(phase = %next.id, issues = ?next.issue_ids, "starting phase");
                run.begin_phase(next)?;
                self.checkpoint(&run, target)?;
            }

            match self.run_phase(&mut run, target)? {
                PhaseEnd::Passed => {
                    run.complete_phase()?;
                    self.checkpoint(&run, target)?;
                    info!(phase = ?run.phase_id(), iter = run.iteration, "phase completed");
                }
                PhaseEnd::Exhausted => {
                    let reason = run.exhausted_reason();
                    return self.fail(run, target, reason);
                }
                PhaseEnd::Misconfigured(message) => {
                    return self.fail(run, target, FailureReason::Configuration { message });
                }
                PhaseEnd::Stopped => return self.stop(run, target),
            }
        }
    }

    fn run_phase(&self, run: &mut LoopRun, target: &RunTarget) -> Result<PhaseEnd> {
        let validator = OutcomeValidator::new(self.tracker, self.vcs);
        let prompts = PromptBuilder::new(self.settings.prompt_budget_bytes);

        loop {
            if self.control.is_stop_requested() {
                return Ok(PhaseEnd::Stopped);
            }
            if self.control.is_pause_requested() && !self.wait_while_paused(run, target)? {
                return Ok(PhaseEnd::Stopped);
            }
            if !run.iterations_remaining() {
                return Ok(PhaseEnd::Exhausted);
            }

            let iteration = run.begin_iteration()?;
            let phase = run.phase.clone().ok_or(TransitionError::NoActivePhase)?;
            info!(phase = %phase.id, iter = iteration, max = run.max_iterations, "starting attempt");

            let prompt = match prompts.build_with_feedback(
                &phase.plan_path,
                &phase.id,
                &phase.issue_ids,
                run.context.last_failure.as_deref(),
            ) {
                Ok(prompt) => prompt,
                Err(err) => {
                    warn!(err = %err, "prompt could not be built");
                    self.checkpoint(run, target)?;
                    return Ok(PhaseEnd::Misconfigured(prompt_failure(&err)));
                }
            };

            let started_at = now();
            let attempt_start = Instant::now();
            let result = self.agent.invoke(&prompt, self.settings.agent_timeout);

            if result.is_interrupted() {
                info!(phase = %phase.id, iter = iteration, "attempt interrupted; iteration not counted");
                run.abandon_iteration();
                run.add_elapsed(attempt_start.elapsed());
                self.checkpoint(run, target)?;
                continue;
            }

            let report = validator.assess(&result, &phase.issue_ids, &self.paths.root);
            run.record_attempt(result.success, attempt_failure(&result, &report));
            run.add_elapsed(attempt_start.elapsed());

            let meta = IterationMeta::new(
                &run.run_id,
                &phase.id,
                iteration,
                &result,
                Some(&report),
                started_at,
            );
            if let Err(err) = write_iteration(&self.paths.iterations_dir, &meta, &result) {
                warn!(err = %format!("{err:#}"), "failed to write iteration log");
            }
            self.checkpoint(run, target)?;

            if report.passed {
                return Ok(PhaseEnd::Passed);
            }
            warn!(
                phase = %phase.id,
                iter = iteration,
                reason = meta.failure.as_deref().unwrap_or("unknown"),
                "attempt did not pass"
            );
            if !run.iterations_remaining() {
                return Ok(PhaseEnd::Exhausted);
            }

            debug!(delay_secs = run.delay.as_secs(), "waiting before next attempt");
            if !self.wait_delay(run, target)? {
                return Ok(PhaseEnd::Stopped);
            }
        }
    }

    /// Sleep the inter-attempt delay. A pause during the delay parks the run,
    /// and whatever part of the delay was still owed is slept after resuming.
    /// Returns false on a stop request.
    fn wait_delay(&self, run: &mut LoopRun, target: &RunTarget) -> Result<bool> {
        let control = &self.control;
        let mut owed = run.delay;
        while !owed.is_zero() {
            owed = owed.saturating_sub(self.sleeper.sleep(owed, &|| control.should_interrupt()));
            if owed.is_zero() {
                break;
            }
            if control.is_stop_requested() {
                return Ok(false);
            }
            if control.is_pause_requested() && !self.wait_while_paused(run, target)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Park the run in `Paused` until resumed. Returns false on a stop request.
    fn wait_while_paused(&self, run: &mut LoopRun, target: &RunTarget) -> Result<bool> {
        run.pause()?;
        self.checkpoint(run, target)?;
        info!("run paused");

        let control = &self.control;
        loop {
            if control.is_stop_requested() {
                return Ok(false);
            }
            if !control.is_pause_requested() {
                break;
            }
            self.sleeper.sleep(PAUSE_POLL, &|| {
                control.is_stop_requested() || !control.is_pause_requested()
            });
        }

        run.resume()?;
        self.checkpoint(run, target)?;
        info!("run resumed");
        Ok(true)
    }

    fn plan_phases(&self, target: &RunTarget) -> Result<Vec<Phase>, String> {
        let plan_path = target
            .plan_path
            .as_deref()
            .ok_or_else(|| "no plan artifact configured for this run".to_string())?;
        for id in &target.extra_issue_ids {
            validate_id(id).map_err(|err| format!("{err:#}"))?;
        }
        if target.mode == RunMode::Tracker {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(plan_path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                PromptError::ArtifactNotFound {
                    path: plan_path.to_path_buf(),
                }
                .to_string()
            } else {
                format!("read plan artifact {}: {err}", plan_path.display())
            }
        })?;
        let mut phases = discover_phases(plan_path, &content).map_err(|err| format!("{err:#}"))?;
        for phase in &mut phases {
            merge_issue_ids(&mut phase.issue_ids, &target.extra_issue_ids);
        }
        debug!(count = phases.len(), "plan phases discovered");
        Ok(phases)
    }

    fn next_phase(
        &self,
        run: &LoopRun,
        target: &RunTarget,
        phases: &[Phase],
    ) -> Result<Option<Phase>, String> {
        match &target.mode {
            RunMode::Sequential => Ok(phases
                .iter()
                .find(|p| !run.is_phase_completed(&p.id))
                .cloned()),
            RunMode::Single { phase_id } => {
                let phase = phases
                    .iter()
                    .find(|p| &p.id == phase_id)
                    .ok_or_else(|| format!("phase '{phase_id}' not found in plan"))?;
                Ok((!run.is_phase_completed(phase_id)).then(|| phase.clone()))
            }
            RunMode::Tracker => self.next_tracker_phase(run, target),
        }
    }

    fn next_tracker_phase(&self, run: &LoopRun, target: &RunTarget) -> Result<Option<Phase>, String> {
        if let Some(current) = run.phase.as_ref().filter(|p| p.status == PhaseStatus::Running) {
            return Ok(Some(current.clone()));
        }
        let ready = self
            .tracker
            .fetch_ready_issues(self.settings.ready_limit)
            .map_err(|err| format!("tracker-driven mode needs a working issue tracker: {err}"))?;
        let Some(issue) = ready.into_iter().find(|i| !run.is_phase_completed(&i.id)) else {
            info!("no ready issues left");
            return Ok(None);
        };
        validate_id(&issue.id).map_err(|err| format!("{err:#}"))?;

        let mut issue_ids = vec![issue.id.clone()];
        merge_issue_ids(&mut issue_ids, &target.extra_issue_ids);
        let plan_path = target.plan_path.clone().unwrap_or_default();
        let ordinal = run.context.completed_phases.len();
        Ok(Some(Phase::new(issue.id, plan_path, ordinal).with_issues(issue_ids)))
    }

    /// Best-effort: mark a tracker-selected issue as being worked on.
    fn claim_issue(&self, run: &mut LoopRun, issue_id: &str) {
        if let Err(err) = self.tracker.update_status(issue_id, "in_progress") {
            warn!(issue = issue_id, err = %err, "could not mark issue in progress");
        }
        if !run.context.requirement_ids.iter().any(|id| id == issue_id) {
            run.context.requirement_ids.push(issue_id.to_string());
        }
    }

    fn fail(&self, mut run: LoopRun, target: &RunTarget, reason: FailureReason) -> Result<LoopOutcome> {
        warn!(reason = %reason, phase = ?run.phase_id(), iter = run.iteration, "run failed");
        run.fail(reason.clone())?;
        self.checkpoint(&run, target)?;
        Ok(LoopOutcome {
            run,
            stop: LoopStop::Failed(reason),
        })
    }

    fn stop(&self, mut run: LoopRun, target: &RunTarget) -> Result<LoopOutcome> {
        if run.state == RunState::Running {
            run.pause()?;
        }
        self.checkpoint(&run, target)?;
        info!(phase = ?run.phase_id(), iter = run.iteration, "run stopped");
        Ok(LoopOutcome {
            run,
            stop: LoopStop::Stopped,
        })
    }

    fn checkpoint(&self, run: &LoopRun, target: &RunTarget) -> Result<()> {
        write_checkpoint(&self.paths.checkpoint_path, &Checkpoint::from_run(run, target))
            .context("write checkpoint")
    }
}

/// How a run already in a terminal state ended; `None` while it can still make progress.
///
/// A failed run whose checkpoint predates failure reasons counts as a
/// configuration failure, never as success.
pub fn finished_stop(run: &LoopRun) -> Option<LoopStop> {
    match run.state {
        RunState::Completed => Some(LoopStop::Completed),
        RunState::Failed => Some(LoopStop::Failed(run.failure.clone().unwrap_or(
            FailureReason::Configuration {
                message: "run already failed".to_string(),
            },
        ))),
        RunState::Idle | RunState::Running | RunState::Paused => None,
    }
}

/// Run id: UTC timestamp plus the HEAD short sha when available.
pub fn new_run_id(git: &Git) -> String {
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
    match git.head_short_sha(8) {
        Ok(sha) if !sha.is_empty() => format!("{stamp}-{sha}"),
        Ok(_) => stamp,
        Err(err) => {
            debug!(err = %format!("{err:#}"), "no git HEAD for run id");
            stamp
        }
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn prompt_failure(err: &PromptError) -> String {
    match err {
        PromptError::ArtifactNotFound { .. } => err.to_string(),
        other => format!("{other}: {}", error_chain(other)),
    }
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut parts = Vec::new();
    let mut source = err.source();
    while let Some(cause) = source {
        parts.push(cause.to_string());
        source = cause.source();
    }
    parts.join(": ")
}

fn merge_issue_ids(ids: &mut Vec<String>, extra: &[String]) {
    for id in extra {
        if !ids.contains(id) {
            ids.push(id.clone());
        }
    }
}

/// Feedback for the next attempt of the same phase.
fn attempt_failure(result: &AgentInvocationResult, report: &ValidationReport) -> Option<String> {
    let Some(failure) = &result.failure else {
        return report.failure_summary();
    };
    let lines: Vec<&str> = result.stderr.lines().collect();
    let tail = lines[lines.len().saturating_sub(FEEDBACK_STDERR_LINES)..].join("\n");
    if tail.trim().is_empty() {
        Some(format!("agent run failed: {failure}"))
    } else {
        Some(format!("agent run failed: {failure}\n\nLast stderr lines:\n{tail}"))
    }
}
