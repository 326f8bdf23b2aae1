//! The `LoopRun` value and its state transitions.
//!
//! A run is threaded explicitly through the loop runner; there is no ambient
//! "current run". Transitions are monotonic: `Idle -> Running -> {Completed,
//! Failed}`, with `Running <-> Paused`. The iteration counter for the current
//! phase never exceeds `max_iterations`.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::{FailureReason, Phase, PhaseStatus, RunState};

pub const DEFAULT_MAX_ITERATIONS: u32 = 100;
pub const DEFAULT_DELAY: Duration = Duration::from_secs(10);

/// Rejected state change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("illegal run transition {from:?} -> {to:?}")]
    Illegal { from: RunState, to: RunState },
    #[error("iteration cap reached ({max_iterations})")]
    IterationCap { max_iterations: u32 },
    #[error("no phase is active")]
    NoActivePhase,
}

/// Auxiliary context carried across checkpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunContext {
    /// Phases finished successfully in this run, in completion order.
    pub completed_phases: Vec<String>,
    /// Requirement ids decomposed so far (issue ids picked up in tracker mode).
    pub requirement_ids: Vec<String>,
    /// Human-readable reason the previous attempt of the current phase failed.
    pub last_failure: Option<String>,
    /// Attempts of the current phase where the agent itself reported success.
    pub agent_successes: u32,
}

/// How the next phase is chosen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RunMode {
    /// Plan phases in document order, skipping completed ones.
    #[default]
    Sequential,
    /// Exactly one plan phase.
    Single { phase_id: String },
    /// The tracker's most-ready issue becomes the next phase.
    Tracker,
}

/// What a run works on; persisted so `resume` needs no arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunTarget {
    pub plan_path: Option<PathBuf>,
    pub mode: RunMode,
    /// Issue ids required closed in addition to those listed in the plan.
    pub extra_issue_ids: Vec<String>,
}

/// State of one autonomous loop run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopRun {
    pub run_id: String,
    pub phase: Option<Phase>,
    pub iteration: u32,
    pub max_iterations: u32,
    pub delay: Duration,
    pub state: RunState,
    /// RFC 3339 timestamp of the first transition to `Running`.
    pub started_at: Option<String>,
    /// Cumulative time spent running, across process restarts.
    pub elapsed: Duration,
    pub failure: Option<FailureReason>,
    pub context: RunContext,
}

impl LoopRun {
    pub fn new(run_id: impl Into<String>, max_iterations: u32, delay: Duration) -> Self {
        Self {
            run_id: run_id.into(),
            phase: None,
            iteration: 0,
            max_iterations,
            delay,
            state: RunState::Idle,
            started_at: None,
            elapsed: Duration::ZERO,
            failure: None,
            context: RunContext::default(),
        }
    }

    pub fn phase_id(&self) -> Option<&str> {
        self.phase.as_ref().map(|p| p.id.as_str())
    }

    /// `Idle -> Running`.
    pub fn start(&mut self, now_rfc3339: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(RunState::Idle, RunState::Running)?;
        if self.started_at.is_none() {
            self.started_at = Some(now_rfc3339.into());
        }
        Ok(())
    }

    /// `Running -> Paused`.
    pub fn pause(&mut self) -> Result<(), TransitionError> {
        self.transition(RunState::Running, RunState::Paused)
    }

    /// `Paused -> Running`.
    pub fn resume(&mut self) -> Result<(), TransitionError> {
        self.transition(RunState::Paused, RunState::Running)
    }

    /// `Running -> Completed`.
    pub fn complete(&mut self) -> Result<(), TransitionError> {
        self.transition(RunState::Running, RunState::Completed)
    }

    /// Any non-terminal state `-> Failed`.
    pub fn fail(&mut self, reason: FailureReason) -> Result<(), TransitionError> {
        if self.state.is_terminal() {
            return Err(TransitionError::Illegal {
                from: self.state,
                to: RunState::Failed,
            });
        }
        if let Some(phase) = self.phase.as_mut() {
            phase.status = PhaseStatus::Failed;
        }
        self.state = RunState::Failed;
        self.failure = Some(reason);
        Ok(())
    }

    /// Make `phase` current and reset per-phase bookkeeping.
    pub fn begin_phase(&mut self, mut phase: Phase) -> Result<(), TransitionError> {
        self.require(RunState::Running)?;
        phase.status = PhaseStatus::Running;
        self.phase = Some(phase);
        self.iteration = 0;
        self.context.last_failure = None;
        self.context.agent_successes = 0;
        Ok(())
    }

    /// Consume one iteration of the current phase and return its 1-based number.
    pub fn begin_iteration(&mut self) -> Result<u32, TransitionError> {
        self.require(RunState::Running)?;
        if self.phase.is_none() {
            return Err(TransitionError::NoActivePhase);
        }
        if self.iteration >= self.max_iterations {
            return Err(TransitionError::IterationCap {
                max_iterations: self.max_iterations,
            });
        }
        self.iteration += 1;
        Ok(self.iteration)
    }

    /// Give back an iteration whose attempt was interrupted before it finished.
    pub fn abandon_iteration(&mut self) {
        self.iteration = self.iteration.saturating_sub(1);
    }

    pub fn iterations_remaining(&self) -> bool {
        self.iteration < self.max_iterations
    }

    /// Record the outcome of a finished (non-interrupted) attempt.
    pub fn record_attempt(&mut self, agent_succeeded: bool, failure: Option<String>) {
        if agent_succeeded {
            self.context.agent_successes += 1;
        }
        self.context.last_failure = failure;
    }

    /// Mark the current phase completed. The run itself stays `Running`.
    pub fn complete_phase(&mut self) -> Result<(), TransitionError> {
        self.require(RunState::Running)?;
        let phase = self.phase.as_mut().ok_or(TransitionError::NoActivePhase)?;
        phase.status = PhaseStatus::Completed;
        if !self.context.completed_phases.contains(&phase.id) {
            self.context.completed_phases.push(phase.id.clone());
        }
        self.context.last_failure = None;
        Ok(())
    }

    pub fn is_phase_completed(&self, phase_id: &str) -> bool {
        self.context.completed_phases.iter().any(|id| id == phase_id)
    }

    /// Failure reason for a phase that ran out of iterations.
    pub fn exhausted_reason(&self) -> FailureReason {
        FailureReason::IterationsExhausted {
            attempts: self.iteration,
            agent_never_succeeded: self.context.agent_successes == 0,
            last_failure: self.context.last_failure.clone(),
        }
    }

    pub fn add_elapsed(&mut self, elapsed: Duration) {
        self.elapsed += elapsed;
    }

    fn require(&self, state: RunState) -> Result<(), TransitionError> {
        if self.state != state {
            return Err(TransitionError::Illegal {
                from: self.state,
                to: state,
            });
        }
        Ok(())
    }

    fn transition(&mut self, from: RunState, to: RunState) -> Result<(), TransitionError> {
        if self.state != from {
            return Err(TransitionError::Illegal {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running(max_iterations: u32) -> LoopRun {
        let mut run = LoopRun::new("run-1", max_iterations, Duration::ZERO);
        run.start("2026-01-01T00:00:00Z").expect("start");
        run.begin_phase(Phase::new("X", "plan.md", 0))
            .expect("begin phase");
        run
    }

    #[test]
    fn iteration_counter_never_exceeds_max() {
        let mut run = running(2);
        assert_eq!(run.begin_iteration(), Ok(1));
        assert_eq!(run.begin_iteration(), Ok(2));
        assert_eq!(
            run.begin_iteration(),
            Err(TransitionError::IterationCap { max_iterations: 2 })
        );
        assert_eq!(run.iteration, 2);
        assert!(!run.iterations_remaining());
    }

    #[test]
    fn abandoned_iteration_is_not_counted() {
        let mut run = running(3);
        run.begin_iteration().expect("iter");
        run.abandon_iteration();
        assert_eq!(run.iteration, 0);
        assert_eq!(run.begin_iteration(), Ok(1));
    }

    #[test]
    fn terminal_states_reject_further_transitions() {
        let mut run = running(1);
        run.complete().expect("complete");
        assert!(run.pause().is_err());
        assert!(run.resume().is_err());
        assert!(
            run.fail(FailureReason::Configuration {
                message: "late".to_string()
            })
            .is_err()
        );
        assert_eq!(run.state, RunState::Completed);
    }

    #[test]
    fn pause_and_resume_round_trip() {
        let mut run = running(1);
        run.pause().expect("pause");
        assert_eq!(run.state, RunState::Paused);
        assert!(run.begin_iteration().is_err());
        run.resume().expect("resume");
        assert_eq!(run.state, RunState::Running);
    }

    #[test]
    fn start_twice_is_illegal() {
        let mut run = LoopRun::new("run-1", 1, Duration::ZERO);
        run.start("t0").expect("start");
        assert_eq!(
            run.start("t1"),
            Err(TransitionError::Illegal {
                from: RunState::Running,
                to: RunState::Running
            })
        );
        assert_eq!(run.started_at.as_deref(), Some("t0"));
    }

    #[test]
    fn configuration_failure_is_allowed_from_idle() {
        let mut run = LoopRun::new("run-1", 1, Duration::ZERO);
        run.fail(FailureReason::Configuration {
            message: "missing plan".to_string(),
        })
        .expect("fail");
        assert_eq!(run.state, RunState::Failed);
    }

    #[test]
    fn exhausted_reason_tracks_agent_successes() {
        let mut run = running(2);
        run.begin_iteration().expect("iter");
        run.record_attempt(false, Some("nonzero-exit (code 1)".to_string()));
        assert!(matches!(
            run.exhausted_reason(),
            FailureReason::IterationsExhausted {
                agent_never_succeeded: true,
                ..
            }
        ));

        run.begin_iteration().expect("iter");
        run.record_attempt(true, Some("open issues: I-1".to_string()));
        assert_eq!(
            run.exhausted_reason(),
            FailureReason::IterationsExhausted {
                attempts: 2,
                agent_never_succeeded: false,
                last_failure: Some("open issues: I-1".to_string()),
            }
        );
    }

    #[test]
    fn complete_phase_records_id_once() {
        let mut run = running(1);
        run.complete_phase().expect("complete phase");
        run.complete_phase().expect("complete phase again");
        assert_eq!(run.context.completed_phases, vec!["X".to_string()]);
        assert!(run.is_phase_completed("X"));
        assert_eq!(
            run.phase.as_ref().map(|p| p.status),
            Some(PhaseStatus::Completed)
        );
    }
}
