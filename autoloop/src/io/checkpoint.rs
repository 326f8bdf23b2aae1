//! Checkpoint storage (`.autoloop/checkpoint.json`).
//!
//! A checkpoint is a full snapshot of the [`LoopRun`] plus its [`RunTarget`].
//! Each write supersedes the previous one. Every field except `run_id` is
//! defaulted on load so files written by older versions still resume.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::run::{DEFAULT_DELAY, DEFAULT_MAX_ITERATIONS, LoopRun, RunContext, RunTarget};
use crate::core::types::{FailureReason, Phase, PhaseStatus, RunState};

pub const CHECKPOINT_VERSION: u32 = 2;

/// Persisted snapshot of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Schema version; files without one are version 1.
    #[serde(default = "legacy_version")]
    pub version: u32,
    pub run_id: String,
    #[serde(default)]
    pub phase_id: Option<String>,
    #[serde(default)]
    pub phase: Option<Phase>,
    #[serde(default)]
    pub iteration: u32,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_delay_secs")]
    pub delay_secs: u64,
    #[serde(default)]
    pub state: RunState,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub elapsed_ms: u64,
    #[serde(default)]
    pub failure: Option<FailureReason>,
    #[serde(default)]
    pub context: RunContext,
    #[serde(default)]
    pub target: RunTarget,
    #[serde(default)]
    pub updated_at: Option<String>,
}

fn legacy_version() -> u32 {
    1
}

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

fn default_delay_secs() -> u64 {
    DEFAULT_DELAY.as_secs()
}

impl Checkpoint {
    pub fn from_run(run: &LoopRun, target: &RunTarget) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            run_id: run.run_id.clone(),
            phase_id: run.phase_id().map(str::to_string),
            phase: run.phase.clone(),
            iteration: run.iteration,
            max_iterations: run.max_iterations,
            delay_secs: run.delay.as_secs(),
            state: run.state,
            started_at: run.started_at.clone(),
            elapsed_ms: u64::try_from(run.elapsed.as_millis()).unwrap_or(u64::MAX),
            failure: run.failure.clone(),
            context: run.context.clone(),
            target: target.clone(),
            updated_at: Some(chrono::Utc::now().to_rfc3339()),
        }
    }

    /// Rebuild the run and its target.
    ///
    /// A version-1 checkpoint only names the phase; the phase record is
    /// reconstructed from the id and the target's plan path.
    pub fn into_run(self) -> (LoopRun, RunTarget) {
        let phase = match (self.phase, self.phase_id) {
            (Some(phase), _) => Some(phase),
            (None, Some(id)) => {
                let plan_path = self.target.plan_path.clone().unwrap_or_default();
                let mut phase = Phase::new(id, plan_path, 0);
                phase.status = PhaseStatus::Running;
                Some(phase)
            }
            (None, None) => None,
        };
        let run = LoopRun {
            run_id: self.run_id,
            phase,
            iteration: self.iteration.min(self.max_iterations),
            max_iterations: self.max_iterations,
            delay: Duration::from_secs(self.delay_secs),
            state: self.state,
            started_at: self.started_at,
            elapsed: Duration::from_millis(self.elapsed_ms),
            failure: self.failure,
            context: self.context,
        };
        (run, self.target)
    }
}

/// Load a checkpoint, or `None` when the file does not exist.
pub fn load_checkpoint(path: &Path) -> Result<Option<Checkpoint>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("read checkpoint {}", path.display())),
    };
    let checkpoint: Checkpoint = serde_json::from_str(&contents)
        .with_context(|| format!("parse checkpoint {}", path.display()))?;
    debug!(
        run_id = %checkpoint.run_id,
        version = checkpoint.version,
        phase = ?checkpoint.phase_id,
        iteration = checkpoint.iteration,
        "checkpoint loaded"
    );
    Ok(Some(checkpoint))
}

/// Atomically write a checkpoint (temp file + rename).
pub fn write_checkpoint(path: &Path, checkpoint: &Checkpoint) -> Result<()> {
    debug!(
        path = %path.display(),
        phase = ?checkpoint.phase_id,
        iteration = checkpoint.iteration,
        state = ?checkpoint.state,
        "writing checkpoint"
    );
    let mut buf = serde_json::to_string_pretty(checkpoint)?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("checkpoint path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp checkpoint {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace checkpoint {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::run::RunMode;

    fn sample_run() -> LoopRun {
        let mut run = LoopRun::new("run-abc", 5, Duration::from_secs(3));
        run.start("2026-01-01T00:00:00Z").expect("start");
        run.begin_phase(Phase::new("2", "plan.md", 1).with_issues(vec!["I-1".to_string()]))
            .expect("phase");
        run.begin_iteration().expect("iter");
        run.begin_iteration().expect("iter");
        run.record_attempt(true, Some("open issues: I-1".to_string()));
        run.context.completed_phases.push("1".to_string());
        run.add_elapsed(Duration::from_millis(1500));
        run
    }

    #[test]
    fn checkpoint_round_trips_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("checkpoint.json");
        let run = sample_run();
        let target = RunTarget {
            plan_path: Some("plan.md".into()),
            mode: RunMode::Single {
                phase_id: "2".to_string(),
            },
            extra_issue_ids: vec!["I-9".to_string()],
        };

        write_checkpoint(&path, &Checkpoint::from_run(&run, &target)).expect("write");
        let loaded = load_checkpoint(&path).expect("load").expect("present");
        assert_eq!(loaded.version, CHECKPOINT_VERSION);
        let (restored, restored_target) = loaded.into_run();

        assert_eq!(restored, run);
        assert_eq!(restored_target, target);
        assert!(!temp.path().join("checkpoint.json.tmp").exists());
    }

    #[test]
    fn version_one_checkpoint_loads_with_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("checkpoint.json");
        fs::write(&path, r#"{"run_id": "old", "phase_id": "X", "iteration": 4}"#).expect("write");

        let loaded = load_checkpoint(&path).expect("load").expect("present");
        assert_eq!(loaded.version, 1);
        let (run, target) = loaded.into_run();

        assert_eq!(run.run_id, "old");
        assert_eq!(run.phase_id(), Some("X"));
        assert_eq!(run.iteration, 4);
        assert_eq!(run.max_iterations, DEFAULT_MAX_ITERATIONS);
        assert_eq!(run.delay, DEFAULT_DELAY);
        assert_eq!(run.state, RunState::Idle);
        assert_eq!(run.context, RunContext::default());
        assert_eq!(target, RunTarget::default());
    }

    #[test]
    fn missing_checkpoint_is_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(load_checkpoint(&temp.path().join("nope.json")).expect("load").is_none());
    }

    #[test]
    fn corrupt_checkpoint_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("checkpoint.json");
        fs::write(&path, "{not json").expect("write");
        let err = load_checkpoint(&path).unwrap_err();
        assert!(format!("{err:#}").contains("parse checkpoint"));
    }
}
