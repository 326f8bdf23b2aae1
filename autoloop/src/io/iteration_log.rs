//! Per-attempt logs under `.autoloop/iterations/<run_id>/<phase_id>/<iter>/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::types::{AgentInvocationResult, ValidationReport};

#[derive(Debug, Clone, Serialize)]
pub struct IterationMeta {
    pub run_id: String,
    pub phase_id: String,
    pub iteration: u32,
    pub success: bool,
    pub failure: Option<String>,
    pub exit_code: Option<i32>,
    pub elapsed_ms: u64,
    pub validation: Option<ValidationReport>,
    pub started_at: String,
    pub ended_at: String,
}

impl IterationMeta {
    pub fn new(
        run_id: &str,
        phase_id: &str,
        iteration: u32,
        result: &AgentInvocationResult,
        validation: Option<&ValidationReport>,
        started_at: String,
    ) -> Self {
        let failure = match (&result.failure, validation) {
            (Some(failure), _) => Some(failure.to_string()),
            (None, Some(report)) => report.failure_summary(),
            (None, None) => None,
        };
        Self {
            run_id: run_id.to_string(),
            phase_id: phase_id.to_string(),
            iteration,
            success: validation.is_some_and(|report| report.passed),
            failure,
            exit_code: result.exit_code(),
            elapsed_ms: u64::try_from(result.elapsed.as_millis()).unwrap_or(u64::MAX),
            validation: validation.cloned(),
            started_at,
            ended_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub agent_log_path: PathBuf,
}

impl IterationPaths {
    pub fn new(iterations_dir: &Path, run_id: &str, phase_id: &str, iteration: u32) -> Self {
        let dir = iterations_dir
            .join(run_id)
            .join(phase_id)
            .join(iteration.to_string());
        Self {
            meta_path: dir.join("meta.json"),
            agent_log_path: dir.join("agent.log"),
            dir,
        }
    }
}

/// Write `meta.json` and `agent.log` for one attempt.
pub fn write_iteration(
    iterations_dir: &Path,
    meta: &IterationMeta,
    result: &AgentInvocationResult,
) -> Result<IterationPaths> {
    let paths = IterationPaths::new(iterations_dir, &meta.run_id, &meta.phase_id, meta.iteration);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create iteration dir {}", paths.dir.display()))?;

    let mut buf = serde_json::to_string_pretty(meta)?;
    buf.push('\n');
    write_text(&paths.meta_path, &buf)?;
    write_text(&paths.agent_log_path, &agent_log(result))?;
    Ok(paths)
}

fn agent_log(result: &AgentInvocationResult) -> String {
    let mut log = String::with_capacity(result.stdout.len() + result.stderr.len() + 32);
    log.push_str("=== stdout ===\n");
    log.push_str(&result.stdout);
    if !result.stdout.is_empty() && !result.stdout.ends_with('\n') {
        log.push('\n');
    }
    log.push_str("=== stderr ===\n");
    log.push_str(&result.stderr);
    if !result.stderr.is_empty() && !result.stderr.ends_with('\n') {
        log.push('\n');
    }
    log
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}
