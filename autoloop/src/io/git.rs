//! Git adapter.
//!
//! Version control is read-only here: the working-tree status is advisory
//! evidence for the validator and the HEAD sha seeds run ids. Every call is
//! bounded by a timeout.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument};

use crate::io::process::run_command_with_timeout;

const GIT_OUTPUT_LIMIT: usize = 8 * 1024 * 1024;

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Read-only view of pending working-tree changes.
pub trait VcsStatus {
    fn pending_changes(&self, workdir: &Path) -> Result<Vec<StatusEntry>>;
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    timeout: Duration,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            workdir: workdir.into(),
            timeout,
        }
    }

    /// Return the current HEAD short SHA.
    pub fn head_short_sha(&self, len: usize) -> Result<String> {
        let arg = format!("--short={len}");
        let out = self.run_capture(&["rev-parse", &arg, "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Get status entries (including untracked) in porcelain format.
    #[instrument(skip_all)]
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        debug!(count = entries.len(), "working tree status");
        Ok(entries)
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        let output = run_command_with_timeout(cmd, None, self.timeout, GIT_OUTPUT_LIMIT)?;
        if output.timed_out {
            return Err(anyhow!(
                "git {} timed out after {}s",
                args.join(" "),
                self.timeout.as_secs()
            ));
        }
        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                output.stderr_lossy().trim()
            ));
        }
        Ok(output.stdout_lossy())
    }
}

/// [`VcsStatus`] backed by `git status`.
#[derive(Debug, Clone)]
pub struct GitStatus {
    timeout: Duration,
}

impl GitStatus {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl VcsStatus for GitStatus {
    fn pending_changes(&self, workdir: &Path) -> Result<Vec<StatusEntry>> {
        Git::new(workdir, self.timeout).status_porcelain()
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 || !line.is_char_boundary(2) || !line.is_char_boundary(3) {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}
