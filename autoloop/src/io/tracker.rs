//! Issue tracker adapter.
//!
//! The loop talks to a dependency-aware issue tracker only through a small
//! command surface (`ready`, `update`, `show`, `sync`). Every operation returns
//! a tagged [`TrackerResult`]; nothing here panics or aborts the loop. Closure
//! checks fail closed: an issue that cannot be queried is never "closed".

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::status::normalize_status;
use crate::core::types::{IssueState, TrackedIssue};
use crate::io::process::{CommandOutput, is_not_found, run_command_with_timeout};

/// Output kept from a tracker command; tracker payloads are small.
const TRACKER_OUTPUT_LIMIT: usize = 4 * 1024 * 1024;

/// Failure of a single tracker operation.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("issue tracker integration is disabled")]
    Disabled,
    #[error("issue tracker '{program}' is not installed")]
    NotInstalled { program: String },
    #[error("`{command}` timed out after {timeout_secs}s")]
    TimedOut { command: String, timeout_secs: u64 },
    #[error("`{command}` failed with status {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("could not parse output of `{command}`: {message}")]
    Parse { command: String, message: String },
    #[error("could not run `{command}`: {message}")]
    Io { command: String, message: String },
}

pub type TrackerResult<T> = Result<T, TrackerError>;

/// Operations the loop needs from an issue tracker.
pub trait IssueTracker {
    /// Issues with no unresolved blocking dependency, most-ready first.
    fn fetch_ready_issues(&self, limit: u32) -> TrackerResult<Vec<TrackedIssue>>;

    fn update_status(&self, issue_id: &str, status: &str) -> TrackerResult<()>;

    /// Full record for one issue.
    fn show_issue(&self, issue_id: &str) -> TrackerResult<TrackedIssue>;

    /// Push/pull tracker state (best-effort for callers).
    fn sync(&self) -> TrackerResult<()>;

    /// True only if the issue could be queried and its status is closed-equivalent.
    fn is_issue_closed(&self, issue_id: &str) -> bool {
        match self.show_issue(issue_id) {
            Ok(issue) => {
                debug!(issue = issue_id, status = %issue.raw_status, "issue status");
                issue.state == IssueState::Closed
            }
            Err(err) => {
                warn!(issue = issue_id, err = %err, "issue status unavailable, treating as open");
                false
            }
        }
    }

    /// True iff every id is closed; vacuously true for an empty set.
    fn check_all_closed(&self, issue_ids: &[String]) -> bool {
        issue_ids.iter().all(|id| self.is_issue_closed(id))
    }

    /// Ids from `issue_ids` that are not closed (including unqueryable ones).
    fn open_issues(&self, issue_ids: &[String]) -> Vec<String> {
        issue_ids
            .iter()
            .filter(|id| !self.is_issue_closed(id))
            .cloned()
            .collect()
    }
}

/// Tracker used when integration is turned off in config.
pub struct DisabledTracker;

impl IssueTracker for DisabledTracker {
    fn fetch_ready_issues(&self, _limit: u32) -> TrackerResult<Vec<TrackedIssue>> {
        Err(TrackerError::Disabled)
    }

    fn update_status(&self, _issue_id: &str, _status: &str) -> TrackerResult<()> {
        Err(TrackerError::Disabled)
    }

    fn show_issue(&self, _issue_id: &str) -> TrackerResult<TrackedIssue> {
        Err(TrackerError::Disabled)
    }

    fn sync(&self) -> TrackerResult<()> {
        Err(TrackerError::Disabled)
    }
}

/// Adapter for a `bd`-style command line tracker with JSON output.
#[derive(Debug, Clone)]
pub struct CliTracker {
    program: String,
    prefix_args: Vec<String>,
    workdir: PathBuf,
    timeout: Duration,
}

impl CliTracker {
    pub fn new(command: &[String], workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        let (program, prefix_args) = match command.split_first() {
            Some((program, rest)) => (program.clone(), rest.to_vec()),
            None => ("bd".to_string(), Vec::new()),
        };
        Self {
            program,
            prefix_args,
            workdir: workdir.into(),
            timeout,
        }
    }

    fn describe(&self, args: &[&str]) -> String {
        let mut parts = vec![self.program.as_str()];
        parts.extend(self.prefix_args.iter().map(String::as_str));
        parts.extend(args);
        parts.join(" ")
    }

    fn run(&self, args: &[&str]) -> TrackerResult<CommandOutput> {
        let command = self.describe(args);
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.prefix_args)
            .args(args)
            .current_dir(&self.workdir);

        let output = run_command_with_timeout(cmd, None, self.timeout, TRACKER_OUTPUT_LIMIT)
            .map_err(|err| {
                if is_not_found(&err) {
                    TrackerError::NotInstalled {
                        program: self.program.clone(),
                    }
                } else {
                    TrackerError::Io {
                        command: command.clone(),
                        message: format!("{err:#}"),
                    }
                }
            })?;

        if output.timed_out {
            return Err(TrackerError::TimedOut {
                command,
                timeout_secs: self.timeout.as_secs(),
            });
        }
        if !output.status.success() {
            return Err(TrackerError::CommandFailed {
                command,
                code: output.status.code(),
                stderr: output.stderr_lossy().trim().to_string(),
            });
        }
        Ok(output)
    }

    fn run_json(&self, args: &[&str]) -> TrackerResult<Value> {
        let output = self.run(args)?;
        serde_json::from_slice(&output.stdout).map_err(|err| TrackerError::Parse {
            command: self.describe(args),
            message: err.to_string(),
        })
    }
}

impl IssueTracker for CliTracker {
    #[instrument(skip_all, fields(limit))]
    fn fetch_ready_issues(&self, limit: u32) -> TrackerResult<Vec<TrackedIssue>> {
        let limit_arg = limit.to_string();
        let args = ["ready", "--json", "--limit", limit_arg.as_str()];
        let value = self.run_json(&args)?;
        let items = match value {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => vec![other],
        };
        let mut issues = items
            .iter()
            .map(parse_issue)
            .collect::<Result<Vec<_>, String>>()
            .map_err(|message| TrackerError::Parse {
                command: self.describe(&args),
                message,
            })?;
        issues.truncate(limit as usize);
        debug!(count = issues.len(), "ready issues");
        Ok(issues)
    }

    #[instrument(skip_all, fields(issue = issue_id, status))]
    fn update_status(&self, issue_id: &str, status: &str) -> TrackerResult<()> {
        self.run(&["update", issue_id, "--status", status])?;
        Ok(())
    }

    #[instrument(skip_all, fields(issue = issue_id))]
    fn show_issue(&self, issue_id: &str) -> TrackerResult<TrackedIssue> {
        let args = ["show", issue_id, "--json"];
        let value = self.run_json(&args)?;
        let record = match &value {
            Value::Array(items) => items.iter().find(|item| issue_id_of(item) == Some(issue_id)),
            other => Some(other),
        };
        let parse_error = |message: String| TrackerError::Parse {
            command: self.describe(&args),
            message,
        };
        let record = record.ok_or_else(|| parse_error(format!("no record for issue '{issue_id}'")))?;
        let issue = parse_issue(record).map_err(parse_error)?;
        if issue.id != issue_id {
            return Err(parse_error(format!(
                "asked for issue '{issue_id}' but got '{}'",
                issue.id
            )));
        }
        Ok(issue)
    }

    fn sync(&self) -> TrackerResult<()> {
        self.run(&["sync"])?;
        Ok(())
    }
}

fn issue_id_of(value: &Value) -> Option<&str> {
    value.get("id").and_then(Value::as_str)
}

/// Parse one tracker record. `id` and `status` are required.
fn parse_issue(value: &Value) -> Result<TrackedIssue, String> {
    let id = issue_id_of(value)
        .ok_or_else(|| "issue record without string 'id'".to_string())?
        .to_string();
    let raw_status = value
        .get("status")
        .and_then(Value::as_str)
        .ok_or_else(|| format!("issue '{id}' has no string 'status'"))?
        .to_string();
    let title = value.get("title").and_then(Value::as_str).map(str::to_string);

    let mut blocked_by: Vec<String> = value
        .get("blocked_by")
        .and_then(Value::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if let Some(deps) = value.get("dependencies").and_then(Value::as_array) {
        for dep in deps {
            let kind = dep
                .get("type")
                .or_else(|| dep.get("dependency_type"))
                .and_then(Value::as_str)
                .unwrap_or("blocks");
            if kind != "blocks" {
                continue;
            }
            let target = dep
                .get("depends_on_id")
                .or_else(|| dep.get("id"))
                .and_then(Value::as_str)
                .or_else(|| dep.as_str());
            if let Some(target) = target
                && target != id
                && !blocked_by.iter().any(|b| b == target)
            {
                blocked_by.push(target.to_string());
            }
        }
    }

    Ok(TrackedIssue {
        state: normalize_status(&raw_status),
        id,
        title,
        raw_status,
        blocked_by,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_issue_with_dependencies() {
        let issue = parse_issue(&json!({
            "id": "bd-12",
            "title": "Wire auth",
            "status": "in_progress",
            "dependencies": [
                {"depends_on_id": "bd-3", "type": "blocks"},
                {"depends_on_id": "bd-4", "type": "related"},
                "bd-5"
            ]
        }))
        .expect("parse");

        assert_eq!(issue.id, "bd-12");
        assert_eq!(issue.title.as_deref(), Some("Wire auth"));
        assert_eq!(issue.state, IssueState::Open);
        assert_eq!(issue.blocked_by, vec!["bd-3", "bd-5"]);
    }

    #[test]
    fn done_status_parses_as_closed() {
        let issue = parse_issue(&json!({"id": "I-1", "status": "done"})).expect("parse");
        assert_eq!(issue.state, IssueState::Closed);
        assert_eq!(issue.raw_status, "done");
    }

    #[test]
    fn record_without_status_is_rejected() {
        let err = parse_issue(&json!({"id": "I-1"})).unwrap_err();
        assert!(err.contains("status"));
    }

    #[test]
    fn disabled_tracker_fails_closed() {
        let tracker = DisabledTracker;
        assert!(!tracker.is_issue_closed("I-1"));
        assert!(!tracker.check_all_closed(&["I-1".to_string()]));
        assert!(tracker.check_all_closed(&[]));
    }

    #[test]
    fn missing_tracker_binary_fails_closed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tracker = CliTracker::new(
            &["autoloop-no-such-tracker".to_string()],
            temp.path(),
            Duration::from_secs(5),
        );

        assert!(matches!(
            tracker.show_issue("I-1"),
            Err(TrackerError::NotInstalled { .. })
        ));
        assert!(!tracker.is_issue_closed("I-1"));
        assert!(!tracker.check_all_closed(&["I-1".to_string(), "I-2".to_string()]));
        assert!(matches!(tracker.sync(), Err(TrackerError::NotInstalled { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn cli_tracker_reads_show_and_ready_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = temp.path().join("fake-bd");
        std::fs::write(
            &script,
            "#!/bin/sh\n\
             case \"$1\" in\n\
             show) echo \"[{\\\"id\\\": \\\"$2\\\", \\\"status\\\": \\\"closed\\\"}]\" ;;\n\
             ready) echo '[{\"id\": \"I-7\", \"status\": \"open\"}, {\"id\": \"I-8\", \"status\": \"open\"}]' ;;\n\
             update) exit 0 ;;\n\
             *) echo \"unknown $1\" >&2; exit 2 ;;\n\
             esac\n",
        )
        .expect("write script");
        let tracker = CliTracker::new(
            &["sh".to_string(), script.display().to_string()],
            temp.path(),
            Duration::from_secs(5),
        );

        let issue = tracker.show_issue("I-1").expect("show");
        assert_eq!(issue.state, IssueState::Closed);
        assert!(tracker.is_issue_closed("I-1"));

        let ready = tracker.fetch_ready_issues(1).expect("ready");
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, "I-7");

        tracker.update_status("I-7", "in_progress").expect("update");
        assert!(matches!(
            tracker.sync(),
            Err(TrackerError::CommandFailed { code: Some(2), .. })
        ));
    }
}
