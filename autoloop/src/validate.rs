//! Outcome validation for one agent attempt.
//!
//! An attempt passes only when the agent reported success AND every tracked
//! issue of the phase is closed. Working-tree changes are logged as evidence
//! but never decide the outcome, and the tracker sync is best-effort.

use std::path::Path;

use tracing::{debug, info, instrument, warn};

use crate::core::types::{AgentInvocationResult, ValidationReport};
use crate::io::git::VcsStatus;
use crate::io::tracker::IssueTracker;

pub struct OutcomeValidator<'a, T: ?Sized, V: ?Sized> {
    tracker: &'a T,
    vcs: &'a V,
}

impl<'a, T, V> OutcomeValidator<'a, T, V>
where
    T: IssueTracker + ?Sized,
    V: VcsStatus + ?Sized,
{
    pub fn new(tracker: &'a T, vcs: &'a V) -> Self {
        Self { tracker, vcs }
    }

    /// True iff the agent succeeded and every id in `issue_ids` is closed.
    pub fn validate(
        &self,
        result: &AgentInvocationResult,
        issue_ids: &[String],
        workdir: &Path,
    ) -> bool {
        self.assess(result, issue_ids, workdir).passed
    }

    /// Run every check and keep the evidence.
    #[instrument(skip_all, fields(issues = issue_ids.len()))]
    pub fn assess(
        &self,
        result: &AgentInvocationResult,
        issue_ids: &[String],
        workdir: &Path,
    ) -> ValidationReport {
        let mut report = ValidationReport {
            agent_success: result.success,
            issues_checked: issue_ids.to_vec(),
            ..ValidationReport::default()
        };
        if !result.success {
            debug!("agent attempt failed, skipping remaining checks");
            return report;
        }

        match self.vcs.pending_changes(workdir) {
            Ok(entries) => {
                info!(pending_changes = entries.len(), "working tree status (advisory)");
                report.pending_changes = Some(entries.len());
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "working tree status unavailable");
                report.vcs_error = Some(format!("{err:#}"));
            }
        }

        report.open_issues = self.tracker.open_issues(issue_ids);
        if !report.open_issues.is_empty() {
            info!(open = ?report.open_issues, "tracked issues still open");
        }

        report.synced = Some(match self.tracker.sync() {
            Ok(()) => true,
            Err(err) => {
                warn!(err = %err, "tracker sync failed (ignored)");
                false
            }
        });

        report.passed = report.open_issues.is_empty();
        report
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::types::InvocationFailure;
    use crate::io::tracker::DisabledTracker;
    use crate::test_support::{FakeTracker, FakeVcs};

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    fn ok_result() -> AgentInvocationResult {
        AgentInvocationResult::succeeded(String::new(), String::new(), Duration::from_secs(1))
    }

    #[test]
    fn one_open_issue_fails_validation() {
        let tracker = FakeTracker::new()
            .with_issue("I-1", "closed")
            .with_issue("I-2", "open");
        let vcs = FakeVcs::with_changes(3);
        let issues = ids(&["I-1", "I-2"]);

        assert!(!tracker.check_all_closed(&issues));
        let validator = OutcomeValidator::new(&tracker, &vcs);
        let report = validator.assess(&ok_result(), &issues, Path::new("."));

        assert!(!report.passed);
        assert_eq!(report.open_issues, ids(&["I-2"]));
        assert_eq!(report.pending_changes, Some(3));
        assert!(!validator.validate(&ok_result(), &issues, Path::new(".")));
    }

    #[test]
    fn unreachable_tracker_fails_closed() {
        let tracker = DisabledTracker;
        let vcs = FakeVcs::with_changes(10);
        let issues = ids(&["I-1", "I-2"]);

        for id in &issues {
            assert!(!tracker.is_issue_closed(id));
        }
        let report = OutcomeValidator::new(&tracker, &vcs).assess(&ok_result(), &issues, Path::new("."));
        assert!(!report.passed);
        assert_eq!(report.open_issues, issues);
        assert_eq!(report.synced, Some(false));
    }

    #[test]
    fn agent_failure_short_circuits_before_tracker() {
        let tracker = FakeTracker::new().with_issue("I-1", "closed");
        let vcs = FakeVcs::with_changes(1);
        let result = AgentInvocationResult::failed(
            InvocationFailure::NonzeroExit { code: Some(1) },
            String::new(),
            String::new(),
            Duration::from_secs(1),
        );

        let report = OutcomeValidator::new(&tracker, &vcs).assess(&result, &ids(&["I-1"]), Path::new("."));
        assert!(!report.passed);
        assert!(tracker.calls().is_empty());
        assert_eq!(report.pending_changes, None);
    }

    #[test]
    fn no_issues_and_no_changes_passes() {
        let tracker = FakeTracker::new();
        let vcs = FakeVcs::with_changes(0);

        let report = OutcomeValidator::new(&tracker, &vcs).assess(&ok_result(), &[], Path::new("."));
        assert!(report.passed);
        assert_eq!(report.pending_changes, Some(0));
    }

    #[test]
    fn vcs_and_sync_failures_are_advisory() {
        let tracker = FakeTracker::new().with_issue("I-1", "done").failing_sync();
        let vcs = FakeVcs::failing("not a git repository");

        let report = OutcomeValidator::new(&tracker, &vcs).assess(&ok_result(), &ids(&["I-1"]), Path::new("."));
        assert!(report.passed);
        assert_eq!(report.synced, Some(false));
        assert!(report.vcs_error.as_deref().is_some_and(|e| e.contains("not a git repository")));
    }
}
