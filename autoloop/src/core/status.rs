//! Normalization of tracker status strings.

use crate::core::types::IssueState;

/// Tracker terms that mean "no further work required".
const CLOSED_EQUIVALENTS: [&str; 3] = ["closed", "done", "complete"];

/// Map a raw tracker status onto `Open`/`Closed`.
///
/// Matching ignores ASCII case and surrounding whitespace. Anything that is not
/// a closed-equivalent term (including empty strings) is `Open`.
pub fn normalize_status(raw: &str) -> IssueState {
    let trimmed = raw.trim();
    if CLOSED_EQUIVALENTS
        .iter()
        .any(|term| trimmed.eq_ignore_ascii_case(term))
    {
        IssueState::Closed
    } else {
        IssueState::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_equivalents_normalize_to_closed() {
        for raw in ["closed", "done", "complete", "CLOSED", " Done\n"] {
            assert_eq!(normalize_status(raw), IssueState::Closed, "{raw:?}");
        }
    }

    #[test]
    fn other_statuses_normalize_to_open() {
        for raw in ["open", "in_progress", "blocked", "completed-ish", "", "tombstone"] {
            assert_eq!(normalize_status(raw), IssueState::Open, "{raw:?}");
        }
    }
}
