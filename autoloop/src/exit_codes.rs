//! Stable exit codes for `autoloop` commands.

use crate::core::types::FailureReason;
use crate::looping::LoopStop;

/// Run completed, or a non-run command succeeded.
pub const OK: i32 = 0;
/// Setup is broken: missing plan, malformed phase id, bad config, nothing to resume.
pub const CONFIG: i32 = 1;
/// Iterations ran out after at least one attempt reached validation.
pub const EXHAUSTED: i32 = 3;
/// Iterations ran out and the agent never exited successfully.
pub const AGENT_FAILURE: i32 = 4;
/// Stopped on request; the run can be resumed.
pub const INTERRUPTED: i32 = 130;

pub fn for_stop(stop: &LoopStop) -> i32 {
    match stop {
        LoopStop::Completed => OK,
        LoopStop::Stopped => INTERRUPTED,
        LoopStop::Failed(FailureReason::Configuration { .. }) => CONFIG,
        LoopStop::Failed(FailureReason::IterationsExhausted {
            agent_never_succeeded: true,
            ..
        }) => AGENT_FAILURE,
        LoopStop::Failed(FailureReason::IterationsExhausted { .. }) => EXHAUSTED,
    }
}
