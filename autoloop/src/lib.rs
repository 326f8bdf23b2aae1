//! Bounded, retryable agent loop.
//!
//! Drives an external code-generation agent through plan phases until
//! externally verifiable completion signals are observed: a successful agent
//! exit plus closure of the phase's tracked issues. The layering is strict:
//!
//! - **[`core`]**: pure, deterministic logic (run state machine, plan discovery,
//!   status normalization). No I/O.
//! - **[`io`]**: side-effecting adapters (subprocesses, issue tracker, git,
//!   checkpoint and config files).
//!
//! [`validate`] and [`looping`] compose the two into the outcome validator and
//! the loop runner.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod validate;
