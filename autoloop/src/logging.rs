//! Operator diagnostics via `tracing`.
//!
//! - **Tracing (this module)**: diagnostics filtered by `RUST_LOG`, written to
//!   stderr. Not persisted.
//! - **Iteration logs (`io/iteration_log`)**: product artifacts under
//!   `.autoloop/iterations/`. Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "warn,autoloop=info";

/// Initialize the global subscriber.
///
/// Reads `RUST_LOG`; defaults to `info` for this crate and `warn` elsewhere.
///
/// ```bash
/// RUST_LOG=autoloop=debug autoloop run --plan PLAN.md
/// ```
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    // A second init (e.g. from tests) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
