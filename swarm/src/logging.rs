//! Tracing setup for the controller and worker processes.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: diagnostics via `RUST_LOG`, output to stderr.
//!   A worker's stderr is its per-session log file, so workers default to
//!   `info` while the interactive commands stay quiet.
//!
//! - **Iteration logging (`io/iteration_log`)**: Product artifacts in
//!   `logs/<session>/iterations/`. Always written, unaffected by `RUST_LOG`.

use std::io::IsTerminal;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter for interactive commands.
pub const CONTROLLER_FILTER: &str = "warn,swarm=info";
/// Filter for worker processes.
pub const WORKER_FILTER: &str = "info";

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; falls back to `default_filter` if unset.
/// Output: stderr, compact format, colored only on a terminal.
///
/// # Example
/// ```bash
/// RUST_LOG=swarm=debug swarm start -w 3
/// ```
pub fn init(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(std::io::stderr().is_terminal())
                .compact(),
        )
        .init();
}
