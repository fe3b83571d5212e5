//! Worker swarm orchestrator.
//!
//! Runs N independent worker processes against a shared work queue (the
//! beads `bd` tracker). Each worker repeatedly selects the highest-priority
//! ready item, claims it atomically, hands it to an implementation agent,
//! and closes it once verified. Epics are decomposed into child items
//! instead of being implemented.
//!
//! - **[`core`]**: Pure, deterministic logic (selection, idle policy, orphan
//!   classification, cycle checks). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (tracker CLI, agent CLI, git,
//!   processes, session files).
//!
//! Orchestration modules ([`worker`], [`swarm`], [`recovery`], [`status`])
//! coordinate core logic with I/O to implement CLI commands.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod recovery;
pub mod status;
pub mod swarm;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod worker;
