//! Stable exit codes for swarm CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid project, config, or arguments, or any other error.
pub const INVALID: i32 = 1;
/// `swarm cleanup` was declined and orphaned work is still claimed.
pub const ORPHANS_REMAIN: i32 = 2;
/// A worker abandoned its item after the agent timed out; the item stays
/// `in_progress` for `swarm cleanup`.
pub const WORKER_ABANDONED: i32 = 3;
/// Workers were still running when the stop grace period ended.
pub const STILL_RUNNING: i32 = 4;
