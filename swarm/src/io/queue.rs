//! Narrow contract with the external work-tracking system.
//!
//! Every coordination decision between workers goes through [`WorkQueue`];
//! workers share no memory. `claim` must be a compare-and-swap on
//! `(id, status)`: the tracker, not the swarm, guarantees that an item is
//! never `in_progress` under two live assignees.

use std::error::Error;
use std::fmt;

use anyhow::Result;
use tracing::warn;

use crate::core::idle::Backoff;
use crate::core::types::{ClaimOutcome, ItemStatus, NewItem, WorkItem};

/// Operations the swarm needs from the work-tracking system.
///
/// Implementations must be safe under concurrent use from many processes.
pub trait WorkQueue {
    /// Items with status `open` and all dependencies closed.
    fn list_ready(&self, unassigned_only: bool) -> Result<Vec<WorkItem>>;

    /// Items in `status`, or every item when `None`.
    fn list(&self, status: Option<ItemStatus>) -> Result<Vec<WorkItem>>;

    /// Fresh read of a single item.
    fn show(&self, id: &str) -> Result<Option<WorkItem>>;

    /// Atomically move `open` → `in_progress` with `worker_id` as assignee.
    fn claim(&self, id: &str, worker_id: &str) -> Result<ClaimOutcome>;

    /// Move `in_progress` → `closed`; only the current assignee may close.
    fn close(&self, id: &str, worker_id: &str, reason: &str) -> Result<()>;

    /// Move `in_progress` → `open` and clear the assignee (recovery only).
    fn reopen(&self, id: &str) -> Result<()>;

    /// Insert a new open, unassigned item and return its id.
    fn create(&self, item: &NewItem) -> Result<String>;

    /// Record that `child_id` depends on `parent_id`; cycles are rejected.
    fn link_dependency(&self, child_id: &str, parent_id: &str) -> Result<()>;
}

impl<T: WorkQueue + ?Sized> WorkQueue for &T {
    fn list_ready(&self, unassigned_only: bool) -> Result<Vec<WorkItem>> {
        (**self).list_ready(unassigned_only)
    }

    fn list(&self, status: Option<ItemStatus>) -> Result<Vec<WorkItem>> {
        (**self).list(status)
    }

    fn show(&self, id: &str) -> Result<Option<WorkItem>> {
        (**self).show(id)
    }

    fn claim(&self, id: &str, worker_id: &str) -> Result<ClaimOutcome> {
        (**self).claim(id, worker_id)
    }

    fn close(&self, id: &str, worker_id: &str, reason: &str) -> Result<()> {
        (**self).close(id, worker_id, reason)
    }

    fn reopen(&self, id: &str) -> Result<()> {
        (**self).reopen(id)
    }

    fn create(&self, item: &NewItem) -> Result<String> {
        (**self).create(item)
    }

    fn link_dependency(&self, child_id: &str, parent_id: &str) -> Result<()> {
        (**self).link_dependency(child_id, parent_id)
    }
}

/// Transient failure talking to the work-tracking system.
///
/// Callers retry these with backoff instead of treating them as crashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueUnavailable {
    pub op: String,
    pub detail: String,
}

impl fmt::Display for QueueUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "work queue unavailable during {}: {}",
            self.op, self.detail
        )
    }
}

impl Error for QueueUnavailable {}

/// A worker tried to act on an item it does not hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotClaimOwner {
    pub id: String,
    pub expected: String,
    pub actual: Option<String>,
    pub status: ItemStatus,
}

impl fmt::Display for NotClaimOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} is {} under {} (expected in_progress under {})",
            self.id,
            self.status,
            self.actual.as_deref().unwrap_or("nobody"),
            self.expected
        )
    }
}

impl Error for NotClaimOwner {}

/// Adding a dependency edge would create a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyCycle {
    pub child: String,
    pub parent: String,
}

impl fmt::Display for DependencyCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dependency {} -> {} would create a cycle",
            self.child, self.parent
        )
    }
}

impl Error for DependencyCycle {}

/// Check that `item` is `in_progress` under `worker_id`.
pub fn ensure_owner(item: &WorkItem, worker_id: &str) -> Result<()> {
    if item.status == ItemStatus::InProgress && item.assignee() == Some(worker_id) {
        return Ok(());
    }
    Err(NotClaimOwner {
        id: item.id.clone(),
        expected: worker_id.to_string(),
        actual: item.assignee().map(str::to_string),
        status: item.status,
    }
    .into())
}

/// Retry schedule for transient queue failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first call.
    pub attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Run `op`, retrying only [`QueueUnavailable`] failures.
    ///
    /// `sleep` receives each delay so callers can make waiting interruptible.
    pub fn run<T, F, S>(&self, op_name: &str, mut op: F, mut sleep: S) -> Result<T>
    where
        F: FnMut() -> Result<T>,
        S: FnMut(std::time::Duration) -> bool,
    {
        let mut attempt = 1u32;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let transient = err.downcast_ref::<QueueUnavailable>().is_some();
                    if !transient || attempt >= self.attempts.max(1) {
                        return Err(err);
                    }
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        op = op_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        err = %err,
                        "work queue unavailable, retrying"
                    );
                    if !sleep(delay) {
                        return Err(err);
                    }
                    attempt += 1;
                }
            }
        }
    }
}
