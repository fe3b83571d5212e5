//! Crash recovery: find claims held by dead workers and reopen them.
//!
//! Liveness comes from worker records in every session under the log root,
//! checked against the live process table (PID plus start time). When
//! discarding, the working tree is reverted before the first item is
//! reopened, so a worker starting concurrently never claims an item whose
//! stale edits are still on disk.

use std::collections::HashSet;
use std::io::{self, BufRead, Write};
use std::path::Path;

use anyhow::{Context, Result, bail};
use tracing::{debug, info, instrument, warn};

use crate::core::orphans::{OrphanScan, classify_claims};
use crate::core::types::{ItemStatus, WorkItem};
use crate::io::git::{StatusEntry, WorkingTree};
use crate::io::procs::LivenessProbe;
use crate::io::queue::WorkQueue;
use crate::io::session::{WorkerRecord, WorkerStatus, list_sessions};

/// A recorded worker whose process is still running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveWorker {
    pub record: WorkerRecord,
    /// Latest heartbeat, if the worker wrote one.
    pub status: Option<WorkerStatus>,
}

/// Recorded workers across all sessions whose processes are alive.
pub fn live_workers(log_root: &Path, probe: &impl LivenessProbe) -> Result<Vec<LiveWorker>> {
    let mut live = Vec::new();
    for session in list_sessions(log_root)? {
        for record in session.records()? {
            if record.state.is_terminal() {
                continue;
            }
            if !probe.is_alive(record.pid, record.process_start_time) {
                debug!(
                    worker = %record.worker_id,
                    pid = record.pid,
                    session = %session.session_id,
                    "recorded worker is gone"
                );
                continue;
            }
            let status = match session.read_status(&record.worker_id) {
                Ok(status) => status,
                Err(err) => {
                    warn!(worker = %record.worker_id, err = %err, "unreadable heartbeat");
                    None
                }
            };
            live.push(LiveWorker { record, status });
        }
    }
    Ok(live)
}

/// Split `in_progress` items into live claims and orphans.
#[instrument(skip_all)]
pub fn find_orphaned(
    queue: &impl WorkQueue,
    log_root: &Path,
    probe: &impl LivenessProbe,
) -> Result<OrphanScan> {
    let claimed = queue.list(Some(ItemStatus::InProgress))?;
    let live: HashSet<String> = live_workers(log_root, probe)?
        .into_iter()
        .map(|w| w.record.worker_id)
        .collect();
    let scan = classify_claims(&claimed, &live);
    debug!(
        active = scan.active.len(),
        orphaned = scan.orphaned.len(),
        "classified claims"
    );
    Ok(scan)
}

/// What happened to one orphan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetResult {
    Reopened,
    /// The item changed since the scan (closed, or claimed by someone else).
    Skipped { reason: String },
}

/// Reopen one orphaned item, optionally reverting the working tree first.
///
/// The item is re-read before anything happens; if it is no longer
/// `in_progress` under the same assignee, nothing is touched.
pub fn reset_item(
    queue: &impl WorkQueue,
    tree: &impl WorkingTree,
    item: &WorkItem,
    discard_changes: bool,
    excluded_prefixes: &[&str],
) -> Result<ResetResult> {
    let Some(current) = queue.show(&item.id)? else {
        return Ok(ResetResult::Skipped {
            reason: "item no longer exists".to_string(),
        });
    };
    if current.status != ItemStatus::InProgress {
        return Ok(ResetResult::Skipped {
            reason: format!("item is now {}", current.status),
        });
    }
    if current.assignee() != item.assignee() {
        return Ok(ResetResult::Skipped {
            reason: format!(
                "item was claimed by {} since the scan",
                current.assignee().unwrap_or("nobody")
            ),
        });
    }

    if discard_changes {
        tree.discard(excluded_prefixes)
            .with_context(|| format!("discard changes before reopening {}", item.id))?;
    }
    queue
        .reopen(&item.id)
        .with_context(|| format!("reopen {}", item.id))?;
    info!(id = %item.id, previous_assignee = ?item.assignee(), "reopened orphaned item");
    Ok(ResetResult::Reopened)
}

/// Operator confirmation before a destructive step.
pub trait Confirm {
    fn confirm(&mut self, question: &str) -> Result<bool>;
}

/// Asks on stderr and reads a `y`/`yes` answer from stdin.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdinConfirm;

impl Confirm for StdinConfirm {
    fn confirm(&mut self, question: &str) -> Result<bool> {
        let mut stderr = io::stderr();
        write!(stderr, "{question} [y/N] ").context("write prompt")?;
        stderr.flush().context("flush prompt")?;
        let mut answer = String::new();
        io::stdin()
            .lock()
            .read_line(&mut answer)
            .context("read confirmation")?;
        Ok(matches!(
            answer.trim().to_ascii_lowercase().as_str(),
            "y" | "yes"
        ))
    }
}

#[derive(Debug, Clone, Default)]
pub struct CleanupOptions {
    /// Skip the confirmation prompt.
    pub force: bool,
    pub discard_changes: bool,
    /// Path prefixes never discarded (tracker data, logs, config).
    pub excluded_prefixes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub scan: OrphanScan,
    /// Uncommitted changes found (and discarded unless declined).
    pub changes: Vec<StatusEntry>,
    pub reopened: Vec<String>,
    pub skipped: Vec<(String, String)>,
    /// The operator answered no; nothing was changed.
    pub declined: bool,
}

impl CleanupReport {
    /// Orphans that are still `in_progress` after this run.
    pub fn orphans_remaining(&self) -> bool {
        self.scan.has_orphans() && self.reopened.len() < self.scan.orphaned.len()
    }
}

/// Find orphans, confirm, discard (optionally), and reopen them.
#[instrument(skip_all, fields(force = options.force, discard = options.discard_changes))]
pub fn cleanup(
    queue: &impl WorkQueue,
    tree: &impl WorkingTree,
    log_root: &Path,
    probe: &impl LivenessProbe,
    confirm: &mut impl Confirm,
    options: &CleanupOptions,
) -> Result<CleanupReport> {
    let mut report = CleanupReport {
        scan: find_orphaned(queue, log_root, probe)?,
        ..CleanupReport::default()
    };
    if !report.scan.has_orphans() {
        info!("no orphaned work");
        return Ok(report);
    }

    let excluded: Vec<&str> = options
        .excluded_prefixes
        .iter()
        .map(String::as_str)
        .collect();
    if options.discard_changes {
        if !report.scan.active.is_empty() {
            bail!(
                "refusing to discard changes while {} live worker claim(s) share the working tree; stop the swarm first",
                report.scan.active.len()
            );
        }
        report.changes = tree.pending_changes(&excluded)?;
    }

    if !options.force {
        let mut question = format!(
            "Reset {} orphaned item(s) to open",
            report.scan.orphaned.len()
        );
        if !report.changes.is_empty() {
            question.push_str(&format!(
                " and discard {} uncommitted change(s)",
                report.changes.len()
            ));
        }
        question.push('?');
        if !confirm.confirm(&question)? {
            info!("cleanup declined");
            report.declined = true;
            return Ok(report);
        }
    }

    let mut discard_pending = options.discard_changes && !report.changes.is_empty();
    let orphaned = report.scan.orphaned.clone();
    for item in &orphaned {
        match reset_item(queue, tree, item, discard_pending, &excluded)? {
            ResetResult::Reopened => {
                discard_pending = false;
                report.reopened.push(item.id.clone());
            }
            ResetResult::Skipped { reason } => {
                warn!(id = %item.id, reason, "skipped orphan");
                report.skipped.push((item.id.clone(), reason));
            }
        }
    }
    Ok(report)
}
