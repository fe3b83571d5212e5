//! `swarm status`: queue summary, live workers, and orphaned work.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::path::Path;

use anyhow::Result;

use crate::core::orphans::{OrphanScan, classify_claims};
use crate::core::selector::sort_by_selection_order;
use crate::core::tree::render_dependency_tree;
use crate::core::types::{ItemKind, ItemStatus, WorkItem};
use crate::io::procs::LivenessProbe;
use crate::io::queue::WorkQueue;
use crate::recovery::{LiveWorker, live_workers};

const READY_PREVIEW: usize = 10;
const BAR_CELLS: usize = 40;

/// The one-line verdict every status report ends with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Headline {
    OrphanedWork,
    WorkersRunning,
    ReadyWorkWaiting,
    NoReadyWork,
}

impl Headline {
    pub fn as_str(self) -> &'static str {
        match self {
            Headline::OrphanedWork => "orphaned work exists",
            Headline::WorkersRunning => "workers still running",
            Headline::ReadyWorkWaiting => "ready work waiting",
            Headline::NoReadyWork => "no ready work",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StatusOptions {
    /// Append every item.
    pub all: bool,
    /// Append the dependency tree.
    pub tree: bool,
}

/// Snapshot of the queue and the workers serving it.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub items: Vec<WorkItem>,
    /// Open, unassigned items with dependencies met, in selection order.
    pub ready: Vec<WorkItem>,
    pub live: Vec<LiveWorker>,
    pub claims: OrphanScan,
}

/// Gather a status snapshot from the queue and session records.
pub fn collect_status(
    queue: &impl WorkQueue,
    log_root: &Path,
    probe: &impl LivenessProbe,
) -> Result<StatusReport> {
    let items = queue.list(None)?;
    let mut ready = queue.list_ready(true)?;
    sort_by_selection_order(&mut ready);
    let live = live_workers(log_root, probe)?;
    let live_ids: HashSet<String> = live.iter().map(|w| w.record.worker_id.clone()).collect();
    let claims = classify_claims(&items, &live_ids);
    Ok(StatusReport {
        items,
        ready,
        live,
        claims,
    })
}

impl StatusReport {
    /// Orphans outrank live workers, which outrank waiting work.
    pub fn headline(&self) -> Headline {
        if self.claims.has_orphans() {
            Headline::OrphanedWork
        } else if !self.live.is_empty() {
            Headline::WorkersRunning
        } else if !self.ready.is_empty() {
            Headline::ReadyWorkWaiting
        } else {
            Headline::NoReadyWork
        }
    }

    fn count(&self, status: ItemStatus) -> usize {
        self.items.iter().filter(|i| i.status == status).count()
    }

    pub fn render(&self, options: StatusOptions) -> String {
        let mut out = String::new();
        let total = self.items.len();
        let closed = self.count(ItemStatus::Closed);

        let _ = writeln!(out, "Issues: {total}");
        for status in [ItemStatus::Open, ItemStatus::InProgress, ItemStatus::Closed] {
            let n = self.count(status);
            let _ = writeln!(
                out,
                "  {:<12} {n:>4}  {:>5.1}%",
                status.as_str(),
                percent(n, total)
            );
        }

        let mut by_kind: BTreeMap<&str, usize> = BTreeMap::new();
        for item in &self.items {
            let kind = item.kind.map_or("unknown", ItemKind::as_str);
            *by_kind.entry(kind).or_default() += 1;
        }
        if !by_kind.is_empty() {
            let kinds: Vec<String> = by_kind.iter().map(|(k, n)| format!("{k} {n}")).collect();
            let _ = writeln!(out, "By type: {}", kinds.join(", "));
        }
        let _ = writeln!(
            out,
            "Progress {} {:.1}%",
            progress_bar(closed, total),
            percent(closed, total)
        );

        let _ = writeln!(out);
        if self.ready.is_empty() {
            let _ = writeln!(out, "Ready: none");
        } else {
            let _ = writeln!(out, "Ready ({}):", self.ready.len());
            for item in self.ready.iter().take(READY_PREVIEW) {
                let _ = writeln!(out, "  {}", item_line(item));
            }
            if self.ready.len() > READY_PREVIEW {
                let _ = writeln!(out, "  ... and {} more", self.ready.len() - READY_PREVIEW);
            }
        }

        let mut per_worker: BTreeMap<&str, usize> = BTreeMap::new();
        for item in &self.items {
            if item.status == ItemStatus::InProgress {
                let owner = item.assignee().unwrap_or("(unassigned)");
                *per_worker.entry(owner).or_default() += 1;
            }
        }
        if !per_worker.is_empty() {
            let _ = writeln!(out, "In progress:");
            for (worker, n) in &per_worker {
                let _ = writeln!(out, "  {worker}: {n}");
            }
        }

        let _ = writeln!(out);
        if self.live.is_empty() {
            let _ = writeln!(out, "Workers: none running");
        } else {
            let _ = writeln!(out, "Workers ({} running):", self.live.len());
            for worker in &self.live {
                let (state, item) = match &worker.status {
                    Some(status) => (
                        format!("{}/{}", status.state, status.phase),
                        status.current_item.as_deref().unwrap_or("-").to_string(),
                    ),
                    None => (worker.record.state.to_string(), "-".to_string()),
                };
                let _ = writeln!(
                    out,
                    "  {:<10} pid {:<7} {:<22} {item}",
                    worker.record.worker_id, worker.record.pid, state
                );
            }
        }

        if self.claims.has_orphans() {
            let ids: Vec<&str> = self.claims.orphaned.iter().map(|i| i.id.as_str()).collect();
            let _ = writeln!(
                out,
                "Orphaned: {} item(s) ({}); run `swarm cleanup` to reset",
                ids.len(),
                ids.join(", ")
            );
        }

        if options.all {
            let mut all = self.items.clone();
            sort_by_selection_order(&mut all);
            let _ = writeln!(out);
            let _ = writeln!(out, "All issues:");
            for item in &all {
                let owner = item
                    .assignee()
                    .map(|a| format!(" @{a}"))
                    .unwrap_or_default();
                let _ = writeln!(
                    out,
                    "  {:<11} {}{owner}",
                    item.status.as_str(),
                    item_line(item)
                );
            }
        }
        if options.tree {
            let _ = writeln!(out);
            let _ = writeln!(out, "{}", render_dependency_tree(&self.items));
        }

        let _ = writeln!(out);
        let _ = write!(out, "State: {}", self.headline().as_str());
        out
    }
}

fn item_line(item: &WorkItem) -> String {
    format!(
        "P{} {} [{}] {}",
        item.priority,
        item.id,
        item.kind.map_or("?", ItemKind::as_str),
        item.title
    )
}

fn percent(n: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        n as f64 * 100.0 / total as f64
    }
}

fn progress_bar(done: usize, total: usize) -> String {
    let filled = if total == 0 {
        0
    } else {
        done * BAR_CELLS / total
    };
    format!("[{}{}]", "█".repeat(filled), "░".repeat(BAR_CELLS - filled))
}
