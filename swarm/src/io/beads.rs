//! [`WorkQueue`] backed by the beads issue tracker (`bd` CLI).
//!
//! Every call shells out to `bd ... --json` in the project root. Beads owns
//! the atomic claim (`bd update --claim`); this adapter only maps its output
//! and failures onto the queue contract.

use std::path::PathBuf;
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::types::{
    ClaimOutcome, ItemKind, ItemStatus, LOWEST_PRIORITY, NewItem, WorkItem, priority_from_label,
};
use crate::io::process::{CommandOutput, RunOptions, run_command};
use crate::io::queue::{DependencyCycle, QueueUnavailable, WorkQueue, ensure_owner};

/// Environment variable beads reads to attribute changes to an actor.
pub const ACTOR_ENV: &str = "BD_ACTOR";

const OUTPUT_LIMIT_BYTES: usize = 8 * 1024 * 1024;

static TRANSIENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)database is locked|\bbusy\b|timed? ?out|connection (refused|reset)|temporarily unavailable|try again")
        .expect("valid transient regex")
});

static CONTENTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)already (claimed|assigned|in.progress)|not open|cannot claim")
        .expect("valid contention regex")
});

static NOT_FOUND_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)not found|no issue").expect("valid not-found regex"));

static CYCLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)cycle").expect("valid cycle regex"));

/// Issue record as emitted by `bd ... --json`.
#[derive(Debug, Deserialize)]
struct BeadRecord {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default, alias = "type")]
    issue_type: Option<String>,
    #[serde(default)]
    assignee: Option<String>,
    #[serde(default)]
    priority: Option<Value>,
    #[serde(default)]
    dependencies: Option<Vec<DependencyRef>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DependencyRef {
    Id(String),
    Record {
        #[serde(alias = "id")]
        depends_on_id: String,
    },
}

impl BeadRecord {
    fn into_item(self) -> Result<WorkItem> {
        let status = parse_status(self.status.as_deref().unwrap_or("open"))
            .with_context(|| format!("issue {}", self.id))?;
        let kind = self.issue_type.as_deref().and_then(ItemKind::parse);
        if kind.is_none() {
            debug!(id = %self.id, raw = ?self.issue_type, "issue has no recognized kind");
        }
        let priority = match &self.priority {
            Some(Value::Number(n)) => n
                .as_u64()
                .map_or(LOWEST_PRIORITY, |n| n.min(u8::MAX as u64) as u8),
            Some(Value::String(s)) => priority_from_label(s),
            _ => 2,
        };
        let dependencies = self
            .dependencies
            .unwrap_or_default()
            .into_iter()
            .map(|d| match d {
                DependencyRef::Id(id) => id,
                DependencyRef::Record { depends_on_id } => depends_on_id,
            })
            .collect();
        Ok(WorkItem {
            id: self.id,
            title: self.title,
            description: self.description.unwrap_or_default(),
            kind,
            status,
            assignee: self.assignee.filter(|a| !a.trim().is_empty()),
            priority,
            dependencies,
        })
    }
}

fn parse_status(raw: &str) -> Result<ItemStatus> {
    match raw.trim() {
        "open" | "blocked" => Ok(ItemStatus::Open),
        "in_progress" => Ok(ItemStatus::InProgress),
        "closed" => Ok(ItemStatus::Closed),
        other => Err(anyhow!("unknown status '{other}'")),
    }
}

/// Parse a JSON array (or `null`/empty output) of issues.
///
/// Records with an unknown status are skipped with a warning.
fn parse_items(raw: &str) -> Result<Vec<WorkItem>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }
    let records: Vec<BeadRecord> = serde_json::from_str(trimmed).context("parse bd issue list")?;
    let mut items = Vec::with_capacity(records.len());
    for record in records {
        match record.into_item() {
            Ok(item) => items.push(item),
            Err(err) => warn!(err = %err, "skipping issue"),
        }
    }
    Ok(items)
}

/// Parse `bd show`/`bd create` output, which may be a single object or a list.
fn parse_single(raw: &str) -> Result<Option<WorkItem>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(None);
    }
    let value: Value = serde_json::from_str(trimmed).context("parse bd issue")?;
    let record = match value {
        Value::Array(mut list) => {
            if list.is_empty() {
                return Ok(None);
            }
            list.swap_remove(0)
        }
        other => other,
    };
    let record: BeadRecord = serde_json::from_value(record).context("decode bd issue")?;
    record.into_item().map(Some)
}

/// Work queue adapter for the `bd` command-line tool.
#[derive(Debug, Clone)]
pub struct BeadsQueue {
    workdir: PathBuf,
    program: PathBuf,
    timeout: Duration,
}

impl BeadsQueue {
    pub fn new(workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            workdir: workdir.into(),
            program: PathBuf::from("bd"),
            timeout,
        }
    }

    /// Use a different executable instead of `bd` on `PATH`.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    fn command(&self, args: &[&str], actor: Option<&str>) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(args).current_dir(&self.workdir);
        if let Some(actor) = actor {
            cmd.env(ACTOR_ENV, actor);
        }
        cmd
    }

    /// Run `bd` and return its output, mapping timeouts and lock errors to
    /// [`QueueUnavailable`]. Non-zero exits are returned to the caller.
    fn exec(&self, op: &str, args: &[&str], actor: Option<&str>) -> Result<CommandOutput> {
        let output = run_command(
            self.command(args, actor),
            RunOptions::new(self.timeout, OUTPUT_LIMIT_BYTES),
        )
        .with_context(|| format!("run {} {}", self.program.display(), args.join(" ")))?;
        if output.timed_out {
            return Err(QueueUnavailable {
                op: op.to_string(),
                detail: format!("timed out after {:?}", self.timeout),
            }
            .into());
        }
        if !output.status.success() {
            let stderr = output.stderr_lossy();
            if TRANSIENT_RE.is_match(&stderr) {
                return Err(QueueUnavailable {
                    op: op.to_string(),
                    detail: stderr.trim().to_string(),
                }
                .into());
            }
        }
        Ok(output)
    }

    /// `Claimed` iff a fresh read shows `worker_id` holding `id`.
    fn claim_holder_outcome(&self, id: &str, worker_id: &str) -> Result<ClaimOutcome> {
        match self.show(id)? {
            Some(item) if ensure_owner(&item, worker_id).is_ok() => Ok(ClaimOutcome::Claimed),
            _ => {
                debug!(id, "claim lost");
                Ok(ClaimOutcome::AlreadyClaimed)
            }
        }
    }

    /// Like [`Self::exec`] but any non-zero exit is an error.
    fn exec_checked(&self, op: &str, args: &[&str], actor: Option<&str>) -> Result<String> {
        let output = self.exec(op, args, actor)?;
        if !output.status.success() {
            return Err(anyhow!(
                "bd {} failed: {}",
                args.join(" "),
                output.stderr_lossy().trim()
            ));
        }
        Ok(output.stdout_lossy())
    }
}

impl WorkQueue for BeadsQueue {
    #[instrument(skip(self))]
    fn list_ready(&self, unassigned_only: bool) -> Result<Vec<WorkItem>> {
        let mut args = vec!["ready", "--json"];
        if unassigned_only {
            args.push("--unassigned");
        }
        let stdout = self.exec_checked("list_ready", &args, None)?;
        let mut items = parse_items(&stdout)?;
        if unassigned_only {
            items.retain(WorkItem::is_unassigned);
        }
        debug!(count = items.len(), "ready items");
        Ok(items)
    }

    fn list(&self, status: Option<ItemStatus>) -> Result<Vec<WorkItem>> {
        let mut args = vec!["list", "--json", "--limit", "0"];
        match status {
            Some(status) => {
                args.push("--status");
                args.push(status.as_str());
            }
            None => args.push("--all"),
        }
        let stdout = self.exec_checked("list", &args, None)?;
        parse_items(&stdout)
    }

    fn show(&self, id: &str) -> Result<Option<WorkItem>> {
        let output = self.exec("show", &["show", id, "--json"], None)?;
        if !output.status.success() {
            let stderr = output.stderr_lossy();
            if NOT_FOUND_RE.is_match(&stderr) {
                return Ok(None);
            }
            return Err(anyhow!("bd show {id} failed: {}", stderr.trim()));
        }
        parse_single(&output.stdout_lossy())
    }

    #[instrument(skip(self))]
    fn claim(&self, id: &str, worker_id: &str) -> Result<ClaimOutcome> {
        let output = self.exec(
            "claim",
            &["update", id, "--claim", "--json"],
            Some(worker_id),
        )?;
        if !output.status.success() {
            let stderr = output.stderr_lossy();
            if !CONTENTION_RE.is_match(&stderr) {
                return Err(anyhow!("bd update {id} --claim failed: {}", stderr.trim()));
            }
            // A retried claim whose first attempt committed is reported as
            // contention; the fresh read below tells the two apart.
            debug!(id, stderr = %stderr.trim(), "claim refused, checking holder");
        }
        self.claim_holder_outcome(id, worker_id)
    }

    fn close(&self, id: &str, worker_id: &str, reason: &str) -> Result<()> {
        let item = self
            .show(id)?
            .ok_or_else(|| anyhow!("cannot close {id}: not found"))?;
        ensure_owner(&item, worker_id)?;
        self.exec_checked(
            "close",
            &["close", id, "--reason", reason, "--json"],
            Some(worker_id),
        )?;
        Ok(())
    }

    fn reopen(&self, id: &str) -> Result<()> {
        self.exec_checked(
            "reopen",
            &["update", id, "--status", "open", "--assignee", ""],
            None,
        )?;
        Ok(())
    }

    fn create(&self, item: &NewItem) -> Result<String> {
        let priority = item.priority.to_string();
        let mut args = vec![
            "create",
            item.title.as_str(),
            "--type",
            item.kind.as_str(),
            "--priority",
            priority.as_str(),
            "--json",
        ];
        if !item.description.trim().is_empty() {
            args.push("--description");
            args.push(item.description.as_str());
        }
        let stdout = self.exec_checked("create", &args, None)?;
        let created = parse_single(&stdout)?
            .ok_or_else(|| anyhow!("bd create returned no issue"))?;
        Ok(created.id)
    }

    fn link_dependency(&self, child_id: &str, parent_id: &str) -> Result<()> {
        let output = self.exec(
            "link_dependency",
            &["dep", "add", child_id, parent_id],
            None,
        )?;
        if !output.status.success() {
            let stderr = output.stderr_lossy();
            if CYCLE_RE.is_match(&stderr) {
                return Err(DependencyCycle {
                    child: child_id.to_string(),
                    parent: parent_id.to_string(),
                }
                .into());
            }
            return Err(anyhow!(
                "bd dep add {child_id} {parent_id} failed: {}",
                stderr.trim()
            ));
        }
        Ok(())
    }
}
