//! Shared deterministic types for the swarm core.
//!
//! These types define stable contracts between the work queue, workers, and
//! recovery. They carry no I/O and must serialize identically across runs.

use std::fmt;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

/// Lowest priority ordinal; used for unknown priority names.
pub const LOWEST_PRIORITY: u8 = 4;

/// Kind of work item. `Epic` is decomposed, never implemented directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Epic,
    Task,
    Bug,
    Feature,
}

impl ItemKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemKind::Epic => "epic",
            ItemKind::Task => "task",
            ItemKind::Bug => "bug",
            ItemKind::Feature => "feature",
        }
    }

    /// Parse a kind label; `None` for anything outside the closed set.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "epic" => Some(ItemKind::Epic),
            "task" => Some(ItemKind::Task),
            "bug" => Some(ItemKind::Bug),
            "feature" => Some(ItemKind::Feature),
            _ => None,
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[serde(alias = "blocked")]
    Open,
    InProgress,
    Closed,
}

impl ItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Open => "open",
            ItemStatus::InProgress => "in_progress",
            ItemStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of planned work as reported by the work-tracking system.
///
/// `kind` is `None` when the tracker reported a missing or unrecognized kind;
/// dispatch refuses such items instead of guessing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub kind: Option<ItemKind>,
    pub status: ItemStatus,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

fn default_priority() -> u8 {
    2
}

impl WorkItem {
    /// Assignee with empty strings normalized away.
    pub fn assignee(&self) -> Option<&str> {
        self.assignee.as_deref().filter(|a| !a.trim().is_empty())
    }

    pub fn is_unassigned(&self) -> bool {
        self.assignee().is_none()
    }

    /// Short id for table output.
    pub fn short_id(&self) -> &str {
        match self.id.char_indices().nth(8) {
            Some((idx, _)) => &self.id[..idx],
            None => &self.id,
        }
    }
}

/// Specification for an item to be inserted into the queue (always open and unassigned).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewItem {
    pub title: String,
    pub kind: ItemKind,
    #[serde(default = "default_priority", deserialize_with = "deserialize_priority")]
    pub priority: u8,
    #[serde(default)]
    pub description: String,
}

/// Map a priority label or ordinal to an ordinal (0 = highest).
pub fn priority_from_label(label: &str) -> u8 {
    let trimmed = label.trim();
    if let Ok(n) = trimmed.parse::<u8>() {
        return n;
    }
    let digits = trimmed.trim_start_matches(['p', 'P']);
    if let Ok(n) = digits.parse::<u8>() {
        return n;
    }
    match trimmed.to_ascii_lowercase().as_str() {
        "critical" => 0,
        "high" => 1,
        "medium" => 2,
        "low" => 3,
        _ => LOWEST_PRIORITY,
    }
}

/// Accept either an integer or a named priority.
pub fn deserialize_priority<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Label(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => u8::try_from(n.max(0))
            .map_err(|_| de::Error::custom(format!("priority out of range: {n}"))),
        Raw::Label(label) => Ok(priority_from_label(&label)),
    }
}

/// Result of an atomic claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This worker now holds the item (`open` → `in_progress`).
    Claimed,
    /// Another worker won the race, or the item is no longer open.
    AlreadyClaimed,
}

/// Verdict returned by the implementation agent for one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Work complete; build and tests pass for the touched unit.
    Done,
    /// Verification failed; dispatch again.
    NotReady,
    /// The minimum verification contract could not be satisfied.
    UnableToVerify,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Done => "done",
            Verdict::NotReady => "not_ready",
            Verdict::UnableToVerify => "unable_to_verify",
        }
    }
}

/// Structured report written by the agent after executing a leaf item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentReport {
    pub verdict: Verdict,
    pub summary: String,
    #[serde(default)]
    pub follow_ups: Vec<NewItem>,
}

/// Structured output of an epic decomposition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decomposition {
    pub summary: String,
    pub children: Vec<NewItem>,
}

/// Outcome of the orchestrator-side verification step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyOutcome {
    /// Verification command succeeded.
    Pass,
    /// Verification command failed (or timed out).
    Fail,
    /// No verification command configured; the agent's verdict stands.
    Skipped,
    /// The verification command could not be run at all.
    Unavailable(String),
}

/// Lifecycle state of a worker process as seen by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Starting,
    Running,
    Idle,
    Exited,
    Crashed,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Idle => "idle",
            WorkerState::Exited => "exited",
            WorkerState::Crashed => "crashed",
        }
    }

    /// True once the process is known to be gone.
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Exited | WorkerState::Crashed)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How long each worker keeps looping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Exactly one loop iteration, then exit.
    Once,
    /// Loop until idle shutdown or an external stop.
    Swarm,
}
