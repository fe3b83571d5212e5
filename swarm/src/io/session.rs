//! Session directories, worker records, and heartbeat files.
//!
//! Layout under the log root:
//!
//! ```text
//! logs/
//!   latest -> 2026-01-02_10-00-00
//!   2026-01-02_10-00-00/
//!     session.json
//!     ralph-1.log
//!     ralph-1.worker.json
//!     ralph-1.status.json
//!     iterations/ralph-1/1/...
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::types::{RunMode, WorkerState};
use crate::io::write_atomic;

pub const LATEST_LINK: &str = "latest";
const SESSION_MANIFEST: &str = "session.json";
const RECORD_SUFFIX: &str = ".worker.json";
const STATUS_SUFFIX: &str = ".status.json";

/// Written once when a swarm starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionManifest {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub mode: RunMode,
    pub workers: u32,
    pub model: String,
    pub controller_pid: u32,
}

/// Controller's view of one spawned worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub pid: u32,
    pub session_id: String,
    pub log_path: PathBuf,
    pub spawned_at: DateTime<Utc>,
    pub state: WorkerState,
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Process start time (seconds since epoch) used to detect PID reuse.
    #[serde(default)]
    pub process_start_time: Option<u64>,
}

/// Heartbeat a worker rewrites as it moves through its loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub pid: u32,
    pub state: WorkerState,
    pub phase: String,
    #[serde(default)]
    pub current_item: Option<String>,
    pub iteration: u32,
    pub idle_streak: u32,
    pub updated_at: DateTime<Utc>,
}

/// Paths inside one session directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    pub session_id: String,
    pub dir: PathBuf,
}

impl SessionPaths {
    pub fn open(log_root: &Path, session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            dir: log_root.join(session_id),
        }
    }

    pub fn manifest(&self) -> PathBuf {
        self.dir.join(SESSION_MANIFEST)
    }

    pub fn worker_log(&self, worker_id: &str) -> PathBuf {
        self.dir.join(format!("{worker_id}.log"))
    }

    pub fn worker_record(&self, worker_id: &str) -> PathBuf {
        self.dir.join(format!("{worker_id}{RECORD_SUFFIX}"))
    }

    pub fn worker_status(&self, worker_id: &str) -> PathBuf {
        self.dir.join(format!("{worker_id}{STATUS_SUFFIX}"))
    }

    pub fn iteration_dir(&self, worker_id: &str, iteration: u32) -> PathBuf {
        self.dir
            .join("iterations")
            .join(worker_id)
            .join(iteration.to_string())
    }

    pub fn write_manifest(&self, manifest: &SessionManifest) -> Result<()> {
        write_json(&self.manifest(), manifest)
    }

    pub fn write_record(&self, record: &WorkerRecord) -> Result<()> {
        write_json(&self.worker_record(&record.worker_id), record)
    }

    pub fn write_status(&self, status: &WorkerStatus) -> Result<()> {
        write_json(&self.worker_status(&status.worker_id), status)
    }

    pub fn read_status(&self, worker_id: &str) -> Result<Option<WorkerStatus>> {
        read_json_optional(&self.worker_status(worker_id))
    }

    /// Worker records in this session, sorted by worker id.
    pub fn records(&self) -> Result<Vec<WorkerRecord>> {
        let mut records = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(err) => {
                return Err(err).with_context(|| format!("read {}", self.dir.display()));
            }
        };
        for entry in entries {
            let path = entry?.path();
            let is_record = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(RECORD_SUFFIX));
            if !is_record {
                continue;
            }
            match read_json_optional::<WorkerRecord>(&path) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(err) => warn!(
                    path = %path.display(),
                    err = %err,
                    "skipping unreadable worker record"
                ),
            }
        }
        records.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(records)
    }
}

/// Session id for a start time: `%Y-%m-%d_%H-%M-%S` in local time.
pub fn session_id_for(now: DateTime<Local>) -> String {
    now.format("%Y-%m-%d_%H-%M-%S").to_string()
}

/// Create a fresh session directory and point `latest` at it.
///
/// Same-second starts get a numeric suffix (`-2`, `-3`, ...).
pub fn create_session(log_root: &Path, now: DateTime<Local>) -> Result<SessionPaths> {
    fs::create_dir_all(log_root)
        .with_context(|| format!("create log root {}", log_root.display()))?;
    let base = session_id_for(now);
    let mut session_id = base.clone();
    let mut suffix = 2;
    while log_root.join(&session_id).exists() {
        session_id = format!("{base}-{suffix}");
        suffix += 1;
    }
    let paths = SessionPaths::open(log_root, &session_id);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create session dir {}", paths.dir.display()))?;
    if let Err(err) = update_latest_link(log_root, &session_id) {
        warn!(err = %err, "could not update latest session link");
    }
    debug!(session = %session_id, "created session");
    Ok(paths)
}

#[cfg(unix)]
fn update_latest_link(log_root: &Path, session_id: &str) -> Result<()> {
    let link = log_root.join(LATEST_LINK);
    match fs::symlink_metadata(&link) {
        Ok(meta) if meta.file_type().is_symlink() => {
            fs::remove_file(&link).with_context(|| format!("remove {}", link.display()))?;
        }
        Ok(_) => anyhow::bail!("{} exists and is not a symlink", link.display()),
        Err(_) => {}
    }
    std::os::unix::fs::symlink(session_id, &link)
        .with_context(|| format!("link {}", link.display()))
}

#[cfg(not(unix))]
fn update_latest_link(log_root: &Path, session_id: &str) -> Result<()> {
    fs::write(log_root.join(LATEST_LINK), session_id).context("write latest marker")
}

/// All session directories under `log_root`, oldest first.
pub fn list_sessions(log_root: &Path) -> Result<Vec<SessionPaths>> {
    let mut sessions = Vec::new();
    let entries = match fs::read_dir(log_root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(sessions),
        Err(err) => return Err(err).with_context(|| format!("read {}", log_root.display())),
    };
    for entry in entries {
        let entry = entry?;
        // `latest` is a symlink to a session we already list.
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            sessions.push(SessionPaths::open(log_root, name));
        }
    }
    sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
    Ok(sessions)
}

/// The newest session, preferring the `latest` link.
pub fn latest_session(log_root: &Path) -> Result<Option<SessionPaths>> {
    let link = log_root.join(LATEST_LINK);
    if let Ok(target) = fs::read_link(&link)
        && let Some(name) = target.file_name().and_then(|n| n.to_str())
        && log_root.join(name).is_dir()
    {
        return Ok(Some(SessionPaths::open(log_root, name)));
    }
    Ok(list_sessions(log_root)?.pop())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn read_json_optional<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents)
            .map(Some)
            .with_context(|| format!("parse {}", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2026, 1, 2, h, m, s)
            .single()
            .expect("unambiguous time")
    }

    fn record(worker_id: &str, session_id: &str) -> WorkerRecord {
        WorkerRecord {
            worker_id: worker_id.to_string(),
            pid: 4242,
            session_id: session_id.to_string(),
            log_path: PathBuf::from(format!("{worker_id}.log")),
            spawned_at: Utc::now(),
            state: WorkerState::Running,
            exit_code: None,
            process_start_time: Some(1_700_000_000),
        }
    }

    #[test]
    fn same_second_sessions_get_suffixes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let first = create_session(temp.path(), at(10, 0, 0)).expect("first");
        let second = create_session(temp.path(), at(10, 0, 0)).expect("second");
        let third = create_session(temp.path(), at(10, 0, 0)).expect("third");
        assert_eq!(first.session_id, "2026-01-02_10-00-00");
        assert_eq!(second.session_id, "2026-01-02_10-00-00-2");
        assert_eq!(third.session_id, "2026-01-02_10-00-00-3");
    }

    #[cfg(unix)]
    #[test]
    fn latest_points_at_newest_session_and_is_not_listed() {
        let temp = tempfile::tempdir().expect("tempdir");
        create_session(temp.path(), at(9, 0, 0)).expect("old");
        let newest = create_session(temp.path(), at(11, 30, 0)).expect("new");
        let latest = latest_session(temp.path()).expect("latest").expect("some");
        assert_eq!(latest, newest);
        assert_eq!(list_sessions(temp.path()).expect("list").len(), 2);
    }

    #[test]
    fn records_round_trip_and_sort() {
        let temp = tempfile::tempdir().expect("tempdir");
        let session = create_session(temp.path(), at(12, 0, 0)).expect("session");
        session
            .write_record(&record("ralph-2", &session.session_id))
            .expect("write");
        session
            .write_record(&record("ralph-1", &session.session_id))
            .expect("write");
        fs::write(session.dir.join("ralph-1.log"), "noise").expect("log");

        let records = session.records().expect("records");
        let ids: Vec<_> = records.iter().map(|r| r.worker_id.as_str()).collect();
        assert_eq!(ids, vec!["ralph-1", "ralph-2"]);
        assert_eq!(records[0].process_start_time, Some(1_700_000_000));
    }

    #[test]
    fn missing_status_reads_as_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        let session = SessionPaths::open(temp.path(), "nope");
        assert!(session.read_status("ralph-1").expect("read").is_none());
        assert!(session.records().expect("records").is_empty());
    }
}
