//! Per-iteration artifacts under `logs/<session>/iterations/<worker>/<n>/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::types::{ItemKind, Verdict, VerifyOutcome};

/// How one worker iteration ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationResult {
    Completed,
    Decomposed,
    /// `unable_to_verify`: bug filed, item left in progress.
    Blocked,
    /// Dispatch error; item left in progress.
    Failed,
    /// Stop requested mid-item; item left in progress.
    Abandoned,
}

#[derive(Debug, Clone, Serialize)]
pub struct IterationMeta {
    pub session_id: String,
    pub worker_id: String,
    pub iteration: u32,
    pub item_id: String,
    pub kind: Option<ItemKind>,
    pub attempts: u32,
    pub result: IterationResult,
    pub last_verdict: Option<Verdict>,
    pub last_verify: Option<VerifyOutcome>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub created_items: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Files for one dispatch round within an iteration.
#[derive(Debug, Clone)]
pub struct AttemptPaths {
    pub dir: PathBuf,
    pub prompt_path: PathBuf,
    pub agent_log_path: PathBuf,
    pub report_path: PathBuf,
    pub verify_log_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
}

impl IterationPaths {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            meta_path: dir.join("meta.json"),
            dir,
        }
    }

    pub fn attempt(&self, attempt: u32) -> AttemptPaths {
        let dir = self.dir.join(format!("attempt-{attempt}"));
        AttemptPaths {
            prompt_path: dir.join("prompt.md"),
            agent_log_path: dir.join("agent.log"),
            report_path: dir.join("report.json"),
            verify_log_path: dir.join("verify.log"),
            dir,
        }
    }
}

pub fn write_prompt(paths: &AttemptPaths, prompt: &str) -> Result<()> {
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create attempt dir {}", paths.dir.display()))?;
    write_text(&paths.prompt_path, prompt)
}

pub fn write_meta(paths: &IterationPaths, meta: &IterationMeta) -> Result<()> {
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create iteration dir {}", paths.dir.display()))?;
    let mut buf = serde_json::to_string_pretty(meta).context("serialize iteration meta")?;
    buf.push('\n');
    write_text(&paths.meta_path, &buf)
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_meta_and_attempt_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = IterationPaths::new(temp.path().join("iterations/ralph-1/4"));
        let attempt = paths.attempt(2);
        write_prompt(&attempt, "do the thing").expect("prompt");
        assert!(attempt.dir.ends_with("4/attempt-2"));
        assert_eq!(
            fs::read_to_string(&attempt.prompt_path).expect("read"),
            "do the thing"
        );

        let now = Utc::now();
        write_meta(
            &paths,
            &IterationMeta {
                session_id: "s".to_string(),
                worker_id: "ralph-1".to_string(),
                iteration: 4,
                item_id: "bd-1".to_string(),
                kind: Some(ItemKind::Task),
                attempts: 2,
                result: IterationResult::Completed,
                last_verdict: Some(Verdict::Done),
                last_verify: Some(VerifyOutcome::Pass),
                created_items: Vec::new(),
                error: None,
                started_at: now,
                ended_at: now,
                duration_ms: 0,
            },
        )
        .expect("meta");
        let raw = fs::read_to_string(&paths.meta_path).expect("read meta");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(value["result"], "completed");
        assert_eq!(value["last_verify"], "pass");
        assert!(value.get("created_items").is_none());
        assert!(value.get("error").is_none());
    }
}
