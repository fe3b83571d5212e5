//! Git adapter for inspecting and discarding uncommitted work.
//!
//! Crash recovery must throw away a dead worker's partial edits before its
//! item is reopened, so we keep a small, explicit wrapper around `git`
//! subprocess calls.

use std::path::PathBuf;
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    pub path: String,
    /// Source path of a rename or copy.
    pub orig_path: Option<String>,
}

impl StatusEntry {
    pub fn is_untracked(&self) -> bool {
        self.code == "??"
    }

    /// Every path the entry touches, including a rename's source.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.orig_path
            .as_deref()
            .into_iter()
            .chain([self.path.as_str()])
    }
}

/// Uncommitted changes in the shared working tree.
pub trait WorkingTree {
    /// Changes outside the excluded path prefixes.
    fn pending_changes(&self, excluded_prefixes: &[&str]) -> Result<Vec<StatusEntry>>;

    /// Revert tracked files to `HEAD` and delete untracked files, leaving
    /// excluded prefixes alone. Errors unless the tree is clean afterwards.
    fn discard(&self, excluded_prefixes: &[&str]) -> Result<()>;
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// True when `workdir` is inside a git work tree.
    pub fn is_repo(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .is_ok_and(|out| out.status.success())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Ensure the worktree is clean, allowing entries with any of the given prefixes.
    #[instrument(skip_all)]
    pub fn ensure_clean_except_prefixes(&self, allowed_prefixes: &[&str]) -> Result<()> {
        let disallowed = self.pending_changes(allowed_prefixes)?;
        if disallowed.is_empty() {
            debug!("worktree is clean");
            return Ok(());
        }
        warn!(disallowed_count = disallowed.len(), "worktree not clean");
        let mut msg = String::new();
        msg.push_str("working tree not clean (disallowed changes):\n");
        for entry in disallowed {
            msg.push_str(&format!("{} {}\n", entry.code, entry.path));
        }
        Err(anyhow!(msg.trim_end().to_string()))
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run_on_paths(&self, args: &[&str], paths: &[&str]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut full: Vec<&str> = args.to_vec();
        full.push("--");
        full.extend_from_slice(paths);
        self.run_checked(&full)?;
        Ok(())
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

impl WorkingTree for Git {
    fn pending_changes(&self, excluded_prefixes: &[&str]) -> Result<Vec<StatusEntry>> {
        Ok(self
            .status_porcelain()?
            .into_iter()
            .filter(|entry| {
                !excluded_prefixes
                    .iter()
                    .any(|prefix| entry.path.starts_with(prefix))
            })
            .collect())
    }

    #[instrument(skip_all)]
    fn discard(&self, excluded_prefixes: &[&str]) -> Result<()> {
        let entries = self.pending_changes(excluded_prefixes)?;
        if entries.is_empty() {
            debug!("nothing to discard");
            return Ok(());
        }

        let tracked: Vec<&str> = entries
            .iter()
            .filter(|e| !e.is_untracked())
            .flat_map(StatusEntry::paths)
            .collect();
        // Index and worktree both go back to HEAD; paths HEAD lacks are removed.
        self.run_on_paths(
            &["restore", "--source=HEAD", "--staged", "--worktree"],
            &tracked,
        )?;

        let remaining = self.pending_changes(excluded_prefixes)?;
        let untracked: Vec<&str> = remaining
            .iter()
            .filter(|e| e.is_untracked())
            .map(|e| e.path.as_str())
            .collect();
        self.run_on_paths(&["clean", "-f", "-d", "-q"], &untracked)?;

        info!(
            reverted = tracked.len(),
            removed = untracked.len(),
            "discarded uncommitted changes"
        );
        self.ensure_clean_except_prefixes(excluded_prefixes)
            .context("verify discard")
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: unquote(path.trim()),
            orig_path: None,
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let rest = line[3..].trim();
    let renamed = code.contains('R') || code.contains('C');
    let (orig_path, path) = match rest.split_once(" -> ") {
        Some((from, to)) if renamed => (Some(unquote(from.trim())), unquote(to.trim())),
        _ => (None, unquote(rest)),
    };
    Ok(StatusEntry {
        code,
        path,
        orig_path,
    })
}

/// Porcelain quotes paths containing spaces or special characters.
fn unquote(path: &str) -> String {
    path.strip_prefix('"')
        .and_then(|p| p.strip_suffix('"'))
        .map_or_else(
            || path.to_string(),
            |p| p.replace("\\\"", "\"").replace("\\\\", "\\"),
        )
}
