//! I/O adapters: work queue, agent, git, processes, and on-disk state.

pub mod agent;
pub mod beads;
pub mod config;
pub mod git;
pub mod iteration_log;
pub mod process;
pub mod procs;
pub mod prompt;
pub mod queue;
pub mod session;
pub mod signal;
pub mod tail;
pub mod verify;

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

/// Write via temp file + rename so readers never see a partial file.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
