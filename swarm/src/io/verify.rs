//! Orchestrator-side verification after the agent reports `done`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::core::types::VerifyOutcome;
use crate::io::process::{RunOptions, run_command};

#[derive(Debug, Clone)]
pub struct VerifyRequest {
    pub workdir: PathBuf,
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

pub trait Verifier {
    fn verify(&self, request: &VerifyRequest) -> Result<VerifyOutcome>;
}

impl<T: Verifier + ?Sized> Verifier for &T {
    fn verify(&self, request: &VerifyRequest) -> Result<VerifyOutcome> {
        (**self).verify(request)
    }
}

/// Runs a configured command (e.g. `["cargo","test"]`); empty means skip.
#[derive(Debug, Clone, Default)]
pub struct CommandVerifier {
    pub command: Vec<String>,
}

impl CommandVerifier {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl Verifier for CommandVerifier {
    fn verify(&self, request: &VerifyRequest) -> Result<VerifyOutcome> {
        let Some((program, args)) = self.command.split_first() else {
            return Ok(VerifyOutcome::Skipped);
        };
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&request.workdir);

        let output = match run_command(
            cmd,
            RunOptions::new(request.timeout, request.output_limit_bytes),
        ) {
            Ok(output) => output,
            Err(err) => {
                warn!(err = %err, program = %program, "verify command could not run");
                write_verify_log(&request.log_path, &format!("{err:#}\n"))?;
                return Ok(VerifyOutcome::Unavailable(format!("{err:#}")));
            }
        };
        write_verify_log(&request.log_path, &output.render_log("verify"))?;

        if output.success() {
            debug!("verify passed");
            Ok(VerifyOutcome::Pass)
        } else {
            warn!(exit_code = ?output.status.code(), timed_out = output.timed_out, "verify failed");
            Ok(VerifyOutcome::Fail)
        }
    }
}

fn write_verify_log(path: &Path, body: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create verify log dir {}", parent.display()))?;
    }
    fs::write(path, body).with_context(|| format!("write verify log {}", path.display()))
}

/// Tail of the verify log, used as failure context for the next dispatch.
pub fn read_failure_tail(path: &Path, max_bytes: usize) -> Option<String> {
    let contents = fs::read_to_string(path).ok()?;
    if contents.len() <= max_bytes {
        return Some(contents);
    }
    let mut start = contents.len() - max_bytes;
    while !contents.is_char_boundary(start) {
        start += 1;
    }
    Some(format!("[...]\n{}", &contents[start..]))
}
