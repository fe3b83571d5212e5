//! Agent abstraction for dispatching work items.
//!
//! The [`Agent`] trait decouples the worker loop from the actual agent
//! backend (currently the `claude` CLI). Tests use scripted agents that write
//! predetermined reports without spawning processes.

use std::error::Error;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::Draft;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::io::beads::ACTOR_ENV;
use crate::io::process::{RunOptions, run_command};

pub const AGENT_REPORT_SCHEMA: &str = include_str!("../../schemas/agent_report.schema.json");
pub const DECOMPOSITION_SCHEMA: &str = include_str!("../../schemas/decomposition.schema.json");

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Working directory for the agent process (the project root).
    pub workdir: PathBuf,
    /// Worker on whose behalf the agent acts; exported as the tracker actor.
    pub worker_id: String,
    pub prompt: String,
    /// Path where the agent must write its JSON result.
    pub output_path: PathBuf,
    /// Agent stdout is appended here line by line, stderr once it exits.
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// The agent ran past its timeout and was killed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentTimedOut {
    pub timeout: Duration,
}

impl fmt::Display for AgentTimedOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent timed out after {}s", self.timeout.as_secs())
    }
}

impl Error for AgentTimedOut {}

/// Abstraction over agent execution backends.
pub trait Agent {
    /// Run the agent with the given request. Must write output to `request.output_path`.
    fn exec(&self, request: &AgentRequest) -> Result<()>;
}

/// Agent that spawns the `claude` CLI in print mode.
#[derive(Debug, Clone)]
pub struct ClaudeAgent {
    /// Program and leading arguments, e.g. `["claude"]`.
    pub command: Vec<String>,
    pub model: String,
    /// Ask for the event stream and echo it to stderr as it arrives.
    pub verbose: bool,
}

impl ClaudeAgent {
    pub fn new(command: Vec<String>, model: impl Into<String>) -> Self {
        Self {
            command,
            model: model.into(),
            verbose: false,
        }
    }

    pub fn verbose(mut self, enabled: bool) -> Self {
        self.verbose = enabled;
        self
    }

    fn build_command(&self, request: &AgentRequest) -> Result<Command> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("agent.command must not be empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg("--print")
            .arg("--dangerously-skip-permissions")
            .arg("--model")
            .arg(&self.model)
            .current_dir(&request.workdir)
            .env(ACTOR_ENV, &request.worker_id);
        if self.verbose {
            cmd.args(["--output-format", "stream-json", "--verbose"]);
        }
        Ok(cmd)
    }
}

impl Agent for ClaudeAgent {
    #[instrument(skip_all, fields(worker = %request.worker_id, timeout_secs = request.timeout.as_secs()))]
    fn exec(&self, request: &AgentRequest) -> Result<()> {
        info!(workdir = %request.workdir.display(), model = %self.model, "starting agent");
        if let Some(parent) = request.output_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create output dir {}", parent.display()))?;
        }

        let cmd = self.build_command(request)?;
        let output = run_command(
            cmd,
            RunOptions::new(request.timeout, request.output_limit_bytes)
                .stdin(request.prompt.as_bytes())
                .tee(&request.log_path)
                .echo(self.verbose),
        )
        .context("run agent")?;

        append_stderr(&request.log_path, &output.stderr_lossy())?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "agent timed out");
            return Err(AgentTimedOut {
                timeout: request.timeout,
            }
            .into());
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "agent failed");
            bail!("agent exited with status {:?}", output.status.code());
        }

        debug!("agent completed successfully");
        Ok(())
    }
}

fn append_stderr(path: &Path, stderr: &str) -> Result<()> {
    if stderr.trim().is_empty() {
        return Ok(());
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open agent log {}", path.display()))?;
    write!(file, "\n=== stderr ===\n{stderr}").with_context(|| format!("append {}", path.display()))
}

impl<T: Agent + ?Sized> Agent for &T {
    fn exec(&self, request: &AgentRequest) -> Result<()> {
        (**self).exec(request)
    }
}

/// Load and schema-check the JSON an agent wrote to `path`.
pub fn load_output_json<T: DeserializeOwned>(path: &Path, schema: &str) -> Result<T> {
    if !path.exists() {
        bail!("missing agent output {}", path.display());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read agent output {}", path.display()))?;
    parse_checked(&contents, schema).with_context(|| format!("agent output {}", path.display()))
}

/// Parse `raw` as JSON, validate it against `schema`, then decode it.
pub fn parse_checked<T: DeserializeOwned>(raw: &str, schema: &str) -> Result<T> {
    let instance: Value = serde_json::from_str(raw).context("parse json")?;
    let schema: Value = serde_json::from_str(schema).context("parse schema json")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile json schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(&instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("schema validation failed:\n- {}", messages.join("\n- "));
    }
    serde_json::from_value(instance).context("decode json")
}
