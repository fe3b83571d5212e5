//! Swarm configuration stored under `.swarm/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::idle::{Backoff, IdleShutdownPolicy};
use crate::io::queue::RetryPolicy;

pub const CONFIG_RELATIVE_PATH: &str = ".swarm/config.toml";

/// Swarm configuration (TOML).
///
/// Edited by humans; every field is optional and CLI flags override it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SwarmConfig {
    /// Model name passed to the agent CLI.
    pub model: String,
    /// Default worker count for `start`.
    pub workers: u32,
    pub auto_shutdown: bool,
    /// Consecutive empty-queue checks before a worker exits. Must be >= 1.
    pub idle_limit: u32,
    pub idle_backoff_secs: u64,
    pub idle_backoff_max_secs: u64,
    /// Pause between completed iterations.
    pub iteration_pause_secs: u64,
    /// Delay between worker launches so the first claims do not collide.
    pub launch_stagger_ms: u64,
    pub monitor_interval_secs: u64,
    /// How long `stop` waits for workers after signalling them.
    pub stop_grace_secs: u64,
    pub agent_timeout_secs: u64,
    pub agent_output_limit_bytes: usize,
    pub verify_output_limit_bytes: usize,
    pub prompt_budget_bytes: usize,
    pub queue_retry_attempts: u32,
    pub queue_retry_base_ms: u64,
    /// Per-call timeout for the work-tracker CLI.
    pub queue_timeout_secs: u64,
    /// Session logs root, relative to the project root.
    pub log_dir: PathBuf,
    pub agent: AgentConfig,
    pub verify: VerifyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Program and leading arguments for the agent CLI.
    pub command: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec!["claude".to_string()],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerifyConfig {
    /// Command run after a `done` verdict (e.g. `["cargo","test"]`); empty skips.
    pub command: Vec<String>,
    pub timeout_secs: Option<u64>,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            model: "sonnet".to_string(),
            workers: 1,
            auto_shutdown: true,
            idle_limit: 3,
            idle_backoff_secs: 5,
            idle_backoff_max_secs: 60,
            iteration_pause_secs: 2,
            launch_stagger_ms: 1_000,
            monitor_interval_secs: 2,
            stop_grace_secs: 30,
            agent_timeout_secs: 4 * 60 * 60,
            agent_output_limit_bytes: 1_000_000,
            verify_output_limit_bytes: 1_000_000,
            prompt_budget_bytes: 64_000,
            queue_retry_attempts: 5,
            queue_retry_base_ms: 500,
            queue_timeout_secs: 60,
            log_dir: PathBuf::from("logs"),
            agent: AgentConfig::default(),
            verify: VerifyConfig::default(),
        }
    }
}

impl SwarmConfig {
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(anyhow!("model must be non-empty"));
        }
        if self.workers == 0 {
            return Err(anyhow!("workers must be >= 1"));
        }
        if self.idle_limit == 0 {
            return Err(anyhow!("idle_limit must be >= 1"));
        }
        if self.agent_timeout_secs == 0 {
            return Err(anyhow!("agent_timeout_secs must be > 0"));
        }
        if self.queue_timeout_secs == 0 {
            return Err(anyhow!("queue_timeout_secs must be > 0"));
        }
        if self.queue_retry_attempts == 0 {
            return Err(anyhow!("queue_retry_attempts must be >= 1"));
        }
        if self.agent_output_limit_bytes == 0 || self.verify_output_limit_bytes == 0 {
            return Err(anyhow!("output limits must be > 0"));
        }
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        let verify_program = self.verify.command.first();
        if verify_program.is_some_and(|c| c.trim().is_empty()) {
            return Err(anyhow!("verify.command must not start with an empty program"));
        }
        Ok(())
    }

    pub fn idle_policy(&self) -> IdleShutdownPolicy {
        IdleShutdownPolicy {
            idle_limit: self.idle_limit,
            auto_shutdown: self.auto_shutdown,
            backoff: Backoff::new(
                Duration::from_secs(self.idle_backoff_secs),
                Duration::from_secs(self.idle_backoff_max_secs),
            ),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let base = Duration::from_millis(self.queue_retry_base_ms);
        RetryPolicy {
            attempts: self.queue_retry_attempts,
            backoff: Backoff::new(base, base * 16),
        }
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    /// Verification shares the agent timeout unless set explicitly.
    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify.timeout_secs.unwrap_or(self.agent_timeout_secs))
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_timeout_secs)
    }

    pub fn log_root(&self, root: &Path) -> PathBuf {
        root.join(&self.log_dir)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `SwarmConfig::default()`.
pub fn load_config(path: &Path) -> Result<SwarmConfig> {
    if !path.exists() {
        let cfg = SwarmConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: SwarmConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}
