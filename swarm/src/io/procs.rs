//! OS process lifecycle for worker processes.
//!
//! [`ProcessHost`] covers spawn, liveness, graceful stop, and exit status so
//! the controller logic stays independent of the host. [`LivenessProbe`] is
//! the read-only half used by status and crash recovery, which inspect PIDs
//! recorded by other (possibly dead) controllers.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use anyhow::{Context, Result, anyhow};
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, Signal, System};
use tracing::{debug, instrument, warn};

/// Allowed drift between a recorded and an observed process start time.
const START_TIME_TOLERANCE_SECS: u64 = 2;

/// Answers "is this recorded process still the one we started?"
pub trait LivenessProbe {
    /// True iff `pid` is running and, when `start_time` is known, was
    /// started at that time (guards against PID reuse).
    fn is_alive(&self, pid: u32, start_time: Option<u64>) -> bool;

    /// Start time of `pid` in seconds since the epoch, if running.
    fn start_time(&self, pid: u32) -> Option<u64>;
}

/// [`LivenessProbe`] over the live process table.
#[derive(Debug, Clone, Copy, Default)]
pub struct SysinfoProbe;

fn refreshed(pid: u32) -> (System, Pid) {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    (system, pid)
}

impl LivenessProbe for SysinfoProbe {
    fn is_alive(&self, pid: u32, start_time: Option<u64>) -> bool {
        let (system, pid) = refreshed(pid);
        let Some(process) = system.process(pid) else {
            return false;
        };
        if matches!(
            process.status(),
            ProcessStatus::Zombie | ProcessStatus::Dead
        ) {
            return false;
        }
        start_time.is_none_or(|expected| {
            process.start_time().abs_diff(expected) <= START_TIME_TOLERANCE_SECS
        })
    }

    fn start_time(&self, pid: u32) -> Option<u64> {
        let (system, pid) = refreshed(pid);
        system.process(pid).map(sysinfo::Process::start_time)
    }
}

/// Send a graceful termination request to `pid`.
///
/// Returns `false` when the process is already gone.
pub fn request_terminate(pid: u32) -> Result<bool> {
    let (system, spid) = refreshed(pid);
    let Some(process) = system.process(spid) else {
        return Ok(false);
    };
    match process.kill_with(Signal::Term) {
        Some(sent) => Ok(sent),
        None => Err(anyhow!("graceful termination is not supported on this platform")),
    }
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// `None` when killed by a signal or the code could not be observed.
    pub code: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// What to launch for one worker.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub worker_id: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub workdir: PathBuf,
    /// Worker stdout and stderr are appended here.
    pub log_path: PathBuf,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Spawned {
    pub pid: u32,
    pub start_time: Option<u64>,
}

/// Spawn, observe, and stop worker processes.
pub trait ProcessHost {
    fn spawn(&mut self, spec: &SpawnSpec) -> Result<Spawned>;

    /// Exit status once the process has ended; `None` while it runs.
    fn exit_status(&mut self, pid: u32) -> Result<Option<ExitInfo>>;

    /// Ask the process to stop after its current step.
    fn request_stop(&mut self, pid: u32) -> Result<()>;
}

/// [`ProcessHost`] that owns real child processes.
#[derive(Debug, Default)]
pub struct OsProcessHost {
    children: HashMap<u32, Child>,
    probe: SysinfoProbe,
}

impl OsProcessHost {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProcessHost for OsProcessHost {
    #[instrument(skip_all, fields(worker = %spec.worker_id))]
    fn spawn(&mut self, spec: &SpawnSpec) -> Result<Spawned> {
        if let Some(parent) = spec.log_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create log dir {}", parent.display()))?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_path)
            .with_context(|| format!("open worker log {}", spec.log_path.display()))?;
        let log_err = log.try_clone().context("clone worker log handle")?;

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        let child = cmd
            .spawn()
            .with_context(|| format!("spawn worker {}", spec.worker_id))?;
        let pid = child.id();
        let start_time = self.probe.start_time(pid);
        debug!(pid, "spawned worker");
        self.children.insert(pid, child);
        Ok(Spawned { pid, start_time })
    }

    fn exit_status(&mut self, pid: u32) -> Result<Option<ExitInfo>> {
        if let Some(child) = self.children.get_mut(&pid) {
            let status = child.try_wait().context("poll worker")?;
            return Ok(status.map(|s| ExitInfo { code: s.code() }));
        }
        // Not ours: all we can tell is whether it is gone.
        if self.probe.is_alive(pid, None) {
            Ok(None)
        } else {
            Ok(Some(ExitInfo { code: None }))
        }
    }

    fn request_stop(&mut self, pid: u32) -> Result<()> {
        match request_terminate(pid) {
            Ok(_) => Ok(()),
            Err(err) => {
                warn!(pid, err = %err, "graceful stop unavailable, killing");
                match self.children.get_mut(&pid) {
                    Some(child) => child.kill().context("kill worker"),
                    None => Err(err),
                }
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn wait_exit(host: &mut OsProcessHost, pid: u32) -> ExitInfo {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(info) = host.exit_status(pid).expect("poll") {
                return info;
            }
            assert!(Instant::now() < deadline, "process did not exit");
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    fn spec(dir: &std::path::Path, script: &str) -> SpawnSpec {
        SpawnSpec {
            worker_id: "ralph-1".to_string(),
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.to_string()],
            workdir: dir.to_path_buf(),
            log_path: dir.join("logs/ralph-1.log"),
            env: vec![("BD_ACTOR".to_string(), "ralph-1".to_string())],
        }
    }

    #[test]
    fn spawned_worker_logs_and_reports_exit_code() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut host = OsProcessHost::new();
        let spawned = host
            .spawn(&spec(temp.path(), "echo hi from $BD_ACTOR; echo oops >&2; exit 3"))
            .expect("spawn");
        let info = wait_exit(&mut host, spawned.pid);
        assert_eq!(info.code, Some(3));
        let log = std::fs::read_to_string(temp.path().join("logs/ralph-1.log")).expect("log");
        assert!(log.contains("hi from ralph-1"));
        assert!(log.contains("oops"));
    }

    #[test]
    fn request_stop_terminates_running_worker() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut host = OsProcessHost::new();
        let spawned = host.spawn(&spec(temp.path(), "sleep 30")).expect("spawn");
        assert!(SysinfoProbe.is_alive(spawned.pid, spawned.start_time));
        host.request_stop(spawned.pid).expect("stop");
        let info = wait_exit(&mut host, spawned.pid);
        assert!(!info.success());
    }

    #[test]
    fn probe_rejects_mismatched_start_time() {
        let me = std::process::id();
        let started = SysinfoProbe.start_time(me).expect("own start time");
        assert!(SysinfoProbe.is_alive(me, Some(started)));
        assert!(!SysinfoProbe.is_alive(me, Some(started + 3_600)));
    }
}
