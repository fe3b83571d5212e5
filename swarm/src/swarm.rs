//! Swarm controller: spawn worker processes, watch them, and stop them.
//!
//! The controller is the only writer of `<worker>.worker.json` records. It
//! never restarts a crashed worker; crashes are reported and the orphaned
//! claim is left for `cleanup`.

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use crate::core::types::{RunMode, WorkerState};
use crate::io::beads::ACTOR_ENV;
use crate::io::procs::{ExitInfo, LivenessProbe, ProcessHost, SpawnSpec};
use crate::io::session::{SessionManifest, SessionPaths, WorkerRecord};
use crate::io::signal::StopSignal;

const STOP_POLL: Duration = Duration::from_millis(100);

/// Stable worker id for a 1-based ordinal.
pub fn worker_id(ordinal: u32) -> String {
    format!("ralph-{ordinal}")
}

/// What to launch and how each worker should behave.
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Executable providing the hidden `worker` subcommand.
    pub program: PathBuf,
    pub workdir: PathBuf,
    pub workers: u32,
    pub mode: RunMode,
    pub model: String,
    pub auto_shutdown: bool,
    pub idle_limit: u32,
    /// Pause between consecutive spawns.
    pub stagger: Duration,
    /// Workers echo agent output into their logs.
    pub verbose: bool,
}

impl StartOptions {
    /// Arguments for the hidden `worker` subcommand.
    pub fn worker_args(&self, worker_id: &str, session_id: &str) -> Vec<String> {
        let mut args = vec![
            "worker".to_string(),
            "--id".to_string(),
            worker_id.to_string(),
            "--session".to_string(),
            session_id.to_string(),
            "--model".to_string(),
            self.model.clone(),
            "--idle-limit".to_string(),
            self.idle_limit.to_string(),
        ];
        if self.mode == RunMode::Once {
            args.push("--once".to_string());
        }
        if !self.auto_shutdown {
            args.push("--no-auto-shutdown".to_string());
        }
        if self.verbose {
            args.push("--verbose".to_string());
        }
        args
    }
}

/// A worker's state changed since the previous poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerTransition {
    pub worker_id: String,
    pub pid: u32,
    pub state: WorkerState,
    pub exit_code: Option<i32>,
}

/// What [`SwarmController::monitor`] reports to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorEvent<'a> {
    Transition(&'a WorkerTransition),
    /// One poll finished; workers may still be running.
    Tick,
}

/// Why [`SwarmController::monitor`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    /// Every worker exited or crashed.
    AllFinished,
    /// A stop was requested while workers were still running.
    StopRequested,
}

pub struct SwarmController<H> {
    host: H,
    session: SessionPaths,
    workers: Vec<WorkerRecord>,
}

impl<H: ProcessHost> SwarmController<H> {
    pub fn new(host: H, session: SessionPaths) -> Self {
        Self {
            host,
            session,
            workers: Vec::new(),
        }
    }

    pub fn session(&self) -> &SessionPaths {
        &self.session
    }

    pub fn workers(&self) -> &[WorkerRecord] {
        &self.workers
    }

    /// Workers not yet known to have exited.
    pub fn running(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.workers.iter().filter(|w| !w.state.is_terminal())
    }

    pub fn all_finished(&self) -> bool {
        self.running().next().is_none()
    }

    /// Spawn `options.workers` worker processes, staggered.
    ///
    /// A worker that fails to spawn is logged and skipped; starting fails
    /// only when none could be spawned. A stop during the stagger ends the
    /// launch early.
    #[instrument(skip_all, fields(session = %self.session.session_id, workers = options.workers))]
    pub fn start(&mut self, options: &StartOptions, stop: &StopSignal) -> Result<&[WorkerRecord]> {
        if options.workers == 0 {
            bail!("worker count must be at least 1");
        }
        self.session.write_manifest(&SessionManifest {
            session_id: self.session.session_id.clone(),
            started_at: Utc::now(),
            mode: options.mode,
            workers: options.workers,
            model: options.model.clone(),
            controller_pid: std::process::id(),
        })?;

        for ordinal in 1..=options.workers {
            if ordinal > 1 && !stop.sleep(options.stagger) {
                warn!(spawned = self.workers.len(), "stop requested during launch");
                break;
            }
            let id = worker_id(ordinal);
            let spec = SpawnSpec {
                worker_id: id.clone(),
                program: options.program.clone(),
                args: options.worker_args(&id, &self.session.session_id),
                workdir: options.workdir.clone(),
                log_path: self.session.worker_log(&id),
                env: vec![(ACTOR_ENV.to_string(), id.clone())],
            };
            let spawned = match self.host.spawn(&spec) {
                Ok(spawned) => spawned,
                Err(err) => {
                    error!(worker = %id, err = %format!("{err:#}"), "failed to spawn worker");
                    continue;
                }
            };
            let record = WorkerRecord {
                worker_id: id,
                pid: spawned.pid,
                session_id: self.session.session_id.clone(),
                log_path: spec.log_path,
                spawned_at: Utc::now(),
                state: WorkerState::Running,
                exit_code: None,
                process_start_time: spawned.start_time,
            };
            self.session.write_record(&record)?;
            info!(worker = %record.worker_id, pid = record.pid, "worker started");
            self.workers.push(record);
        }

        if self.workers.is_empty() {
            bail!("no worker could be started");
        }
        Ok(&self.workers)
    }

    /// Check every running worker once and record exits.
    ///
    /// A zero exit is `exited`; anything else (non-zero, killed by a signal,
    /// unobservable) is `crashed`.
    pub fn poll(&mut self) -> Result<Vec<WorkerTransition>> {
        let mut transitions = Vec::new();
        for record in self.workers.iter_mut().filter(|w| !w.state.is_terminal()) {
            let Some(exit) = self.host.exit_status(record.pid)? else {
                continue;
            };
            record.state = exit_state(exit);
            record.exit_code = exit.code;
            self.session.write_record(record)?;
            match record.state {
                WorkerState::Crashed => {
                    error!(
                        worker = %record.worker_id,
                        pid = record.pid,
                        exit_code = ?exit.code,
                        "worker crashed"
                    );
                }
                _ => info!(worker = %record.worker_id, pid = record.pid, "worker exited"),
            }
            transitions.push(WorkerTransition {
                worker_id: record.worker_id.clone(),
                pid: record.pid,
                state: record.state,
                exit_code: exit.code,
            });
        }
        Ok(transitions)
    }

    /// Poll every `interval` until all workers finish or a stop arrives.
    pub fn monitor(
        &mut self,
        interval: Duration,
        stop: &StopSignal,
        mut on_event: impl FnMut(MonitorEvent<'_>),
    ) -> Result<MonitorExit> {
        loop {
            for transition in self.poll()? {
                on_event(MonitorEvent::Transition(&transition));
            }
            on_event(MonitorEvent::Tick);
            if self.all_finished() {
                return Ok(MonitorExit::AllFinished);
            }
            if !stop.sleep(interval) {
                return Ok(MonitorExit::StopRequested);
            }
        }
    }

    /// Ask every running worker to stop, then wait up to `grace`.
    ///
    /// Returns the ids of workers still running when the grace period ends.
    #[instrument(skip_all, fields(grace_secs = grace.as_secs()))]
    pub fn stop_all(&mut self, grace: Duration) -> Result<Vec<String>> {
        let pids: Vec<u32> = self.running().map(|w| w.pid).collect();
        for pid in pids {
            if let Err(err) = self.host.request_stop(pid) {
                warn!(pid, err = %err, "failed to request worker stop");
            }
        }
        let deadline = Instant::now() + grace;
        loop {
            self.poll()?;
            if self.all_finished() {
                debug!("all workers stopped");
                return Ok(Vec::new());
            }
            let now = Instant::now();
            if now >= deadline {
                let survivors: Vec<String> = self.running().map(|w| w.worker_id.clone()).collect();
                warn!(?survivors, "workers still running after grace period");
                return Ok(survivors);
            }
            thread::sleep(STOP_POLL.min(deadline - now));
        }
    }
}

fn exit_state(exit: ExitInfo) -> WorkerState {
    if exit.success() {
        WorkerState::Exited
    } else {
        WorkerState::Crashed
    }
}

/// Stop workers recorded in `session` by another controller.
///
/// Live workers receive `terminate`; waits up to `grace` and returns the
/// records still alive afterwards.
pub fn stop_recorded(
    session: &SessionPaths,
    probe: &impl LivenessProbe,
    mut terminate: impl FnMut(u32) -> Result<bool>,
    grace: Duration,
) -> Result<Vec<WorkerRecord>> {
    let alive = |record: &WorkerRecord| {
        !record.state.is_terminal() && probe.is_alive(record.pid, record.process_start_time)
    };
    let targets: Vec<WorkerRecord> = session
        .records()?
        .into_iter()
        .filter(|r| alive(r))
        .collect();
    for record in &targets {
        let (worker, pid) = (&record.worker_id, record.pid);
        match terminate(pid) {
            Ok(true) => info!(%worker, pid, "sent stop request"),
            Ok(false) => debug!(%worker, pid, "worker already gone"),
            Err(err) => warn!(%worker, pid, err = %err, "failed to send stop request"),
        }
    }

    let deadline = Instant::now() + grace;
    loop {
        let survivors: Vec<WorkerRecord> = targets.iter().filter(|r| alive(r)).cloned().collect();
        let now = Instant::now();
        if survivors.is_empty() || now >= deadline {
            return Ok(survivors);
        }
        thread::sleep(STOP_POLL.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeHost, FakeProbe};

    fn options(workers: u32, mode: RunMode) -> StartOptions {
        StartOptions {
            program: PathBuf::from("/usr/local/bin/swarm"),
            workdir: PathBuf::from("/work"),
            workers,
            mode,
            model: "sonnet".to_string(),
            auto_shutdown: true,
            idle_limit: 3,
            stagger: Duration::ZERO,
            verbose: false,
        }
    }

    fn controller(host: &FakeHost) -> (tempfile::TempDir, SwarmController<FakeHost>) {
        let temp = tempfile::tempdir().expect("tempdir");
        let session = SessionPaths::open(temp.path(), "s1");
        (temp, SwarmController::new(host.clone(), session))
    }

    #[test]
    fn start_spawns_distinct_workers_with_their_own_logs() {
        let host = FakeHost::new();
        let (_temp, mut swarm) = controller(&host);
        swarm
            .start(&options(3, RunMode::Swarm), &StopSignal::new())
            .expect("start");

        let spawned = host.spawned();
        let ids: Vec<&str> = spawned.iter().map(|(_, s)| s.worker_id.as_str()).collect();
        assert_eq!(ids, vec!["ralph-1", "ralph-2", "ralph-3"]);
        assert_eq!(
            spawned[1].1.env,
            vec![("BD_ACTOR".to_string(), "ralph-2".to_string())]
        );
        assert!(spawned[2].1.log_path.ends_with("s1/ralph-3.log"));
        assert_eq!(swarm.session().records().expect("records").len(), 3);
        assert!(swarm.session().manifest().exists());
    }

    #[test]
    fn worker_args_carry_mode_flags() {
        let mut opts = options(1, RunMode::Once);
        opts.auto_shutdown = false;
        let args = opts.worker_args("ralph-1", "s1");
        assert_eq!(&args[..5], ["worker", "--id", "ralph-1", "--session", "s1"]);
        assert!(args.contains(&"--once".to_string()));
        assert!(args.contains(&"--no-auto-shutdown".to_string()));
        assert!(!args.contains(&"--verbose".to_string()));
        let swarm_args = options(1, RunMode::Swarm).worker_args("ralph-1", "s1");
        assert!(!swarm_args.contains(&"--once".to_string()));

        opts.verbose = true;
        let verbose_args = opts.worker_args("ralph-1", "s1");
        assert!(verbose_args.contains(&"--verbose".to_string()));
    }

    #[test]
    fn spawn_failures_skip_that_worker() {
        let host = FakeHost::new();
        host.refuse_spawn("ralph-2");
        let (_temp, mut swarm) = controller(&host);
        let started = swarm
            .start(&options(3, RunMode::Swarm), &StopSignal::new())
            .expect("start");
        let ids: Vec<&str> = started.iter().map(|w| w.worker_id.as_str()).collect();
        assert_eq!(ids, vec!["ralph-1", "ralph-3"]);
    }

    #[test]
    fn non_zero_exit_is_a_crash_and_is_not_restarted() {
        let host = FakeHost::new();
        let (_temp, mut swarm) = controller(&host);
        swarm
            .start(&options(2, RunMode::Swarm), &StopSignal::new())
            .expect("start");

        host.finish(100, Some(0));
        host.finish(101, Some(3));
        let transitions = swarm.poll().expect("poll");
        assert_eq!(transitions.len(), 2);
        assert_eq!(transitions[0].state, WorkerState::Exited);
        assert_eq!(transitions[1].state, WorkerState::Crashed);
        assert_eq!(transitions[1].exit_code, Some(3));
        assert!(swarm.all_finished());
        assert_eq!(host.spawned().len(), 2);

        let records = swarm.session().records().expect("records");
        assert_eq!(records[1].state, WorkerState::Crashed);
        assert!(swarm.poll().expect("poll again").is_empty());
    }

    #[test]
    fn monitor_returns_once_every_worker_finished() {
        let host = FakeHost::new();
        let (_temp, mut swarm) = controller(&host);
        swarm
            .start(&options(1, RunMode::Once), &StopSignal::new())
            .expect("start");
        host.finish(100, None);

        let mut seen = Vec::new();
        let mut ticks = 0;
        let exit = swarm
            .monitor(Duration::from_millis(1), &StopSignal::new(), |event| match event {
                MonitorEvent::Transition(t) => seen.push(t.clone()),
                MonitorEvent::Tick => ticks += 1,
            })
            .expect("monitor");
        assert_eq!(exit, MonitorExit::AllFinished);
        assert_eq!(seen[0].state, WorkerState::Crashed);
        assert_eq!(ticks, 1);
    }

    #[test]
    fn monitor_yields_to_stop_requests() {
        let host = FakeHost::new();
        let (_temp, mut swarm) = controller(&host);
        swarm
            .start(&options(1, RunMode::Swarm), &StopSignal::new())
            .expect("start");
        let stop = StopSignal::new();
        stop.request();
        let exit = swarm
            .monitor(Duration::from_secs(60), &stop, |_| {})
            .expect("monitor");
        assert_eq!(exit, MonitorExit::StopRequested);
    }

    #[test]
    fn stop_all_waits_for_graceful_exit() {
        let host = FakeHost::new().exiting_on_stop();
        let (_temp, mut swarm) = controller(&host);
        swarm
            .start(&options(2, RunMode::Swarm), &StopSignal::new())
            .expect("start");

        let survivors = swarm.stop_all(Duration::from_secs(5)).expect("stop");
        assert!(survivors.is_empty());
        assert_eq!(host.stop_requests(), vec![100, 101]);
        let states: Vec<WorkerState> = swarm.workers().iter().map(|w| w.state).collect();
        assert_eq!(states, vec![WorkerState::Exited, WorkerState::Exited]);
    }

    #[test]
    fn stop_all_reports_workers_outliving_the_grace_period() {
        let host = FakeHost::new();
        let (_temp, mut swarm) = controller(&host);
        swarm
            .start(&options(2, RunMode::Swarm), &StopSignal::new())
            .expect("start");
        host.finish(100, Some(0));

        let survivors = swarm.stop_all(Duration::from_millis(50)).expect("stop");
        assert_eq!(survivors, vec!["ralph-2".to_string()]);
    }

    #[test]
    fn stop_recorded_only_signals_live_workers() {
        let host = FakeHost::new();
        let (_temp, mut swarm) = controller(&host);
        swarm
            .start(&options(2, RunMode::Swarm), &StopSignal::new())
            .expect("start");

        let mut signalled = Vec::new();
        let survivors = stop_recorded(
            swarm.session(),
            &FakeProbe::alive(&[101]),
            |pid| {
                signalled.push(pid);
                Ok(true)
            },
            Duration::from_millis(20),
        )
        .expect("stop");
        assert_eq!(signalled, vec![101]);
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].worker_id, "ralph-2");
    }
}
