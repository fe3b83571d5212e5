//! One worker's loop: select → claim → dispatch → verify → close.
//!
//! Workers share nothing in memory. Every coordination decision goes through
//! the [`WorkQueue`]; the only thing that keeps two workers off the same item
//! is the queue's atomic claim.

use std::collections::HashSet;
use std::error::Error;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use crate::core::idle::{IdleDecision, IdleShutdownPolicy};
use crate::core::selector::select_next;
use crate::core::types::{
    AgentReport, ClaimOutcome, Decomposition, ItemKind, ItemStatus, NewItem, RunMode, Verdict,
    VerifyOutcome, WorkItem, WorkerState,
};
use crate::io::agent::{
    AGENT_REPORT_SCHEMA, Agent, AgentRequest, AgentTimedOut, DECOMPOSITION_SCHEMA,
    load_output_json,
};
use crate::io::config::SwarmConfig;
use crate::io::iteration_log::{
    AttemptPaths, IterationMeta, IterationPaths, IterationResult, write_meta, write_prompt,
};
use crate::io::prompt::{MAX_CHILDREN, MIN_CHILDREN, PromptBuilder, PromptInputs};
use crate::io::queue::{QueueUnavailable, RetryPolicy, WorkQueue, ensure_owner};
use crate::io::session::{SessionPaths, WorkerStatus};
use crate::io::signal::StopSignal;
use crate::io::verify::{VerifyRequest, Verifier, read_failure_tail};

/// Close reason for an epic whose children were created.
pub const DECOMPOSED_REASON: &str = "decomposed";
const FAILURE_TAIL_BYTES: usize = 8_000;

/// The item's kind is missing or outside {epic, task, bug, feature}.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedKind {
    pub id: String,
}

impl fmt::Display for MalformedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} has no recognized kind (expected epic, task, bug, or feature)",
            self.id
        )
    }
}

impl Error for MalformedKind {}

/// Where the worker is in its loop; published in the heartbeat file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Selecting,
    Claiming,
    Dispatching,
    Verifying,
    Closing,
    Idle,
    Terminated,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Selecting => "selecting",
            Phase::Claiming => "claiming",
            Phase::Dispatching => "dispatching",
            Phase::Verifying => "verifying",
            Phase::Closing => "closing",
            Phase::Idle => "idle",
            Phase::Terminated => "terminated",
        }
    }
}

/// Per-worker knobs, usually derived from [`SwarmConfig`].
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub worker_id: String,
    pub workdir: PathBuf,
    pub idle: IdleShutdownPolicy,
    pub retry: RetryPolicy,
    pub iteration_pause: Duration,
    pub agent_timeout: Duration,
    pub agent_output_limit_bytes: usize,
    pub verify_timeout: Duration,
    pub verify_output_limit_bytes: usize,
    pub prompt_budget_bytes: usize,
}

impl WorkerSettings {
    pub fn from_config(worker_id: &str, workdir: PathBuf, cfg: &SwarmConfig) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            workdir,
            idle: cfg.idle_policy(),
            retry: cfg.retry_policy(),
            iteration_pause: Duration::from_secs(cfg.iteration_pause_secs),
            agent_timeout: cfg.agent_timeout(),
            agent_output_limit_bytes: cfg.agent_output_limit_bytes,
            verify_timeout: cfg.verify_timeout(),
            verify_output_limit_bytes: cfg.verify_output_limit_bytes,
            prompt_budget_bytes: cfg.prompt_budget_bytes,
        }
    }
}

/// Result of one loop iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    /// Nothing claimable.
    Idle,
    Completed { id: String },
    Decomposed { id: String, children: Vec<String> },
    /// `unable_to_verify`: a bug was filed and the item stays in progress.
    Blocked { id: String, bug_id: String },
    /// Dispatch error; the item stays in progress.
    Failed { id: String, error: String },
    /// Stop requested mid-item; the item stays in progress for recovery.
    Abandoned { id: String },
    /// The queue stayed unreachable through every retry; nothing was claimed.
    QueueUnavailable { error: String },
}

/// Why [`Worker::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// `once` mode finished its single iteration.
    OnceComplete,
    /// The idle policy decided to shut down.
    IdleShutdown,
    /// A stop was requested.
    Stopped,
}

#[derive(Debug)]
struct ItemRun {
    result: IterationResult,
    attempts: u32,
    last_verdict: Option<Verdict>,
    last_verify: Option<VerifyOutcome>,
    created: Vec<String>,
    bug_id: Option<String>,
    error: Option<String>,
}

impl ItemRun {
    fn new() -> Self {
        Self {
            result: IterationResult::Failed,
            attempts: 0,
            last_verdict: None,
            last_verify: None,
            created: Vec::new(),
            bug_id: None,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            error: Some(error),
            ..Self::new()
        }
    }

    fn finish(mut self, result: IterationResult) -> Self {
        self.result = result;
        self
    }
}

/// A single worker bound to a queue, an agent, and a verifier.
pub struct Worker<Q, A, V> {
    queue: Q,
    agent: A,
    verifier: V,
    settings: WorkerSettings,
    session: SessionPaths,
    stop: StopSignal,
    prompts: PromptBuilder,
    iteration: u32,
    idle_streak: u32,
    outage_streak: u32,
    /// Claim whose result was lost to a queue outage.
    unconfirmed_claim: Option<String>,
}

impl<Q: WorkQueue, A: Agent, V: Verifier> Worker<Q, A, V> {
    pub fn new(
        queue: Q,
        agent: A,
        verifier: V,
        settings: WorkerSettings,
        session: SessionPaths,
        stop: StopSignal,
    ) -> Result<Self> {
        let prompts = PromptBuilder::new(settings.prompt_budget_bytes)?;
        Ok(Self {
            queue,
            agent,
            verifier,
            settings,
            session,
            stop,
            prompts,
            iteration: 0,
            idle_streak: 0,
            outage_streak: 0,
            unconfirmed_claim: None,
        })
    }

    pub fn id(&self) -> &str {
        &self.settings.worker_id
    }

    /// Consecutive selections that found nothing claimable.
    pub fn idle_streak(&self) -> u32 {
        self.idle_streak
    }

    /// Items claimed so far.
    pub fn iterations(&self) -> u32 {
        self.iteration
    }

    /// Loop until `mode` says to stop.
    ///
    /// An [`AgentTimedOut`] error is returned as-is: the item stays in progress
    /// and the process is expected to exit so recovery can pick it up.
    #[instrument(skip_all, fields(worker = %self.settings.worker_id, mode = ?mode))]
    pub fn run(&mut self, mode: RunMode) -> Result<WorkerExit> {
        info!("worker started");
        let exit = self.run_loop(mode);
        let state = match &exit {
            Ok(_) => WorkerState::Exited,
            Err(_) => WorkerState::Crashed,
        };
        self.heartbeat(state, Phase::Terminated, None);
        match &exit {
            Ok(reason) => info!(?reason, iterations = self.iteration, "worker exiting"),
            Err(err) => error!(err = %format!("{err:#}"), "worker aborting"),
        }
        exit
    }

    fn run_loop(&mut self, mode: RunMode) -> Result<WorkerExit> {
        loop {
            if self.stop.requested() {
                return Ok(WorkerExit::Stopped);
            }
            let outcome = self.run_iteration()?;
            if matches!(outcome, IterationOutcome::QueueUnavailable { .. }) {
                let delay = self.settings.idle.backoff.delay(self.outage_streak);
                self.heartbeat(WorkerState::Idle, Phase::Idle, None);
                if !self.stop.sleep(delay) {
                    return Ok(WorkerExit::Stopped);
                }
                continue;
            }
            if mode == RunMode::Once {
                return Ok(WorkerExit::OnceComplete);
            }
            match outcome {
                IterationOutcome::Idle => match self.settings.idle.decide(self.idle_streak) {
                    IdleDecision::Continue => {}
                    IdleDecision::Shutdown => {
                        info!(
                            idle_streak = self.idle_streak,
                            "queue stayed empty, shutting down"
                        );
                        return Ok(WorkerExit::IdleShutdown);
                    }
                    IdleDecision::BackoffThenRetry { delay } => {
                        debug!(
                            idle_streak = self.idle_streak,
                            delay_ms = delay.as_millis() as u64,
                            "queue empty, backing off"
                        );
                        self.heartbeat(WorkerState::Idle, Phase::Idle, None);
                        if !self.stop.sleep(delay) {
                            return Ok(WorkerExit::Stopped);
                        }
                    }
                },
                IterationOutcome::Abandoned { .. } => return Ok(WorkerExit::Stopped),
                _ => {
                    if !self.stop.sleep(self.settings.iteration_pause) {
                        return Ok(WorkerExit::Stopped);
                    }
                }
            }
        }
    }

    /// One pass through the state machine.
    ///
    /// Lost claims re-select immediately and never count as an iteration.
    /// A queue outage outlasting the retries is reported, not raised.
    pub fn run_iteration(&mut self) -> Result<IterationOutcome> {
        let item = match self.select_and_claim() {
            Ok(Some(item)) => item,
            Ok(None) => {
                self.outage_streak = 0;
                return Ok(IterationOutcome::Idle);
            }
            Err(err) if err.downcast_ref::<QueueUnavailable>().is_some() => {
                self.outage_streak += 1;
                let error = format!("{err:#}");
                warn!(
                    outage_streak = self.outage_streak,
                    %error,
                    "work queue unreachable, backing off"
                );
                return Ok(IterationOutcome::QueueUnavailable { error });
            }
            Err(err) => return Err(err),
        };
        self.outage_streak = 0;
        self.iteration += 1;
        let started_at = Utc::now();
        let clock = Instant::now();
        let paths = IterationPaths::new(
            self.session
                .iteration_dir(&self.settings.worker_id, self.iteration),
        );
        self.heartbeat(WorkerState::Running, Phase::Dispatching, Some(&item.id));

        let dispatched = match item.kind {
            None => Err(MalformedKind {
                id: item.id.clone(),
            }
            .into()),
            Some(ItemKind::Epic) => self.decompose(&item, &paths),
            Some(ItemKind::Task | ItemKind::Bug | ItemKind::Feature) => self.execute(&item, &paths),
        };

        let (run, fatal) = match dispatched {
            Ok(run) => (run, None),
            Err(err) if err.downcast_ref::<AgentTimedOut>().is_some() => {
                error!(id = %item.id, err = %err, "agent timed out; abandoning item for recovery");
                (
                    ItemRun::failed(format!("{err:#}")).finish(IterationResult::Abandoned),
                    Some(err),
                )
            }
            Err(err) => {
                error!(
                    id = %item.id,
                    err = %format!("{err:#}"),
                    "dispatch failed; item left in progress"
                );
                (ItemRun::failed(format!("{err:#}")), None)
            }
        };

        let meta = IterationMeta {
            session_id: self.session.session_id.clone(),
            worker_id: self.settings.worker_id.clone(),
            iteration: self.iteration,
            item_id: item.id.clone(),
            kind: item.kind,
            attempts: run.attempts,
            result: run.result,
            last_verdict: run.last_verdict,
            last_verify: run.last_verify.clone(),
            created_items: run.created.clone(),
            error: run.error.clone(),
            started_at,
            ended_at: Utc::now(),
            duration_ms: clock.elapsed().as_millis() as u64,
        };
        if let Err(err) = write_meta(&paths, &meta) {
            warn!(err = %err, "failed to write iteration meta");
        }
        if let Some(err) = fatal {
            return Err(err);
        }

        let id = item.id;
        Ok(match run.result {
            IterationResult::Completed => IterationOutcome::Completed { id },
            IterationResult::Decomposed => IterationOutcome::Decomposed {
                id,
                children: run.created,
            },
            IterationResult::Blocked => IterationOutcome::Blocked {
                id,
                bug_id: run.bug_id.unwrap_or_default(),
            },
            IterationResult::Failed => IterationOutcome::Failed {
                id,
                error: run.error.unwrap_or_default(),
            },
            IterationResult::Abandoned => IterationOutcome::Abandoned { id },
        })
    }

    fn select_and_claim(&mut self) -> Result<Option<WorkItem>> {
        let worker_id = self.settings.worker_id.clone();
        if let Some(id) = self.unconfirmed_claim.clone() {
            let current = self.with_retry("show", |q| q.show(&id))?;
            self.unconfirmed_claim = None;
            if let Some(item) = current
                && item.status == ItemStatus::InProgress
                && item.assignee() == Some(worker_id.as_str())
            {
                info!(id = %item.id, "claim made before the queue outage stands, resuming");
                return Ok(Some(item));
            }
        }
        let mut lost: HashSet<String> = HashSet::new();
        loop {
            self.heartbeat(WorkerState::Running, Phase::Selecting, None);
            let mut ready = self.with_retry("list_ready", |q| q.list_ready(true))?;
            // A listing that only repeats items we just lost is stale, not work.
            ready.retain(|item| !lost.contains(&item.id));
            let Some(candidate) = select_next(&ready).cloned() else {
                self.idle_streak += 1;
                debug!(idle_streak = self.idle_streak, "no claimable items");
                return Ok(None);
            };
            self.idle_streak = 0;

            self.heartbeat(WorkerState::Running, Phase::Claiming, Some(&candidate.id));
            self.unconfirmed_claim = Some(candidate.id.clone());
            match self.with_retry("claim", |q| q.claim(&candidate.id, &worker_id))? {
                ClaimOutcome::Claimed => {
                    info!(id = %candidate.id, title = %candidate.title, "claimed item");
                    let fresh = self.with_retry("show", |q| q.show(&candidate.id))?;
                    self.unconfirmed_claim = None;
                    return Ok(Some(fresh.unwrap_or(candidate)));
                }
                ClaimOutcome::AlreadyClaimed => {
                    self.unconfirmed_claim = None;
                    debug!(id = %candidate.id, "claim lost, reselecting");
                    lost.insert(candidate.id);
                }
            }
        }
    }

    fn execute(&self, item: &WorkItem, paths: &IterationPaths) -> Result<ItemRun> {
        let mut run = ItemRun::new();
        let mut failure: Option<String> = None;
        loop {
            if self.stop.requested() {
                warn!(id = %item.id, "stop requested; leaving item in progress");
                return Ok(run.finish(IterationResult::Abandoned));
            }
            run.attempts += 1;
            let attempt = paths.attempt(run.attempts);
            self.heartbeat(WorkerState::Running, Phase::Dispatching, Some(&item.id));
            let prompt = self.prompts.build_execute(&PromptInputs {
                worker_id: &self.settings.worker_id,
                item,
                output_path: &attempt.report_path,
                schema: AGENT_REPORT_SCHEMA,
                attempt: run.attempts,
                failure: failure.as_deref(),
            })?;
            write_prompt(&attempt, &prompt)?;
            self.agent.exec(&self.agent_request(prompt, &attempt))?;

            let report: AgentReport =
                match load_output_json(&attempt.report_path, AGENT_REPORT_SCHEMA) {
                    Ok(report) => report,
                    Err(err) => {
                        warn!(
                            id = %item.id,
                            attempt = run.attempts,
                            err = %format!("{err:#}"),
                            "agent report rejected; dispatching again"
                        );
                        failure = Some(format!("Your report was rejected: {err:#}"));
                        continue;
                    }
                };
            run.last_verdict = Some(report.verdict);
            let follow_ups = self.file_follow_ups(item, &report.follow_ups)?;
            run.created.extend(follow_ups);

            match report.verdict {
                Verdict::Done => {
                    self.heartbeat(WorkerState::Running, Phase::Verifying, Some(&item.id));
                    let outcome = self.verifier.verify(&VerifyRequest {
                        workdir: self.settings.workdir.clone(),
                        log_path: attempt.verify_log_path.clone(),
                        timeout: self.settings.verify_timeout,
                        output_limit_bytes: self.settings.verify_output_limit_bytes,
                    })?;
                    run.last_verify = Some(outcome.clone());
                    match outcome {
                        VerifyOutcome::Pass | VerifyOutcome::Skipped => {
                            self.heartbeat(
                                WorkerState::Running,
                                Phase::Closing,
                                Some(&item.id),
                            );
                            let reason = close_reason(&report.summary);
                            self.with_retry("close", |q| {
                                q.close(&item.id, &self.settings.worker_id, &reason)
                            })?;
                            info!(id = %item.id, attempts = run.attempts, "item completed");
                            return Ok(run.finish(IterationResult::Completed));
                        }
                        VerifyOutcome::Fail => {
                            warn!(
                                id = %item.id,
                                attempt = run.attempts,
                                "verification failed; dispatching again"
                            );
                            failure = Some(
                                read_failure_tail(&attempt.verify_log_path, FAILURE_TAIL_BYTES)
                                    .unwrap_or_else(|| "verification command failed".to_string()),
                            );
                        }
                        VerifyOutcome::Unavailable(reason) => {
                            let detail =
                                format!("verification command could not run: {reason}");
                            run.bug_id = Some(self.file_unable_to_verify(item, &detail)?);
                            return Ok(run.finish(IterationResult::Blocked));
                        }
                    }
                }
                Verdict::NotReady => {
                    info!(
                        id = %item.id,
                        attempt = run.attempts,
                        summary = %report.summary,
                        "agent reported not ready; dispatching again"
                    );
                    failure = Some(report.summary);
                }
                Verdict::UnableToVerify => {
                    run.bug_id = Some(self.file_unable_to_verify(item, &report.summary)?);
                    return Ok(run.finish(IterationResult::Blocked));
                }
            }
        }
    }

    fn decompose(&self, epic: &WorkItem, paths: &IterationPaths) -> Result<ItemRun> {
        let mut run = ItemRun::new();
        let mut failure: Option<String> = None;
        loop {
            if self.stop.requested() {
                warn!(id = %epic.id, "stop requested; leaving epic in progress");
                return Ok(run.finish(IterationResult::Abandoned));
            }
            run.attempts += 1;
            let attempt = paths.attempt(run.attempts);
            let prompt = self.prompts.build_decompose(&PromptInputs {
                worker_id: &self.settings.worker_id,
                item: epic,
                output_path: &attempt.report_path,
                schema: DECOMPOSITION_SCHEMA,
                attempt: run.attempts,
                failure: failure.as_deref(),
            })?;
            write_prompt(&attempt, &prompt)?;
            self.agent.exec(&self.agent_request(prompt, &attempt))?;

            let plan: Decomposition =
                match load_output_json(&attempt.report_path, DECOMPOSITION_SCHEMA) {
                    Ok(plan) => plan,
                    Err(err) => {
                        warn!(
                            id = %epic.id,
                            attempt = run.attempts,
                            err = %format!("{err:#}"),
                            "decomposition rejected; dispatching again"
                        );
                        failure = Some(format!("Your plan was rejected: {err:#}"));
                        continue;
                    }
                };
            let count = plan.children.len();
            if !(MIN_CHILDREN..=MAX_CHILDREN).contains(&count) {
                warn!(id = %epic.id, count, "decomposition size out of range; dispatching again");
                run.last_verdict = Some(Verdict::NotReady);
                failure = Some(format!(
                    "The plan had {count} children; \
                     it must have between {MIN_CHILDREN} and {MAX_CHILDREN}."
                ));
                continue;
            }
            run.last_verdict = Some(Verdict::Done);

            self.heartbeat(WorkerState::Running, Phase::Closing, Some(&epic.id));
            // Fresh read: if recovery reset the epic meanwhile, another worker may own it now.
            let current = self
                .with_retry("show", |q| q.show(&epic.id))?
                .ok_or_else(|| anyhow!("epic {} no longer exists", epic.id))?;
            ensure_owner(&current, &self.settings.worker_id)?;

            for child in &plan.children {
                let child_id = self.with_retry("create", |q| q.create(child))?;
                self.with_retry("link_dependency", |q| {
                    q.link_dependency(&child_id, &epic.id)
                })?;
                debug!(epic = %epic.id, child = %child_id, "created child");
                run.created.push(child_id);
            }
            self.with_retry("close", |q| {
                q.close(&epic.id, &self.settings.worker_id, DECOMPOSED_REASON)
            })?;
            info!(id = %epic.id, children = count, "epic decomposed");
            return Ok(run.finish(IterationResult::Decomposed));
        }
    }

    fn file_follow_ups(&self, item: &WorkItem, follow_ups: &[NewItem]) -> Result<Vec<String>> {
        let mut created = Vec::with_capacity(follow_ups.len());
        for follow_up in follow_ups {
            let id = self.with_retry("create", |q| q.create(follow_up))?;
            info!(parent = %item.id, id = %id, title = %follow_up.title, "filed follow-up item");
            created.push(id);
        }
        Ok(created)
    }

    fn file_unable_to_verify(&self, item: &WorkItem, detail: &str) -> Result<String> {
        error!(id = %item.id, detail, "unable to verify; filing bug and leaving item in progress");
        let bug = NewItem {
            title: format!("Unable to verify {}: {}", item.id, item.title),
            kind: ItemKind::Bug,
            priority: item.priority,
            description: format!(
                "Worker {} could not satisfy the minimum build/test verification for {}.\n\n{}",
                self.settings.worker_id,
                item.id,
                detail.trim()
            ),
        };
        self.with_retry("create", |q| q.create(&bug))
    }

    fn agent_request(&self, prompt: String, attempt: &AttemptPaths) -> AgentRequest {
        AgentRequest {
            workdir: self.settings.workdir.clone(),
            worker_id: self.settings.worker_id.clone(),
            prompt,
            output_path: attempt.report_path.clone(),
            log_path: attempt.agent_log_path.clone(),
            timeout: self.settings.agent_timeout,
            output_limit_bytes: self.settings.agent_output_limit_bytes,
        }
    }

    fn with_retry<T>(&self, op: &str, mut call: impl FnMut(&Q) -> Result<T>) -> Result<T> {
        let queue = &self.queue;
        let stop = &self.stop;
        self.settings
            .retry
            .run(op, || call(queue), |delay| stop.sleep(delay))
    }

    fn heartbeat(&self, state: WorkerState, phase: Phase, item: Option<&str>) {
        let status = WorkerStatus {
            worker_id: self.settings.worker_id.clone(),
            pid: std::process::id(),
            state,
            phase: phase.as_str().to_string(),
            current_item: item.map(str::to_string),
            iteration: self.iteration,
            idle_streak: self.idle_streak,
            updated_at: Utc::now(),
        };
        if let Err(err) = self.session.write_status(&status) {
            warn!(err = %err, "failed to write heartbeat");
        }
    }
}

fn close_reason(summary: &str) -> String {
    let summary = summary.trim();
    if summary.is_empty() {
        return "done".to_string();
    }
    let mut reason = format!("done: {summary}");
    if let Some((idx, _)) = reason.char_indices().nth(200) {
        reason.truncate(idx);
    }
    reason
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ItemStatus;
    use std::cell::Cell;

    use crate::test_support::{
        AgentStep, MemoryQueue, ScriptedAgent, ScriptedVerifier, decomposition, epic,
        fast_settings, item_with_kind, open_item, report,
    };

    struct Harness {
        _temp: tempfile::TempDir,
        session: SessionPaths,
        settings: WorkerSettings,
    }

    fn harness(worker_id: &str) -> Harness {
        let temp = tempfile::tempdir().expect("tempdir");
        let session = SessionPaths::open(temp.path(), "test-session");
        let settings = fast_settings(worker_id, temp.path());
        Harness {
            _temp: temp,
            session,
            settings,
        }
    }

    fn worker<'a>(
        h: &Harness,
        queue: &'a MemoryQueue,
        agent: &'a ScriptedAgent,
        verifier: &'a ScriptedVerifier,
    ) -> Worker<&'a MemoryQueue, &'a ScriptedAgent, &'a ScriptedVerifier> {
        Worker::new(
            queue,
            agent,
            verifier,
            h.settings.clone(),
            h.session.clone(),
            StopSignal::new(),
        )
        .expect("worker")
    }

    #[test]
    fn completes_and_closes_a_task() {
        let h = harness("ralph-1");
        let queue = MemoryQueue::with_items(vec![open_item("bd-1", 1)]);
        let agent = ScriptedAgent::new(vec![report(Verdict::Done, "implemented")]);
        let verifier = ScriptedVerifier::default();
        let mut w = worker(&h, &queue, &agent, &verifier);

        let outcome = w.run_iteration().expect("iteration");
        assert_eq!(
            outcome,
            IterationOutcome::Completed {
                id: "bd-1".to_string(),
            }
        );
        let item = queue.get("bd-1").expect("item");
        assert_eq!(item.status, ItemStatus::Closed);
        assert_eq!(
            queue.close_reason("bd-1").as_deref(),
            Some("done: implemented")
        );

        let meta_path = h.session.iteration_dir("ralph-1", 1).join("meta.json");
        let meta: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(meta_path).expect("meta")).expect("json");
        assert_eq!(meta["result"], "completed");
        assert_eq!(meta["attempts"], 1);
    }

    #[test]
    fn not_ready_redispatches_with_failure_context() {
        let h = harness("ralph-1");
        let queue = MemoryQueue::with_items(vec![open_item("bd-1", 1)]);
        let agent = ScriptedAgent::new(vec![
            report(Verdict::NotReady, "test parse_empty still fails"),
            report(Verdict::Done, "fixed"),
        ]);
        let verifier = ScriptedVerifier::default();
        let mut w = worker(&h, &queue, &agent, &verifier);

        assert!(matches!(
            w.run_iteration().expect("iteration"),
            IterationOutcome::Completed { .. }
        ));
        let prompts = agent.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(!prompts[0].contains("Previous attempt"));
        assert!(prompts[1].contains("test parse_empty still fails"));
    }

    #[test]
    fn failed_verification_feeds_log_into_next_attempt() {
        let h = harness("ralph-1");
        let queue = MemoryQueue::with_items(vec![open_item("bd-1", 1)]);
        let agent = ScriptedAgent::new(vec![
            report(Verdict::Done, "first try"),
            report(Verdict::Done, "second try"),
        ]);
        let verifier = ScriptedVerifier::new(vec![
            (VerifyOutcome::Fail, "assertion failed: left == right".to_string()),
            (VerifyOutcome::Pass, String::new()),
        ]);
        let mut w = worker(&h, &queue, &agent, &verifier);

        assert!(matches!(
            w.run_iteration().expect("iteration"),
            IterationOutcome::Completed { .. }
        ));
        let prompts = agent.prompts();
        assert!(prompts[1].contains("assertion failed: left == right"));
        assert_eq!(
            queue.close_reason("bd-1").as_deref(),
            Some("done: second try")
        );
    }

    #[test]
    fn unable_to_verify_files_bug_and_keeps_claim() {
        let h = harness("ralph-1");
        let queue = MemoryQueue::with_items(vec![open_item("bd-1", 1)]);
        let blocked = report(Verdict::UnableToVerify, "no toolchain in sandbox");
        let agent = ScriptedAgent::new(vec![blocked]);
        let verifier = ScriptedVerifier::default();
        let mut w = worker(&h, &queue, &agent, &verifier);

        let IterationOutcome::Blocked { id, bug_id } = w.run_iteration().expect("iteration") else {
            panic!("expected blocked");
        };
        assert_eq!(id, "bd-1");
        let item = queue.get("bd-1").expect("item");
        assert_eq!(item.status, ItemStatus::InProgress);
        assert_eq!(item.assignee(), Some("ralph-1"));
        let bug = queue.get(&bug_id).expect("bug");
        assert_eq!(bug.kind, Some(ItemKind::Bug));
        assert!(bug.title.contains("bd-1"));
        assert!(bug.description.contains("no toolchain in sandbox"));
    }

    #[test]
    fn unavailable_verifier_counts_as_unable_to_verify() {
        let h = harness("ralph-1");
        let queue = MemoryQueue::with_items(vec![open_item("bd-1", 1)]);
        let agent = ScriptedAgent::new(vec![report(Verdict::Done, "done")]);
        let verifier = ScriptedVerifier::new(vec![(
            VerifyOutcome::Unavailable("cargo: not found".to_string()),
            String::new(),
        )]);
        let mut w = worker(&h, &queue, &agent, &verifier);

        assert!(matches!(
            w.run_iteration().expect("iteration"),
            IterationOutcome::Blocked { .. }
        ));
        assert_eq!(
            queue.get("bd-1").expect("item").status,
            ItemStatus::InProgress
        );
    }

    #[test]
    fn follow_ups_become_open_items() {
        let h = harness("ralph-1");
        let queue = MemoryQueue::with_items(vec![open_item("bd-1", 1)]);
        let mut done = AgentReport {
            verdict: Verdict::Done,
            summary: "done".to_string(),
            follow_ups: Vec::new(),
        };
        done.follow_ups.push(NewItem {
            title: "Handle unicode paths".to_string(),
            kind: ItemKind::Bug,
            priority: 2,
            description: String::new(),
        });
        let agent = ScriptedAgent::new(vec![AgentStep::Report(done)]);
        let verifier = ScriptedVerifier::default();
        let mut w = worker(&h, &queue, &agent, &verifier);

        w.run_iteration().expect("iteration");
        let created: Vec<_> = queue
            .all()
            .into_iter()
            .filter(|i| i.title == "Handle unicode paths")
            .collect();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].status, ItemStatus::Open);
        assert!(created[0].is_unassigned());
    }

    #[test]
    fn epic_is_decomposed_into_linked_children() {
        let h = harness("ralph-1");
        let queue = MemoryQueue::with_items(vec![epic("bd-1")]);
        let agent = ScriptedAgent::new(vec![decomposition(6)]);
        let verifier = ScriptedVerifier::default();
        let mut w = worker(&h, &queue, &agent, &verifier);

        let IterationOutcome::Decomposed { id, children } = w.run_iteration().expect("iteration")
        else {
            panic!("expected decomposition");
        };
        assert_eq!(id, "bd-1");
        assert_eq!(children.len(), 6);
        for child in &children {
            let child = queue.get(child).expect("child");
            assert_eq!(child.dependencies, vec!["bd-1".to_string()]);
            assert_eq!(child.status, ItemStatus::Open);
        }
        assert_eq!(queue.get("bd-1").expect("epic").status, ItemStatus::Closed);
        assert_eq!(
            queue.close_reason("bd-1").as_deref(),
            Some(DECOMPOSED_REASON)
        );
        assert_eq!(queue.list_ready(true).expect("ready").len(), 6);
    }

    #[test]
    fn undersized_decomposition_is_redispatched() {
        let h = harness("ralph-1");
        let queue = MemoryQueue::with_items(vec![epic("bd-1")]);
        let agent = ScriptedAgent::new(vec![decomposition(3), decomposition(11), decomposition(5)]);
        let verifier = ScriptedVerifier::default();
        let mut w = worker(&h, &queue, &agent, &verifier);

        let IterationOutcome::Decomposed { children, .. } = w.run_iteration().expect("iteration")
        else {
            panic!("expected decomposition");
        };
        assert_eq!(children.len(), 5);
        let prompts = agent.prompts();
        assert!(prompts[1].contains("The plan had 3 children"));
        assert!(prompts[2].contains("The plan had 11 children"));
    }

    #[test]
    fn decomposition_stops_if_epic_was_taken_away() {
        let h = harness("ralph-1");
        let queue = MemoryQueue::with_items(vec![epic("bd-1")]);
        let agent = ScriptedAgent::new(vec![decomposition(5)]).with_hook({
            let queue = queue.clone();
            move |_| {
                // Recovery resets the epic and another worker claims it mid-dispatch.
                queue.reopen("bd-1").expect("reopen");
                queue.claim("bd-1", "ralph-2").expect("claim");
            }
        });
        let verifier = ScriptedVerifier::default();
        let mut w = worker(&h, &queue, &agent, &verifier);

        let outcome = w.run_iteration().expect("iteration");
        let IterationOutcome::Failed { error, .. } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(error.contains("under ralph-2"));
        assert_eq!(queue.all().len(), 1, "no children were created");
        assert_eq!(queue.get("bd-1").expect("epic").assignee(), Some("ralph-2"));
    }

    #[test]
    fn malformed_kind_is_a_dispatch_error() {
        let h = harness("ralph-1");
        let mut item = open_item("bd-1", 1);
        item.kind = None;
        let queue = MemoryQueue::with_items(vec![item]);
        let agent = ScriptedAgent::new(Vec::new());
        let verifier = ScriptedVerifier::default();
        let mut w = worker(&h, &queue, &agent, &verifier);

        let outcome = w.run_iteration().expect("iteration");
        let IterationOutcome::Failed { error, .. } = outcome else {
            panic!("expected failure");
        };
        assert!(error.contains("no recognized kind"));
        assert_eq!(
            queue.get("bd-1").expect("item").status,
            ItemStatus::InProgress
        );
        assert!(agent.prompts().is_empty());
    }

    #[test]
    fn agent_timeout_aborts_worker_and_keeps_claim() {
        let h = harness("ralph-1");
        let queue = MemoryQueue::with_items(vec![open_item("bd-1", 1)]);
        let agent = ScriptedAgent::new(vec![AgentStep::TimeOut]);
        let verifier = ScriptedVerifier::default();
        let mut w = worker(&h, &queue, &agent, &verifier);

        let err = w.run(RunMode::Swarm).unwrap_err();
        assert!(err.downcast_ref::<AgentTimedOut>().is_some());
        assert_eq!(queue.get("bd-1").expect("item").assignee(), Some("ralph-1"));
        let status = h.session.read_status("ralph-1").expect("read");
        assert_eq!(status.expect("status").state, WorkerState::Crashed);
    }

    #[test]
    fn highest_priority_then_lowest_id_is_claimed_first() {
        let h = harness("ralph-1");
        let queue = MemoryQueue::with_items(vec![
            item_with_kind("bd-9", ItemKind::Task),
            open_item("bd-5", 0),
            open_item("bd-3", 0),
        ]);
        let agent = ScriptedAgent::new(vec![report(Verdict::Done, "ok")]);
        let verifier = ScriptedVerifier::default();
        let mut w = worker(&h, &queue, &agent, &verifier);

        assert_eq!(
            w.run_iteration().expect("iteration"),
            IterationOutcome::Completed {
                id: "bd-3".to_string(),
            }
        );
    }

    #[test]
    fn lost_claim_reselects_without_counting() {
        let h = harness("ralph-1");
        let queue = MemoryQueue::with_items(vec![open_item("bd-1", 0), open_item("bd-2", 1)]);
        queue.steal_next_claim("ralph-9");
        let agent = ScriptedAgent::new(vec![report(Verdict::Done, "ok")]);
        let verifier = ScriptedVerifier::default();
        let mut w = worker(&h, &queue, &agent, &verifier);

        assert_eq!(
            w.run_iteration().expect("iteration"),
            IterationOutcome::Completed {
                id: "bd-2".to_string(),
            }
        );
        assert_eq!(w.iterations(), 1);
        assert_eq!(w.idle_streak(), 0);
        assert_eq!(queue.get("bd-1").expect("item").assignee(), Some("ralph-9"));
    }

    #[test]
    fn idle_shutdown_on_kth_empty_check() {
        let h = harness("ralph-1");
        let queue = MemoryQueue::new();
        let agent = ScriptedAgent::new(Vec::new());
        let verifier = ScriptedVerifier::default();
        let mut w = worker(&h, &queue, &agent, &verifier);

        assert_eq!(
            w.run(RunMode::Swarm).expect("run"),
            WorkerExit::IdleShutdown
        );
        assert_eq!(queue.list_ready_calls(), 3);
        assert_eq!(w.idle_streak(), 3);
    }

    #[test]
    fn once_mode_runs_a_single_iteration() {
        let h = harness("ralph-1");
        let queue = MemoryQueue::with_items(vec![open_item("bd-1", 1), open_item("bd-2", 1)]);
        let agent = ScriptedAgent::new(vec![
            report(Verdict::Done, "ok"),
            report(Verdict::Done, "ok"),
        ]);
        let verifier = ScriptedVerifier::default();
        let mut w = worker(&h, &queue, &agent, &verifier);

        assert_eq!(w.run(RunMode::Once).expect("run"), WorkerExit::OnceComplete);
        assert_eq!(queue.get("bd-1").expect("item").status, ItemStatus::Closed);
        assert_eq!(queue.get("bd-2").expect("item").status, ItemStatus::Open);
    }

    #[test]
    fn transient_queue_failures_are_retried() {
        let h = harness("ralph-1");
        let queue = MemoryQueue::with_items(vec![open_item("bd-1", 1)]);
        queue.fail_next(2);
        let agent = ScriptedAgent::new(vec![report(Verdict::Done, "ok")]);
        let verifier = ScriptedVerifier::default();
        let mut w = worker(&h, &queue, &agent, &verifier);

        assert!(matches!(
            w.run_iteration().expect("iteration"),
            IterationOutcome::Completed { .. }
        ));
    }

    #[test]
    fn worker_survives_a_queue_outage_and_then_completes() {
        let h = harness("ralph-1");
        let queue = MemoryQueue::with_items(vec![open_item("bd-1", 1)]);
        // Three attempts per selection: two selections fail outright, the
        // third succeeds on its second attempt.
        queue.fail_next(7);
        let agent = ScriptedAgent::new(vec![report(Verdict::Done, "ok")]);
        let verifier = ScriptedVerifier::default();
        let mut w = worker(&h, &queue, &agent, &verifier);

        assert!(matches!(
            w.run_iteration().expect("iteration"),
            IterationOutcome::QueueUnavailable { .. }
        ));
        assert_eq!(w.idle_streak(), 0);

        assert_eq!(
            w.run(RunMode::Swarm).expect("run"),
            WorkerExit::IdleShutdown
        );
        assert_eq!(queue.get("bd-1").expect("item").status, ItemStatus::Closed);
        assert_eq!(agent.prompts().len(), 1);
    }

    #[test]
    fn queue_outage_does_not_use_up_once_mode() {
        let h = harness("ralph-1");
        let queue = MemoryQueue::with_items(vec![open_item("bd-1", 1)]);
        queue.fail_next(3);
        let agent = ScriptedAgent::new(vec![report(Verdict::Done, "ok")]);
        let verifier = ScriptedVerifier::default();
        let mut w = worker(&h, &queue, &agent, &verifier);

        assert_eq!(w.run(RunMode::Once).expect("run"), WorkerExit::OnceComplete);
        assert_eq!(queue.get("bd-1").expect("item").status, ItemStatus::Closed);
    }

    #[test]
    fn non_transient_queue_errors_still_abort() {
        let h = harness("ralph-1");
        let queue = MemoryQueue::with_items(vec![open_item("bd-1", 1)]);
        let agent = ScriptedAgent::new(Vec::new());
        let verifier = ScriptedVerifier::default();
        let broken = FaultyQueue {
            broken_listing: true,
            ..FaultyQueue::new(&queue)
        };
        let mut w = Worker::new(
            &broken,
            &agent,
            &verifier,
            h.settings.clone(),
            h.session.clone(),
            StopSignal::new(),
        )
        .expect("worker");

        let err = w.run(RunMode::Swarm).unwrap_err();
        assert!(err.to_string().contains("permission denied"));
    }

    #[test]
    fn claim_committed_during_an_outage_is_resumed() {
        let h = harness("ralph-1");
        let queue = MemoryQueue::with_items(vec![open_item("bd-1", 1)]);
        let agent = ScriptedAgent::new(vec![report(Verdict::Done, "ok")]);
        let verifier = ScriptedVerifier::default();
        let flaky = FaultyQueue::new(&queue);
        flaky.lost_claim_replies.set(3);
        let mut w = Worker::new(
            &flaky,
            &agent,
            &verifier,
            h.settings.clone(),
            h.session.clone(),
            StopSignal::new(),
        )
        .expect("worker");

        assert!(matches!(
            w.run_iteration().expect("iteration"),
            IterationOutcome::QueueUnavailable { .. }
        ));
        assert_eq!(queue.get("bd-1").expect("item").assignee(), Some("ralph-1"));

        assert_eq!(
            w.run_iteration().expect("iteration"),
            IterationOutcome::Completed {
                id: "bd-1".to_string(),
            }
        );
    }

    /// Injects queue faults the in-memory queue cannot express.
    struct FaultyQueue<'a> {
        inner: &'a MemoryQueue,
        broken_listing: bool,
        lost_claim_replies: Cell<u32>,
    }

    impl<'a> FaultyQueue<'a> {
        fn new(inner: &'a MemoryQueue) -> Self {
            Self {
                inner,
                broken_listing: false,
                lost_claim_replies: Cell::new(0),
            }
        }
    }

    impl WorkQueue for FaultyQueue<'_> {
        fn list_ready(&self, unassigned_only: bool) -> Result<Vec<WorkItem>> {
            if self.broken_listing {
                return Err(anyhow!("permission denied: .beads/beads.db"));
            }
            self.inner.list_ready(unassigned_only)
        }

        fn list(&self, status: Option<ItemStatus>) -> Result<Vec<WorkItem>> {
            self.inner.list(status)
        }

        fn show(&self, id: &str) -> Result<Option<WorkItem>> {
            self.inner.show(id)
        }

        fn claim(&self, id: &str, worker_id: &str) -> Result<ClaimOutcome> {
            let outcome = self.inner.claim(id, worker_id)?;
            let lost = self.lost_claim_replies.get();
            if lost == 0 {
                return Ok(outcome);
            }
            self.lost_claim_replies.set(lost - 1);
            Err(QueueUnavailable {
                op: "claim".to_string(),
                detail: "timed out".to_string(),
            }
            .into())
        }

        fn close(&self, id: &str, worker_id: &str, reason: &str) -> Result<()> {
            self.inner.close(id, worker_id, reason)
        }

        fn reopen(&self, id: &str) -> Result<()> {
            self.inner.reopen(id)
        }

        fn create(&self, item: &NewItem) -> Result<String> {
            self.inner.create(item)
        }

        fn link_dependency(&self, child_id: &str, parent_id: &str) -> Result<()> {
            self.inner.link_dependency(child_id, parent_id)
        }
    }

    #[test]
    fn close_reason_is_bounded() {
        assert_eq!(close_reason("  "), "done");
        assert_eq!(close_reason(&"x".repeat(500)).chars().count(), 200);
    }
}
