//! Test-only helpers: item builders, an in-memory queue, scripted agents,
//! and fake process hosts.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};

use crate::core::graph::creates_cycle;
use crate::core::idle::{Backoff, IdleShutdownPolicy};
use crate::core::selector::is_ready;
use crate::core::types::{
    AgentReport, ClaimOutcome, Decomposition, ItemKind, ItemStatus, NewItem, Verdict,
    VerifyOutcome, WorkItem,
};
use crate::io::agent::{Agent, AgentRequest, AgentTimedOut};
use crate::io::procs::{ExitInfo, LivenessProbe, ProcessHost, SpawnSpec, Spawned};
use crate::io::queue::{DependencyCycle, QueueUnavailable, RetryPolicy, WorkQueue, ensure_owner};
use crate::io::verify::{VerifyRequest, Verifier};
use crate::worker::WorkerSettings;

/// Open, unassigned task with a deterministic title.
pub fn open_item(id: &str, priority: u8) -> WorkItem {
    WorkItem {
        id: id.to_string(),
        title: format!("{id} title"),
        description: String::new(),
        kind: Some(ItemKind::Task),
        status: ItemStatus::Open,
        assignee: None,
        priority,
        dependencies: Vec::new(),
    }
}

/// Task claimed by `assignee`.
pub fn in_progress(id: &str, assignee: &str) -> WorkItem {
    WorkItem {
        status: ItemStatus::InProgress,
        assignee: Some(assignee.to_string()),
        ..open_item(id, 2)
    }
}

pub fn item_with_kind(id: &str, kind: ItemKind) -> WorkItem {
    WorkItem {
        kind: Some(kind),
        ..open_item(id, 2)
    }
}

pub fn epic(id: &str) -> WorkItem {
    item_with_kind(id, ItemKind::Epic)
}

/// Settings with no waiting anywhere: zero backoff, zero pause, idle limit 3.
pub fn fast_settings(worker_id: &str, workdir: &Path) -> WorkerSettings {
    WorkerSettings {
        worker_id: worker_id.to_string(),
        workdir: workdir.to_path_buf(),
        idle: IdleShutdownPolicy {
            idle_limit: 3,
            auto_shutdown: true,
            backoff: Backoff::new(Duration::ZERO, Duration::ZERO),
        },
        retry: RetryPolicy {
            attempts: 3,
            backoff: Backoff::new(Duration::ZERO, Duration::ZERO),
        },
        iteration_pause: Duration::ZERO,
        agent_timeout: Duration::from_secs(60),
        agent_output_limit_bytes: 100_000,
        verify_timeout: Duration::from_secs(60),
        verify_output_limit_bytes: 100_000,
        prompt_budget_bytes: 64_000,
    }
}

/// Mutation observed by [`MemoryQueue`], in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Claimed { id: String, worker: String },
    Closed { id: String, worker: String },
    Reopened { id: String },
    Created { id: String },
    Linked { child: String, parent: String },
}

#[derive(Debug, Default)]
struct QueueState {
    items: BTreeMap<String, WorkItem>,
    next_id: u32,
    close_reasons: HashMap<String, String>,
    events: Vec<QueueEvent>,
    list_ready_calls: u32,
    fail_next: u32,
    thief: Option<String>,
}

impl QueueState {
    fn maybe_fail(&mut self, op: &str) -> Result<()> {
        if self.fail_next == 0 {
            return Ok(());
        }
        self.fail_next -= 1;
        Err(QueueUnavailable {
            op: op.to_string(),
            detail: "database is locked".to_string(),
        }
        .into())
    }

    fn claim_open(&mut self, id: &str, worker_id: &str) -> ClaimOutcome {
        let Some(item) = self.items.get_mut(id) else {
            return ClaimOutcome::AlreadyClaimed;
        };
        if item.status != ItemStatus::Open || !item.is_unassigned() {
            return ClaimOutcome::AlreadyClaimed;
        }
        item.status = ItemStatus::InProgress;
        item.assignee = Some(worker_id.to_string());
        self.events.push(QueueEvent::Claimed {
            id: id.to_string(),
            worker: worker_id.to_string(),
        });
        ClaimOutcome::Claimed
    }
}

/// In-memory [`WorkQueue`] with the same compare-and-swap claim semantics as
/// the real tracker. Clones share state, so one queue can back many workers.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueue {
    state: Arc<Mutex<QueueState>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(items: Vec<WorkItem>) -> Self {
        let queue = Self::new();
        for item in items {
            queue.insert(item);
        }
        queue
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, item: WorkItem) {
        self.lock().items.insert(item.id.clone(), item);
    }

    pub fn get(&self, id: &str) -> Option<WorkItem> {
        self.lock().items.get(id).cloned()
    }

    pub fn all(&self) -> Vec<WorkItem> {
        self.lock().items.values().cloned().collect()
    }

    pub fn close_reason(&self, id: &str) -> Option<String> {
        self.lock().close_reasons.get(id).cloned()
    }

    pub fn events(&self) -> Vec<QueueEvent> {
        self.lock().events.clone()
    }

    pub fn list_ready_calls(&self) -> u32 {
        self.lock().list_ready_calls
    }

    /// Fail the next `n` operations with [`QueueUnavailable`].
    pub fn fail_next(&self, n: u32) {
        self.lock().fail_next = n;
    }

    /// Let `thief` win the next claim race, whatever item it targets.
    pub fn steal_next_claim(&self, thief: &str) {
        self.lock().thief = Some(thief.to_string());
    }
}

impl WorkQueue for MemoryQueue {
    fn list_ready(&self, unassigned_only: bool) -> Result<Vec<WorkItem>> {
        let mut state = self.lock();
        state.list_ready_calls += 1;
        state.maybe_fail("list_ready")?;
        let all: HashMap<&str, &WorkItem> = state
            .items
            .iter()
            .map(|(id, item)| (id.as_str(), item))
            .collect();
        Ok(state
            .items
            .values()
            .filter(|item| is_ready(item, &all))
            .filter(|item| !unassigned_only || item.is_unassigned())
            .cloned()
            .collect())
    }

    fn list(&self, status: Option<ItemStatus>) -> Result<Vec<WorkItem>> {
        let mut state = self.lock();
        state.maybe_fail("list")?;
        Ok(state
            .items
            .values()
            .filter(|item| status.is_none_or(|s| item.status == s))
            .cloned()
            .collect())
    }

    fn show(&self, id: &str) -> Result<Option<WorkItem>> {
        let mut state = self.lock();
        state.maybe_fail("show")?;
        Ok(state.items.get(id).cloned())
    }

    fn claim(&self, id: &str, worker_id: &str) -> Result<ClaimOutcome> {
        let mut state = self.lock();
        state.maybe_fail("claim")?;
        if let Some(thief) = state.thief.take() {
            state.claim_open(id, &thief);
        }
        Ok(state.claim_open(id, worker_id))
    }

    fn close(&self, id: &str, worker_id: &str, reason: &str) -> Result<()> {
        let mut state = self.lock();
        state.maybe_fail("close")?;
        let item = state
            .items
            .get_mut(id)
            .ok_or_else(|| anyhow!("no such item {id}"))?;
        ensure_owner(item, worker_id)?;
        item.status = ItemStatus::Closed;
        item.assignee = None;
        state
            .close_reasons
            .insert(id.to_string(), reason.to_string());
        state.events.push(QueueEvent::Closed {
            id: id.to_string(),
            worker: worker_id.to_string(),
        });
        Ok(())
    }

    fn reopen(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        state.maybe_fail("reopen")?;
        let item = state
            .items
            .get_mut(id)
            .ok_or_else(|| anyhow!("no such item {id}"))?;
        if item.status != ItemStatus::InProgress {
            bail!("{id} is {} and cannot be reopened", item.status);
        }
        item.status = ItemStatus::Open;
        item.assignee = None;
        state
            .events
            .push(QueueEvent::Reopened { id: id.to_string() });
        Ok(())
    }

    fn create(&self, new: &NewItem) -> Result<String> {
        let mut state = self.lock();
        state.maybe_fail("create")?;
        state.next_id += 1;
        let id = format!("mem-{}", state.next_id);
        state.items.insert(
            id.clone(),
            WorkItem {
                id: id.clone(),
                title: new.title.clone(),
                description: new.description.clone(),
                kind: Some(new.kind),
                status: ItemStatus::Open,
                assignee: None,
                priority: new.priority,
                dependencies: Vec::new(),
            },
        );
        state.events.push(QueueEvent::Created { id: id.clone() });
        Ok(id)
    }

    fn link_dependency(&self, child_id: &str, parent_id: &str) -> Result<()> {
        let mut state = self.lock();
        state.maybe_fail("link_dependency")?;
        for id in [child_id, parent_id] {
            if !state.items.contains_key(id) {
                bail!("no such item {id}");
            }
        }
        let graph: HashMap<String, Vec<String>> = state
            .items
            .values()
            .map(|item| (item.id.clone(), item.dependencies.clone()))
            .collect();
        if creates_cycle(&graph, child_id, parent_id) {
            return Err(DependencyCycle {
                child: child_id.to_string(),
                parent: parent_id.to_string(),
            }
            .into());
        }
        if let Some(child) = state.items.get_mut(child_id) {
            child.dependencies.push(parent_id.to_string());
        }
        state.events.push(QueueEvent::Linked {
            child: child_id.to_string(),
            parent: parent_id.to_string(),
        });
        Ok(())
    }
}

/// One scripted agent invocation.
#[derive(Debug, Clone)]
pub enum AgentStep {
    Report(AgentReport),
    Decompose(Decomposition),
    /// Write this text verbatim as the output file.
    Raw(String),
    /// Fail as if the agent process exited non-zero.
    Fail(String),
    TimeOut,
    /// Succeed without writing an output file.
    NoOutput,
}

pub fn report(verdict: Verdict, summary: &str) -> AgentStep {
    AgentStep::Report(AgentReport {
        verdict,
        summary: summary.to_string(),
        follow_ups: Vec::new(),
    })
}

/// Decomposition with `n` task children named `child 1..=n`.
pub fn decomposition(n: usize) -> AgentStep {
    AgentStep::Decompose(Decomposition {
        summary: format!("split into {n}"),
        children: (1..=n)
            .map(|i| NewItem {
                title: format!("child {i}"),
                kind: ItemKind::Task,
                priority: 2,
                description: String::new(),
            })
            .collect(),
    })
}

type AgentHook = Box<dyn Fn(&AgentRequest) + Send + Sync>;

/// [`Agent`] that replays [`AgentStep`]s in order and records each request.
#[derive(Default)]
pub struct ScriptedAgent {
    steps: Mutex<VecDeque<AgentStep>>,
    requests: Mutex<Vec<AgentRequest>>,
    hook: Option<AgentHook>,
}

impl ScriptedAgent {
    pub fn new(steps: Vec<AgentStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
            hook: None,
        }
    }

    /// Run `hook` at the start of every invocation.
    pub fn with_hook(mut self, hook: impl Fn(&AgentRequest) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.prompt).collect()
    }
}

impl Agent for ScriptedAgent {
    fn exec(&self, request: &AgentRequest) -> Result<()> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request.clone());
        if let Some(hook) = &self.hook {
            hook(request);
        }
        let step = self
            .steps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
            .ok_or_else(|| anyhow!("scripted agent ran out of steps"))?;
        let body = match step {
            AgentStep::Report(report) => serde_json::to_string(&report)?,
            AgentStep::Decompose(plan) => serde_json::to_string(&plan)?,
            AgentStep::Raw(raw) => raw,
            AgentStep::Fail(message) => bail!("{message}"),
            AgentStep::TimeOut => {
                return Err(AgentTimedOut {
                    timeout: request.timeout,
                }
                .into());
            }
            AgentStep::NoOutput => return Ok(()),
        };
        if let Some(parent) = request.output_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&request.output_path, body)?;
        Ok(())
    }
}

/// [`Verifier`] that replays outcomes and log text; `Skipped` once exhausted.
#[derive(Debug, Default)]
pub struct ScriptedVerifier {
    outcomes: Mutex<VecDeque<(VerifyOutcome, String)>>,
}

impl ScriptedVerifier {
    pub fn new(outcomes: Vec<(VerifyOutcome, String)>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
        }
    }
}

impl Verifier for ScriptedVerifier {
    fn verify(&self, request: &VerifyRequest) -> Result<VerifyOutcome> {
        let next = self
            .outcomes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        let Some((outcome, log)) = next else {
            return Ok(VerifyOutcome::Skipped);
        };
        if !log.is_empty() {
            if let Some(parent) = request.log_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&request.log_path, log)?;
        }
        Ok(outcome)
    }
}

/// [`LivenessProbe`] over a fixed set of live PIDs.
#[derive(Debug, Clone, Default)]
pub struct FakeProbe {
    pub alive: HashSet<u32>,
}

impl FakeProbe {
    pub fn alive(pids: &[u32]) -> Self {
        Self {
            alive: pids.iter().copied().collect(),
        }
    }
}

impl LivenessProbe for FakeProbe {
    fn is_alive(&self, pid: u32, _start_time: Option<u64>) -> bool {
        self.alive.contains(&pid)
    }

    fn start_time(&self, pid: u32) -> Option<u64> {
        self.alive.contains(&pid).then_some(1_000)
    }
}

#[derive(Debug, Default)]
struct HostState {
    next_pid: u32,
    spawned: Vec<(u32, SpawnSpec)>,
    exits: HashMap<u32, ExitInfo>,
    stop_requests: Vec<u32>,
    exit_on_stop: bool,
    refuse_spawn: HashSet<String>,
}

/// [`ProcessHost`] that only records what it was asked to do.
///
/// PIDs start at 100. Processes run until [`FakeHost::finish`] is called or,
/// with [`FakeHost::exiting_on_stop`], until a stop is requested.
#[derive(Debug, Clone, Default)]
pub struct FakeHost {
    state: Arc<Mutex<HostState>>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Processes exit cleanly as soon as they are asked to stop.
    pub fn exiting_on_stop(self) -> Self {
        self.lock().exit_on_stop = true;
        self
    }

    /// Make spawning `worker_id` fail.
    pub fn refuse_spawn(&self, worker_id: &str) {
        self.lock().refuse_spawn.insert(worker_id.to_string());
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn finish(&self, pid: u32, code: Option<i32>) {
        self.lock().exits.insert(pid, ExitInfo { code });
    }

    pub fn spawned(&self) -> Vec<(u32, SpawnSpec)> {
        self.lock().spawned.clone()
    }

    pub fn stop_requests(&self) -> Vec<u32> {
        self.lock().stop_requests.clone()
    }
}

impl ProcessHost for FakeHost {
    fn spawn(&mut self, spec: &SpawnSpec) -> Result<Spawned> {
        let mut state = self.lock();
        if state.refuse_spawn.contains(&spec.worker_id) {
            bail!("spawn refused for {}", spec.worker_id);
        }
        let pid = 100 + state.next_pid;
        state.next_pid += 1;
        state.spawned.push((pid, spec.clone()));
        Ok(Spawned {
            pid,
            start_time: Some(1_000),
        })
    }

    fn exit_status(&mut self, pid: u32) -> Result<Option<ExitInfo>> {
        Ok(self.lock().exits.get(&pid).copied())
    }

    fn request_stop(&mut self, pid: u32) -> Result<()> {
        let mut state = self.lock();
        state.stop_requests.push(pid);
        if state.exit_on_stop {
            state.exits.entry(pid).or_insert(ExitInfo { code: Some(0) });
        }
        Ok(())
    }
}

/// Temporary git repository with one committed file, `src/lib.rs`.
pub struct TestRepo {
    dir: tempfile::TempDir,
}

impl TestRepo {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = Self { dir };
        repo.git(&["init", "-q"]);
        repo.git(&["config", "user.email", "swarm@example.com"]);
        repo.git(&["config", "user.name", "swarm tests"]);
        repo.git(&["config", "commit.gpgsign", "false"]);
        repo.write("src/lib.rs", "original\n");
        repo.git(&["add", "."]);
        repo.git(&["commit", "-q", "-m", "initial"]);
        repo
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn join(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    pub fn write(&self, rel: &str, contents: &str) {
        let path = self.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, contents).expect("write file");
    }

    pub fn git(&self, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .status()
            .expect("run git");
        assert!(status.success(), "git {args:?} failed");
    }
}
