//! Worker swarm orchestrator CLI.
//!
//! Runs agent workers in parallel against the beads (`bd`) work queue in the
//! current project. `start` launches workers as separate processes, `status`
//! summarizes the queue and the workers, `cleanup` recovers work left behind
//! by crashed workers, and `stop` ends a running swarm.

use std::env;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use tracing::warn;

use swarm::core::selector::select_next;
use swarm::core::types::{ItemKind, RunMode, WorkItem, WorkerState};
use swarm::exit_codes;
use swarm::io::agent::{AGENT_REPORT_SCHEMA, AgentTimedOut, ClaudeAgent, DECOMPOSITION_SCHEMA};
use swarm::io::beads::BeadsQueue;
use swarm::io::config::{CONFIG_RELATIVE_PATH, SwarmConfig, load_config};
use swarm::io::git::Git;
use swarm::io::procs::{OsProcessHost, SysinfoProbe, request_terminate};
use swarm::io::prompt::{PromptBuilder, PromptInputs};
use swarm::io::queue::WorkQueue;
use swarm::io::session::{SessionPaths, create_session, latest_session};
use swarm::io::signal::StopSignal;
use swarm::io::tail::LogFollower;
use swarm::io::verify::CommandVerifier;
use swarm::logging;
use swarm::recovery::{CleanupOptions, StdinConfirm, cleanup};
use swarm::status::{StatusOptions, collect_status};
use swarm::swarm::{
    MonitorEvent, MonitorExit, StartOptions, SwarmController, stop_recorded, worker_id,
};
use swarm::worker::{Worker, WorkerExit, WorkerSettings};

const BEADS_DIR: &str = ".beads";
/// Poll interval while streaming worker output.
const STREAM_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(
    name = "swarm",
    version,
    about = "Run agent workers in parallel against a shared work queue"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Launch workers that claim and complete ready items.
    #[command(alias = "build")]
    Start(StartArgs),
    /// Summarize the queue, live workers, and orphaned work.
    Status {
        /// List every item.
        #[arg(short, long)]
        all: bool,
        /// Show the dependency tree.
        #[arg(short, long)]
        tree: bool,
    },
    /// Reset items claimed by workers that are no longer running.
    Cleanup {
        /// Do not ask for confirmation.
        #[arg(short, long)]
        force: bool,
        /// Also revert uncommitted changes in the working tree first.
        #[arg(long)]
        discard_changes: bool,
    },
    /// Ask the workers of the latest session to stop.
    Stop {
        /// Seconds to wait before reporting workers still running.
        #[arg(long)]
        grace_secs: Option<u64>,
    },
    /// Run a single worker in this process (launched by `start`).
    #[command(hide = true)]
    Worker(WorkerArgs),
}

#[derive(Args)]
struct StartArgs {
    /// Number of workers.
    #[arg(short, long)]
    workers: Option<u32>,
    #[command(flatten)]
    behavior: BehaviorArgs,
    /// Print the prompt the first worker would receive, then exit.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args)]
struct WorkerArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    session: String,
    #[command(flatten)]
    behavior: BehaviorArgs,
}

/// Flags shared by `start` and the workers it launches.
#[derive(Args)]
struct BehaviorArgs {
    /// Agent model.
    #[arg(short, long)]
    model: Option<String>,
    /// Each worker runs exactly one iteration.
    #[arg(long)]
    once: bool,
    /// Keep polling an empty queue instead of exiting.
    #[arg(long)]
    no_auto_shutdown: bool,
    /// Consecutive empty checks before a worker exits.
    #[arg(long)]
    idle_limit: Option<u32>,
    /// Stream agent output from every worker to the terminal.
    #[arg(short, long)]
    verbose: bool,
}

impl BehaviorArgs {
    fn apply(&self, cfg: &mut SwarmConfig) -> Result<RunMode> {
        if let Some(model) = &self.model {
            cfg.model = model.clone();
        }
        if self.no_auto_shutdown {
            cfg.auto_shutdown = false;
        }
        if let Some(limit) = self.idle_limit {
            cfg.idle_limit = limit;
        }
        cfg.validate()?;
        Ok(if self.once { RunMode::Once } else { RunMode::Swarm })
    }
}

fn main() {
    let cli = Cli::parse();
    logging::init(match cli.command {
        Command::Worker(_) => logging::WORKER_FILTER,
        _ => logging::CONTROLLER_FILTER,
    });
    match run(cli) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            process::exit(exit_codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let root = env::current_dir().context("resolve current directory")?;
    ensure_project(&root)?;
    let cfg = load_config(&root.join(CONFIG_RELATIVE_PATH))?;
    match cli.command {
        Command::Start(args) => cmd_start(&root, cfg, &args),
        Command::Status { all, tree } => cmd_status(&root, &cfg, StatusOptions { all, tree }),
        Command::Cleanup {
            force,
            discard_changes,
        } => cmd_cleanup(&root, &cfg, force, discard_changes),
        Command::Stop { grace_secs } => cmd_stop(&root, &cfg, grace_secs),
        Command::Worker(args) => cmd_worker(&root, cfg, &args),
    }
}

fn ensure_project(root: &Path) -> Result<()> {
    if !root.join(BEADS_DIR).is_dir() {
        bail!("not a swarm project (no {BEADS_DIR} found)");
    }
    Ok(())
}

fn queue_for(root: &Path, cfg: &SwarmConfig) -> BeadsQueue {
    BeadsQueue::new(root, cfg.queue_timeout())
}

fn cmd_start(root: &Path, mut cfg: SwarmConfig, args: &StartArgs) -> Result<i32> {
    let mode = args.behavior.apply(&mut cfg)?;
    let workers = args.workers.unwrap_or(cfg.workers);
    if workers == 0 {
        bail!("--workers must be at least 1");
    }

    let queue = queue_for(root, &cfg);
    let ready = queue.list_ready(false)?;
    let unassigned = ready.iter().filter(|i| i.is_unassigned()).count();
    println!("Ready items: {} ({unassigned} unassigned)", ready.len());
    if unassigned == 0 {
        println!("No ready work. Create or plan items with `bd create` first.");
        return Ok(exit_codes::OK);
    }

    if args.dry_run {
        return dry_run(root, &cfg, &ready);
    }

    let log_root = cfg.log_root(root);
    let session = create_session(&log_root, Local::now())?;
    let stop = StopSignal::new();
    stop.install_handler()?;

    let options = StartOptions {
        program: env::current_exe().context("locate swarm executable")?,
        workdir: root.to_path_buf(),
        workers,
        mode,
        model: cfg.model.clone(),
        auto_shutdown: cfg.auto_shutdown,
        idle_limit: cfg.idle_limit,
        stagger: Duration::from_millis(cfg.launch_stagger_ms),
        verbose: args.behavior.verbose,
    };
    let mut swarm = SwarmController::new(OsProcessHost::new(), session);
    println!(
        "Session {} ({} mode, model {})",
        swarm.session().session_id,
        match mode {
            RunMode::Once => "once",
            RunMode::Swarm => "swarm",
        },
        cfg.model
    );
    let mut follower = LogFollower::new();
    for record in swarm.start(&options, &stop)? {
        println!(
            "  {} pid {}  tail -f {}",
            record.worker_id,
            record.pid,
            display_rel(root, &record.log_path)
        );
        follower.follow(record.worker_id.clone(), record.log_path.clone());
    }

    let verbose = args.behavior.verbose;
    let mut interval = Duration::from_secs(cfg.monitor_interval_secs.max(1));
    if verbose {
        interval = interval.min(STREAM_INTERVAL);
    }
    let exit = swarm.monitor(interval, &stop, |event| match event {
        MonitorEvent::Tick if verbose => print_new_lines(&mut follower),
        MonitorEvent::Tick => {}
        MonitorEvent::Transition(t) => match t.state {
            WorkerState::Crashed => {
                println!("{} crashed (exit code {:?})", t.worker_id, t.exit_code)
            }
            _ => println!("{} exited", t.worker_id),
        },
    })?;
    if exit == MonitorExit::StopRequested {
        println!("Stopping workers...");
        let survivors = swarm.stop_all(Duration::from_secs(cfg.stop_grace_secs))?;
        if !survivors.is_empty() {
            println!("Still running: {}", survivors.join(", "));
            return Ok(exit_codes::STILL_RUNNING);
        }
    }

    if verbose {
        print_new_lines(&mut follower);
    }

    let crashed: Vec<&str> = swarm
        .workers()
        .iter()
        .filter(|w| w.state == WorkerState::Crashed)
        .map(|w| w.worker_id.as_str())
        .collect();
    if !crashed.is_empty() {
        println!(
            "Crashed workers: {}. Their items stay in progress; run `swarm cleanup`.",
            crashed.join(", ")
        );
    }
    Ok(exit_codes::OK)
}

fn print_new_lines(follower: &mut LogFollower) {
    match follower.drain() {
        Ok(lines) => {
            for (worker, line) in lines {
                println!("[{worker}] {line}");
            }
        }
        Err(err) => warn!(err = %format!("{err:#}"), "failed to read worker logs"),
    }
}

fn dry_run(root: &Path, cfg: &SwarmConfig, ready: &[WorkItem]) -> Result<i32> {
    let Some(item) = select_next(ready) else {
        println!("Nothing selectable.");
        return Ok(exit_codes::OK);
    };
    let first = worker_id(1);
    let output_path = cfg.log_root(root).join("dry-run").join("report.json");
    let prompts = PromptBuilder::new(cfg.prompt_budget_bytes)?;
    let is_epic = item.kind == Some(ItemKind::Epic);
    let inputs = PromptInputs {
        worker_id: &first,
        item,
        output_path: &output_path,
        schema: if is_epic {
            DECOMPOSITION_SCHEMA
        } else {
            AGENT_REPORT_SCHEMA
        },
        attempt: 1,
        failure: None,
    };
    let prompt = if is_epic {
        prompts.build_decompose(&inputs)?
    } else {
        prompts.build_execute(&inputs)?
    };
    println!("{first} would claim {} ({})\n", item.id, item.title);
    println!("{prompt}");
    Ok(exit_codes::OK)
}

fn cmd_status(root: &Path, cfg: &SwarmConfig, options: StatusOptions) -> Result<i32> {
    let report = collect_status(&queue_for(root, cfg), &cfg.log_root(root), &SysinfoProbe)?;
    println!("{}", report.render(options));
    Ok(exit_codes::OK)
}

fn cmd_cleanup(root: &Path, cfg: &SwarmConfig, force: bool, discard_changes: bool) -> Result<i32> {
    let git = Git::new(root);
    if discard_changes && !git.is_repo() {
        bail!("--discard-changes needs a git working tree");
    }
    let options = CleanupOptions {
        force,
        discard_changes,
        excluded_prefixes: excluded_prefixes(cfg),
    };
    let report = cleanup(
        &queue_for(root, cfg),
        &git,
        &cfg.log_root(root),
        &SysinfoProbe,
        &mut StdinConfirm,
        &options,
    )?;

    if !report.scan.has_orphans() {
        println!("No orphaned work.");
        if !report.scan.active.is_empty() {
            println!(
                "{} item(s) held by running workers.",
                report.scan.active.len()
            );
        }
        return Ok(exit_codes::OK);
    }
    for item in &report.scan.orphaned {
        println!(
            "  {} [{}] {} (was {})",
            item.id,
            item.kind.map_or("?", ItemKind::as_str),
            item.title,
            item.assignee().unwrap_or("unassigned")
        );
    }
    if !report.changes.is_empty() {
        println!("Uncommitted changes:");
        for change in &report.changes {
            println!("  {} {}", change.code, change.path);
        }
    }
    if report.declined {
        println!("Cleanup cancelled; orphaned work remains in progress.");
        return Ok(exit_codes::ORPHANS_REMAIN);
    }
    if discard_changes && !report.changes.is_empty() && !report.reopened.is_empty() {
        println!("Discarded {} uncommitted change(s).", report.changes.len());
    }
    println!("Reopened {} item(s).", report.reopened.len());
    for (id, reason) in &report.skipped {
        println!("  skipped {id}: {reason}");
    }
    Ok(exit_codes::OK)
}

fn excluded_prefixes(cfg: &SwarmConfig) -> Vec<String> {
    let mut log_dir = cfg
        .log_dir
        .to_string_lossy()
        .trim_end_matches('/')
        .to_string();
    log_dir.push('/');
    vec![format!("{BEADS_DIR}/"), log_dir, ".swarm/".to_string()]
}

fn cmd_stop(root: &Path, cfg: &SwarmConfig, grace_secs: Option<u64>) -> Result<i32> {
    let Some(session) = latest_session(&cfg.log_root(root))? else {
        println!("No swarm sessions found.");
        return Ok(exit_codes::OK);
    };
    let grace = Duration::from_secs(grace_secs.unwrap_or(cfg.stop_grace_secs));
    let survivors = stop_recorded(&session, &SysinfoProbe, request_terminate, grace)?;
    if survivors.is_empty() {
        println!("Session {}: no workers running.", session.session_id);
        return Ok(exit_codes::OK);
    }
    for record in &survivors {
        println!("Still running: {} (pid {})", record.worker_id, record.pid);
    }
    Ok(exit_codes::STILL_RUNNING)
}

fn cmd_worker(root: &Path, mut cfg: SwarmConfig, args: &WorkerArgs) -> Result<i32> {
    let mode = args.behavior.apply(&mut cfg)?;
    let session = SessionPaths::open(&cfg.log_root(root), &args.session);
    let stop = StopSignal::new();
    stop.install_handler()?;

    let mut worker = Worker::new(
        queue_for(root, &cfg),
        ClaudeAgent::new(cfg.agent.command.clone(), cfg.model.clone())
            .verbose(args.behavior.verbose),
        CommandVerifier::new(cfg.verify.command.clone()),
        WorkerSettings::from_config(&args.id, PathBuf::from(root), &cfg),
        session,
        stop,
    )?;
    match worker.run(mode) {
        Ok(WorkerExit::OnceComplete | WorkerExit::IdleShutdown | WorkerExit::Stopped) => {
            Ok(exit_codes::OK)
        }
        Err(err) if err.downcast_ref::<AgentTimedOut>().is_some() => {
            eprintln!("{err:#}");
            Ok(exit_codes::WORKER_ABANDONED)
        }
        Err(err) => Err(err),
    }
}

fn display_rel(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative.display().to_string()
}
