//! Command-line interface for ledgerflow.
//!
//! Provides the benchmark harness, crash recovery, and inspection commands
//! (status, history, timing, runs, cancel) against the configured event log.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::activities;
use crate::config::{config, ResolvedConfig, StoreKind};
use crate::core::{
    timing, EventLog, FileEventLog, IdReusePolicy, InMemoryEventLog, Orchestrator, StartWorkflowRequest,
    TaskQueueRegistry, TimingReport, WorkflowRegistry,
};
use crate::domain::{EventKind, RunStatus};
use crate::worker::Worker;
use crate::workflows::{BenchInput, BenchWorkflow};

/// ledgerflow - Event-sourced durable workflow orchestrator
#[derive(Parser, Debug)]
#[command(name = "ledgerflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the fibonacci benchmark workflow with in-process workers
    Bench {
        /// Number of activity calls
        #[arg(long, default_value = "10")]
        iter: u32,

        /// Argument of every fibo call
        #[arg(long, default_value = "33")]
        fibo_n: u64,

        /// Number of workers polling the task queue
        #[arg(long, default_value = "1")]
        workers: usize,

        /// Schedule all calls at once instead of one after another
        #[arg(long)]
        parallel: bool,

        /// Event log backend (defaults to the configured one)
        #[arg(long, value_enum)]
        store: Option<StoreArg>,

        /// Write the timing report as benchmark JSON to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Resume every running workflow in the file log after a crash
    Recover {
        /// Workers per task queue
        #[arg(long, default_value = "1")]
        workers: usize,
    },

    /// Show the state of a workflow's latest run
    Status {
        /// Workflow ID
        workflow_id: String,
    },

    /// Print a workflow's event history
    History {
        /// Workflow ID
        workflow_id: String,

        /// Print raw JSONL events
        #[arg(long)]
        json: bool,
    },

    /// Show per-activity timings of a workflow's latest run
    Timing {
        /// Workflow ID
        workflow_id: String,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Cancel a running workflow
    Cancel {
        /// Workflow ID
        workflow_id: String,

        /// Reason recorded in the history
        #[arg(short, long, default_value = "cancelled from the command line")]
        reason: String,
    },

    /// Show resolved configuration (debug)
    Config,
}

/// Event log backend selectable on the command line
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StoreArg {
    Memory,
    File,
}

impl From<StoreArg> for StoreKind {
    fn from(arg: StoreArg) -> Self {
        match arg {
            StoreArg::Memory => StoreKind::Memory,
            StoreArg::File => StoreKind::File,
        }
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Bench {
                iter,
                fibo_n,
                workers,
                parallel,
                store,
                output,
            } => {
                let input = BenchInput {
                    iter,
                    fibo_n,
                    parallel,
                };
                run_bench(input, workers, store.map(StoreKind::from), output).await
            }
            Commands::Recover { workers } => recover(workers).await,
            Commands::Status { workflow_id } => show_status(&workflow_id).await,
            Commands::History { workflow_id, json } => show_history(&workflow_id, json).await,
            Commands::Timing { workflow_id } => show_timing(&workflow_id).await,
            Commands::Runs { limit } => list_runs(limit).await,
            Commands::Cancel {
                workflow_id,
                reason,
            } => cancel(&workflow_id, &reason).await,
            Commands::Config => show_config().await,
        }
    }
}

/// Build an orchestrator over the configured event log
async fn open_orchestrator(cfg: &ResolvedConfig, store: StoreKind) -> Result<Arc<Orchestrator>> {
    let log: Arc<dyn EventLog> = match store {
        StoreKind::Memory => Arc::new(InMemoryEventLog::new()),
        StoreKind::File => {
            let runs_dir = cfg.runs_dir();
            Arc::new(
                FileEventLog::open(&runs_dir)
                    .await
                    .with_context(|| format!("Failed to open event log at {}", runs_dir.display()))?,
            )
        }
    };

    let bench = BenchWorkflow::default()
        .with_start_to_close_timeout(cfg.start_to_close_timeout())
        .with_retry_policy(cfg.activity_defaults.retry_policy.clone());

    Ok(Arc::new(Orchestrator::new(
        log,
        Arc::new(TaskQueueRegistry::new()),
        WorkflowRegistry::new().with(bench),
        cfg.orchestrator_config(),
    )))
}

/// In-process workers plus the timer loop, stopped together
struct Runtime {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Runtime {
    async fn spawn(
        orchestrator: &Arc<Orchestrator>,
        cfg: &ResolvedConfig,
        task_queues: &BTreeSet<String>,
        workers: usize,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();

        for name in task_queues {
            let queue = orchestrator.task_queue(name).await;
            for i in 0..workers.max(1) {
                let worker = Worker::new(orchestrator.clone(), queue.clone(), activities::builtin())
                    .with_worker_id(format!("{}", i))
                    .with_options(cfg.worker_options());
                let rx = shutdown_rx.clone();
                handles.push(tokio::spawn(async move { worker.run(rx).await }));
            }
        }

        let timer = orchestrator.clone();
        handles.push(tokio::spawn(async move {
            timer.run_timer_loop(shutdown_rx).await
        }));

        Self { shutdown, handles }
    }

    async fn stop(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Run the bench workflow end to end and print its timing report
async fn run_bench(
    input: BenchInput,
    workers: usize,
    store: Option<StoreKind>,
    output: Option<PathBuf>,
) -> Result<()> {
    let cfg = config()?;
    let store = store.unwrap_or(cfg.store);
    let orchestrator = open_orchestrator(cfg, store).await?;

    let workflow_id = input.workflow_id();
    let task_queue = input.task_queue();
    eprintln!(
        "Running {} ({} iterations of fibo({}), {} worker(s), {}, {} store)",
        workflow_id,
        input.iter,
        input.fibo_n,
        workers,
        if input.parallel { "parallel" } else { "sequential" },
        store
    );

    let runtime = Runtime::spawn(&orchestrator, cfg, &BTreeSet::from([task_queue.clone()]), workers).await;

    let started = Instant::now();
    let request = StartWorkflowRequest::new(
        workflow_id.clone(),
        BenchWorkflow::TYPE,
        serde_json::to_value(&input)?,
        task_queue,
    )
    .with_id_reuse_policy(IdReusePolicy::TerminateIfRunning);

    let result = match orchestrator.start_workflow(request).await {
        Ok(_) => orchestrator.await_result(&workflow_id).await,
        Err(e) => Err(e),
    };
    let elapsed = started.elapsed();
    runtime.stop().await;

    let history = orchestrator.history(&workflow_id).await?;
    if let Some(report) = timing::analyze(history.events()) {
        print_timing(&report);

        if let Some(path) = output {
            let json = serde_json::to_string_pretty(&report.benchmark_json(workers))?;
            std::fs::write(&path, json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("Benchmark data written to {}", path.display());
        }
    }

    let result = result.with_context(|| format!("Workflow {} did not complete", workflow_id))?;
    println!("{}", serde_json::to_string(&result)?);
    eprintln!("\n[{} completed in {:.3}s]", workflow_id, elapsed.as_secs_f64());

    Ok(())
}

/// Resume running workflows from the file log
async fn recover(workers: usize) -> Result<()> {
    let cfg = config()?;
    let orchestrator = open_orchestrator(cfg, StoreKind::File).await?;

    let running: Vec<_> = orchestrator
        .list_runs()
        .await?
        .into_iter()
        .filter(|run| run.is_running())
        .collect();

    if running.is_empty() {
        println!("No running workflows to recover");
        return Ok(());
    }

    let task_queues: BTreeSet<String> = running.iter().map(|run| run.task_queue.clone()).collect();
    let runtime = Runtime::spawn(&orchestrator, cfg, &task_queues, workers).await;

    let recovered = orchestrator.recover().await?;
    eprintln!("Recovered {} run(s)", recovered);

    for run in &running {
        match orchestrator.await_result(&run.key.workflow_id).await {
            Ok(result) => println!("{}: {}", run.key.workflow_id, result),
            Err(e) => println!("{}: {}", run.key.workflow_id, e),
        }
    }

    runtime.stop().await;
    Ok(())
}

/// Show the status of a workflow
async fn show_status(workflow_id: &str) -> Result<()> {
    let orchestrator = open_orchestrator(config()?, StoreKind::File).await?;
    let run = orchestrator.describe(workflow_id).await?;

    println!("Workflow ID: {}", run.key.workflow_id);
    println!("Run ID: {}", run.key.run_id);
    println!("Type: {}", run.workflow_type);
    println!("Task queue: {}", run.task_queue);
    println!("Status: {}", run.status.label());
    println!("Started: {}", run.started_at);
    if let Some(closed) = run.closed_at {
        println!("Closed: {}", closed);
    }
    println!(
        "Activities: {} scheduled, {} completed, {} failed",
        run.activities_scheduled, run.activities_completed, run.activities_failed
    );

    match &run.status {
        RunStatus::Completed { result } => println!("\nResult: {}", result),
        RunStatus::Failed {
            error_kind,
            message,
        } => println!("\nError: {}: {}", error_kind, message),
        _ => {}
    }

    Ok(())
}

/// Print the event history of a workflow
async fn show_history(workflow_id: &str, json: bool) -> Result<()> {
    let orchestrator = open_orchestrator(config()?, StoreKind::File).await?;
    let history = orchestrator.history(workflow_id).await?;

    if json {
        for event in &history {
            println!("{}", serde_json::to_string(event)?);
        }
        return Ok(());
    }

    println!("{:<5} {:<27} {:<26} {:<40}", "SEQ", "TIME", "EVENT", "DETAIL");
    println!("{}", "-".repeat(100));

    for event in &history {
        let detail = match &event.kind {
            EventKind::ActivityScheduled {
                activity_id,
                activity_type,
                attempt,
                ..
            } => format!("{} {} attempt {}", activity_id, activity_type, attempt),
            EventKind::ActivityStarted {
                call_site,
                worker_id,
                ..
            } => format!("call {} on {}", call_site, worker_id),
            EventKind::ActivityCompleted {
                call_site, result, ..
            } => format!("call {} -> {}", call_site, result),
            EventKind::ActivityFailed {
                call_site,
                error_kind,
                message,
                ..
            } => format!("call {} {}: {}", call_site, error_kind, message),
            EventKind::WorkflowFailed {
                error_kind,
                message,
            } => format!("{}: {}", error_kind, message),
            EventKind::WorkflowCancelRequested { reason } => reason.clone(),
            _ => String::new(),
        };
        println!(
            "{:<5} {:<27} {:<26} {:<40}",
            event.seq,
            event.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
            format!("{:?}", event.event_type()),
            detail
        );
    }

    Ok(())
}

/// Show activity timings of a workflow
async fn show_timing(workflow_id: &str) -> Result<()> {
    let orchestrator = open_orchestrator(config()?, StoreKind::File).await?;
    let history = orchestrator.history(workflow_id).await?;
    let report = timing::analyze(history.events()).context("History has no start event")?;
    print_timing(&report);
    Ok(())
}

fn print_timing(report: &TimingReport) {
    println!(
        "{:<10} {:<8} {:<10} {:>10} {:>10} {:>10} {:>10} {:>10}",
        "ACTIVITY", "ATTEMPT", "WORKER", "CREATED", "STARTED", "COMPLETED", "DURATION", "WAITING"
    );
    println!("{}", "-".repeat(86));

    for a in &report.activities {
        println!(
            "{:<10} {:<8} {:<10} {:>10.3} {:>10.3} {:>10.3} {:>10.3} {:>10.3}",
            a.activity_id,
            a.attempt,
            a.worker_id.as_deref().unwrap_or("-"),
            a.created_at,
            a.started_at,
            a.completed_at,
            a.duration,
            a.waiting_time
        );
    }

    println!();
    if let Some(total) = report.total {
        println!("Total:      {:.3}s", total);
    }
    println!("Executing:  {:.3}s", report.executing);
    println!("Waiting:    {:.3}s", report.waiting);
    if let Some(mean) = report.mean_transition() {
        println!("Transition: {:.3}s mean", mean);
    }
}

/// List recent runs
async fn list_runs(limit: usize) -> Result<()> {
    let orchestrator = open_orchestrator(config()?, StoreKind::File).await?;
    let runs = orchestrator.list_runs().await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!("{:<24} {:<38} {:<10} {:<12}", "WORKFLOW ID", "RUN ID", "TYPE", "STATUS");
    println!("{}", "-".repeat(86));

    for run in runs.iter().rev().take(limit) {
        println!(
            "{:<24} {:<38} {:<10} {:<12}",
            run.key.workflow_id,
            run.key.run_id,
            run.workflow_type,
            run.status.label()
        );
    }

    Ok(())
}

/// Cancel a workflow
async fn cancel(workflow_id: &str, reason: &str) -> Result<()> {
    let orchestrator = open_orchestrator(config()?, StoreKind::File).await?;
    let key = orchestrator.cancel_workflow(workflow_id, reason).await?;
    let run = orchestrator.describe(workflow_id).await?;
    eprintln!("[Run {} is {}]", key, run.status.label());
    Ok(())
}

/// Show resolved configuration
async fn show_config() -> Result<()> {
    let cfg = config()?;

    println!("ledgerflow configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:  {}", cfg.home.display());
    println!("  Runs:  {}", cfg.runs_dir().display());
    println!("  Store: {}", cfg.store);
    println!();
    println!("Worker:");
    println!("  Poll interval:  {}ms", cfg.worker.poll_interval_ms);
    println!("  Lease:          {}s", cfg.worker.lease_seconds);
    println!("  Max concurrent: {}", cfg.worker.max_concurrent_activities);
    println!();
    println!("Orchestrator:");
    println!("  Timer interval:       {}ms", cfg.orchestrator.timer_interval_ms);
    println!("  Max append retries:   {}", cfg.orchestrator.max_append_retries);
    println!("  Result poll interval: {}ms", cfg.orchestrator.result_poll_interval_ms);
    println!();
    println!("Activity defaults:");
    println!(
        "  Start-to-close timeout: {}s",
        cfg.activity_defaults.start_to_close_timeout_seconds
    );
    let retry = &cfg.activity_defaults.retry_policy;
    println!(
        "  Retry: {} attempts, {}ms initial, x{} backoff, {}ms cap",
        retry.max_attempts, retry.initial_delay_ms, retry.backoff_multiplier, retry.max_delay_ms
    );

    Ok(())
}
