//! Orchestration Integration Tests
//!
//! End-to-end runs through orchestrator, task queue and workers: history
//! shape, retries, the bench workflow, crash recovery and non-determinism.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ledgerflow::activities::fibo::fibo;
use ledgerflow::activities::{self, ActivityError, ActivityRegistry, FnActivity};
use ledgerflow::core::{
    timing, ActivityOptions, EngineError, EventLog, FileEventLog, InMemoryEventLog, Orchestrator,
    OrchestratorConfig, RetryPolicy, StartWorkflowRequest, TaskQueueRegistry, Workflow, WorkflowContext,
    WorkflowRegistry, WorkflowResult,
};
use ledgerflow::domain::{ErrorKind, EventKind, EventType, RunStatus};
use ledgerflow::worker::{Worker, WorkerOptions};
use ledgerflow::workflows::{BenchInput, BenchWorkflow};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Calls `activity` once per index in `0..input`, returning the results
struct Repeat {
    activity: &'static str,
    retry_policy: RetryPolicy,
}

impl Repeat {
    fn new(activity: &'static str) -> Self {
        Self {
            activity,
            retry_policy: RetryPolicy::immediate(3),
        }
    }
}

impl Workflow for Repeat {
    fn workflow_type(&self) -> &str {
        "repeat"
    }

    fn run(&self, ctx: &mut WorkflowContext<'_>, input: &Value) -> WorkflowResult<Value> {
        let count = input.as_u64().unwrap_or_default();
        let options = ActivityOptions::default().with_retry_policy(self.retry_policy.clone());
        let mut results = Vec::new();
        for i in 0..count {
            results.push(ctx.call_activity(self.activity, json!(i), &options)?);
        }
        Ok(json!(results))
    }
}

fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        timer_interval: Duration::from_millis(20),
        result_poll_interval: Duration::from_millis(20),
        ..Default::default()
    }
}

fn orchestrator(log: Arc<dyn EventLog>, workflows: WorkflowRegistry) -> Arc<Orchestrator> {
    Arc::new(Orchestrator::new(
        log,
        Arc::new(TaskQueueRegistry::new()),
        workflows,
        config(),
    ))
}

fn echo_activities() -> ActivityRegistry {
    ActivityRegistry::new().with(FnActivity::new("echo", Ok))
}

async fn spawn_workers(
    orchestrator: &Arc<Orchestrator>,
    task_queue: &str,
    activities: ActivityRegistry,
    count: usize,
) -> (watch::Sender<bool>, Vec<JoinHandle<()>>) {
    let (shutdown, shutdown_rx) = watch::channel(false);
    let queue = orchestrator.task_queue(task_queue).await;
    let options = WorkerOptions {
        poll_interval: Duration::from_millis(5),
        ..Default::default()
    };

    let handles = (0..count)
        .map(|i| {
            let worker = Worker::new(orchestrator.clone(), queue.clone(), activities.clone())
                .with_worker_id(format!("w{}", i))
                .with_options(options.clone());
            let rx = shutdown_rx.clone();
            tokio::spawn(async move { worker.run(rx).await })
        })
        .collect();

    (shutdown, handles)
}

async fn stop(shutdown: watch::Sender<bool>, handles: Vec<JoinHandle<()>>) {
    shutdown.send(true).unwrap();
    for handle in handles {
        handle.await.unwrap();
    }
}

async fn await_result(orchestrator: &Orchestrator, workflow_id: &str) -> Result<Value, EngineError> {
    tokio::time::timeout(Duration::from_secs(10), orchestrator.await_result(workflow_id))
        .await
        .expect("workflow did not close in time")
}

#[tokio::test]
async fn test_sequential_history_alternates() {
    let orch = orchestrator(
        Arc::new(InMemoryEventLog::new()),
        WorkflowRegistry::new().with(Repeat::new("echo")),
    );
    let (shutdown, handles) = spawn_workers(&orch, "q", echo_activities(), 2).await;

    orch.start_workflow(StartWorkflowRequest::new("seq", "repeat", json!(10), "q"))
        .await
        .unwrap();
    let result = await_result(&orch, "seq").await.unwrap();
    assert_eq!(result, json!((0..10).collect::<Vec<u64>>()));
    stop(shutdown, handles).await;

    let history = orch.history("seq").await.unwrap();
    let types: Vec<EventType> = history
        .iter()
        .map(|e| e.event_type())
        .filter(|t| *t != EventType::ActivityStarted)
        .collect();

    let mut expected = vec![EventType::WorkflowStarted];
    for _ in 0..10 {
        expected.push(EventType::ActivityScheduled);
        expected.push(EventType::ActivityCompleted);
    }
    expected.push(EventType::WorkflowCompleted);
    assert_eq!(types, expected);

    // Sequence numbers are dense and start at 1
    for (i, event) in history.iter().enumerate() {
        assert_eq!(event.seq, i as u64 + 1);
    }
}

#[tokio::test]
async fn test_flaky_activity_retries_until_success() {
    let calls = Arc::new(AtomicU32::new(0));
    let flaky = {
        let calls = calls.clone();
        FnActivity::new("flaky", move |input| {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ActivityError::retryable("not yet"))
            } else {
                Ok(input)
            }
        })
    };

    let orch = orchestrator(
        Arc::new(InMemoryEventLog::new()),
        WorkflowRegistry::new().with(Repeat::new("flaky")),
    );
    let (shutdown, handles) = spawn_workers(&orch, "q", ActivityRegistry::new().with(flaky), 1).await;

    orch.start_workflow(StartWorkflowRequest::new("flaky", "repeat", json!(1), "q"))
        .await
        .unwrap();
    assert_eq!(await_result(&orch, "flaky").await.unwrap(), json!([0]));
    stop(shutdown, handles).await;

    let history = orch.history("flaky").await.unwrap();
    let count = |t: EventType| history.iter().filter(|e| e.event_type() == t).count();
    assert_eq!(count(EventType::ActivityScheduled), 3);
    assert_eq!(count(EventType::ActivityFailed), 2);
    assert_eq!(count(EventType::ActivityCompleted), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let run = orch.describe("flaky").await.unwrap();
    assert_eq!(run.activities_failed, 2);
    assert_eq!(run.activities_completed, 1);
}

#[tokio::test]
async fn test_non_retryable_failure_fails_workflow() {
    let orch = orchestrator(
        Arc::new(InMemoryEventLog::new()),
        WorkflowRegistry::new().with(Repeat::new("broken")),
    );
    let broken = FnActivity::new("broken", |_| Err(ActivityError::non_retryable("bad input")));
    let (shutdown, handles) = spawn_workers(&orch, "q", ActivityRegistry::new().with(broken), 1).await;

    orch.start_workflow(StartWorkflowRequest::new("broken", "repeat", json!(2), "q"))
        .await
        .unwrap();
    let err = await_result(&orch, "broken").await.unwrap_err();
    stop(shutdown, handles).await;

    match err {
        EngineError::WorkflowFailed {
            error_kind,
            message,
            ..
        } => {
            assert_eq!(error_kind, ErrorKind::ApplicationError);
            assert!(message.contains("bad input"));
        }
        other => panic!("unexpected error: {}", other),
    }

    // No second attempt for a non-retryable failure
    let history = orch.history("broken").await.unwrap();
    assert_eq!(
        history
            .iter()
            .filter(|e| e.event_type() == EventType::ActivityScheduled)
            .count(),
        1
    );
}

#[tokio::test]
async fn test_bench_end_to_end() {
    let input = BenchInput {
        iter: 6,
        fibo_n: 20,
        parallel: true,
    };
    let orch = orchestrator(
        Arc::new(InMemoryEventLog::new()),
        WorkflowRegistry::new().with(BenchWorkflow::default()),
    );
    let (shutdown, handles) = spawn_workers(&orch, &input.task_queue(), activities::builtin(), 3).await;

    let workflow_id = input.workflow_id();
    orch.start_workflow(StartWorkflowRequest::new(
        workflow_id.clone(),
        BenchWorkflow::TYPE,
        serde_json::to_value(&input).unwrap(),
        input.task_queue(),
    ))
    .await
    .unwrap();

    let result = await_result(&orch, &workflow_id).await.unwrap();
    stop(shutdown, handles).await;

    assert_eq!(result["iterations"], json!(6));
    assert_eq!(result["results"], json!(vec![fibo(20); 6]));

    let history = orch.history(&workflow_id).await.unwrap();
    let report = timing::analyze(history.events()).unwrap();
    assert_eq!(report.activities.len(), 6);
    assert!(report.total.is_some());
    let ids: Vec<&str> = report.activities.iter().map(|a| a.activity_id.as_str()).collect();
    assert_eq!(ids, vec!["task_00", "task_01", "task_02", "task_03", "task_04", "task_05"]);
}

#[tokio::test]
async fn test_recover_after_restart() {
    let temp_dir = TempDir::new().unwrap();
    let workflows = || WorkflowRegistry::new().with(Repeat::new("echo"));

    {
        let log = Arc::new(FileEventLog::open(temp_dir.path()).await.unwrap());
        let orch = orchestrator(log, workflows());
        orch.start_workflow(StartWorkflowRequest::new("durable", "repeat", json!(3), "q"))
            .await
            .unwrap();

        // First call completes normally
        let queue = orch.task_queue("q").await;
        let worker = Worker::new(orch.clone(), queue.clone(), echo_activities());
        assert!(worker.poll_once().await.is_some());

        // Second call is picked up by a worker that dies mid-execution
        let claimed = queue.claim("doomed", Duration::from_secs(60)).await.unwrap();
        assert_eq!(claimed.task.call_site, 1);
        assert!(orch
            .record_activity_started(&claimed.task, "doomed")
            .await
            .unwrap());
    }

    // Fresh process: queues are empty, only the log survived
    let log = Arc::new(FileEventLog::open(temp_dir.path()).await.unwrap());
    let orch = orchestrator(log, workflows());
    assert_eq!(orch.describe("durable").await.unwrap().status, RunStatus::Running);
    assert_eq!(orch.recover().await.unwrap(), 1);
    assert_eq!(orch.task_queue("q").await.len().await, 1);

    let (shutdown, handles) = spawn_workers(&orch, "q", echo_activities(), 1).await;
    assert_eq!(await_result(&orch, "durable").await.unwrap(), json!([0, 1, 2]));
    stop(shutdown, handles).await;

    // Recovery republished the open attempt instead of scheduling a new one
    let history = orch.history("durable").await.unwrap();
    let scheduled: Vec<(u32, u32)> = history
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::ActivityScheduled {
                call_site, attempt, ..
            } => Some((*call_site, *attempt)),
            _ => None,
        })
        .collect();
    assert_eq!(scheduled, vec![(0, 1), (1, 1), (2, 1)]);

    // Nothing left to recover
    assert_eq!(orch.recover().await.unwrap(), 0);
}

/// Picks its activity type from a flag, standing in for a code change between deploys
struct Versioned {
    upgraded: Arc<AtomicBool>,
}

impl Workflow for Versioned {
    fn workflow_type(&self) -> &str {
        "versioned"
    }

    fn run(&self, ctx: &mut WorkflowContext<'_>, input: &Value) -> WorkflowResult<Value> {
        let activity = if self.upgraded.load(Ordering::SeqCst) {
            "v2"
        } else {
            "v1"
        };
        let first = ctx.call_activity(activity, input.clone(), &ActivityOptions::default())?;
        let second = ctx.call_activity(activity, input.clone(), &ActivityOptions::default())?;
        Ok(json!([first, second]))
    }
}

#[tokio::test]
async fn test_changed_workflow_code_fails_with_non_determinism() {
    let upgraded = Arc::new(AtomicBool::new(false));
    let orch = orchestrator(
        Arc::new(InMemoryEventLog::new()),
        WorkflowRegistry::new().with(Versioned {
            upgraded: upgraded.clone(),
        }),
    );

    orch.start_workflow(StartWorkflowRequest::new("versioned", "versioned", json!(1), "q"))
        .await
        .unwrap();

    upgraded.store(true, Ordering::SeqCst);

    let activities = ActivityRegistry::new()
        .with(FnActivity::new("v1", Ok))
        .with(FnActivity::new("v2", Ok));
    let worker = Worker::new(orch.clone(), orch.task_queue("q").await, activities);
    assert!(worker.poll_once().await.is_some());

    let err = await_result(&orch, "versioned").await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::WorkflowFailed {
            error_kind: ErrorKind::NonDeterminismError,
            ..
        }
    ));

    let history = orch.history("versioned").await.unwrap();
    assert!(matches!(
        history.events().last().map(|e| &e.kind),
        Some(EventKind::WorkflowFailed {
            error_kind: ErrorKind::NonDeterminismError,
            ..
        })
    ));
}

#[tokio::test]
async fn test_cancel_running_workflow() {
    let orch = orchestrator(
        Arc::new(InMemoryEventLog::new()),
        WorkflowRegistry::new().with(Repeat::new("echo")),
    );
    orch.start_workflow(StartWorkflowRequest::new("cancel-me", "repeat", json!(5), "q"))
        .await
        .unwrap();

    orch.cancel_workflow("cancel-me", "operator request").await.unwrap();

    let err = await_result(&orch, "cancel-me").await.unwrap_err();
    assert!(matches!(err, EngineError::WorkflowCancelled(_)));
    assert!(orch.task_queue("q").await.is_empty().await);

    let history = orch.history("cancel-me").await.unwrap();
    assert_eq!(
        history.events().last().map(|e| e.event_type()),
        Some(EventType::WorkflowCancelled)
    );
}
