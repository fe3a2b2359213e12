//! Worker dispatcher: polls a task queue and executes activities.
//!
//! Each claimed task is reported as started, executed under a timeout bounded
//! by the claim's lease, then reported as completed or failed and
//! acknowledged. If the lease runs out first the task is dropped without a
//! report; the queue redelivers it and the orchestrator's timeout takes over.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::activities::{ActivityError, ActivityRegistry};
use crate::core::{ClaimedTask, Orchestrator, TaskQueue};

/// Worker tuning
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Sleep between empty polls
    pub poll_interval: Duration,

    /// Lease requested on every claim. The queue stretches it to the
    /// task's start-to-close timeout when that is longer.
    pub lease_duration: Duration,

    /// Activities executed at once
    pub max_concurrent: usize,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            lease_duration: Duration::from_secs(60),
            max_concurrent: 1,
        }
    }
}

/// What happened to a claimed task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskDisposition {
    Completed,
    Failed,
    /// Attempt already had an outcome or its run closed
    Stale,
    /// Lease ran out before a report could be made
    Abandoned,
}

/// A worker bound to one task queue
#[derive(Clone)]
pub struct Worker {
    worker_id: String,
    queue: Arc<TaskQueue>,
    orchestrator: Arc<Orchestrator>,
    activities: ActivityRegistry,
    options: WorkerOptions,
}

impl Worker {
    pub fn new(orchestrator: Arc<Orchestrator>, queue: Arc<TaskQueue>, activities: ActivityRegistry) -> Self {
        Self {
            worker_id: format!("worker-{}", &Uuid::new_v4().simple().to_string()[..8]),
            queue,
            orchestrator,
            activities,
            options: WorkerOptions::default(),
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Claim and execute at most one task.
    /// Returns `None` if nothing was claimable.
    pub async fn poll_once(&self) -> Option<TaskDisposition> {
        let claimed = self
            .queue
            .claim(&self.worker_id, self.options.lease_duration)
            .await?;
        Some(self.process(claimed).await)
    }

    /// Poll until `shutdown` flips to true, then wait for in-flight tasks
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let max_concurrent = self.options.max_concurrent.max(1);
        let permits = Arc::new(Semaphore::new(max_concurrent));
        info!(worker_id = %self.worker_id, queue = %self.queue.name(), max_concurrent, "Worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            match self
                .queue
                .claim(&self.worker_id, self.options.lease_duration)
                .await
            {
                Some(claimed) => {
                    let worker = self.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        worker.process(claimed).await;
                    });
                }
                None => {
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(self.options.poll_interval) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        // Drain
        let _ = permits.acquire_many(max_concurrent as u32).await;
        info!(worker_id = %self.worker_id, "Worker stopped");
    }

    async fn process(&self, claimed: ClaimedTask) -> TaskDisposition {
        let ClaimedTask { task, lease } = claimed;

        match self
            .orchestrator
            .record_activity_started(&task, &self.worker_id)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                self.acknowledge(task.task_id, lease.token).await;
                return TaskDisposition::Stale;
            }
            Err(e) => {
                warn!(task_id = %task.task_id, error = %e, "Could not record start, leaving task to its lease");
                return TaskDisposition::Abandoned;
            }
        }

        debug!(
            worker_id = %self.worker_id,
            activity_id = %task.activity_id,
            attempt = task.attempt,
            "Executing activity"
        );

        let outcome = match self.activities.get(&task.activity_type) {
            Some(activity) => {
                let budget = lease.remaining().min(task.start_to_close_timeout);
                match tokio::time::timeout(budget, activity.execute(task.input.clone())).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        debug!(task_id = %task.task_id, "Activity outlived its budget, abandoning");
                        return TaskDisposition::Abandoned;
                    }
                }
            }
            None => Err(ActivityError::retryable(format!(
                "activity type not registered: {}",
                task.activity_type
            ))),
        };

        if lease.is_expired() {
            debug!(task_id = %task.task_id, "Lease expired before report, abandoning");
            return TaskDisposition::Abandoned;
        }

        let reported = match outcome {
            Ok(result) => self
                .orchestrator
                .complete_activity(&task, result)
                .await
                .map(|recorded| recorded.then_some(TaskDisposition::Completed)),
            Err(err) => {
                warn!(
                    activity_id = %task.activity_id,
                    attempt = task.attempt,
                    non_retryable = err.non_retryable,
                    error = %err,
                    "Activity failed"
                );
                self.orchestrator
                    .fail_activity(&task, err.message, !err.non_retryable)
                    .await
                    .map(|recorded| recorded.then_some(TaskDisposition::Failed))
            }
        };

        match reported {
            Ok(disposition) => {
                self.acknowledge(task.task_id, lease.token).await;
                disposition.unwrap_or(TaskDisposition::Stale)
            }
            Err(e) => {
                warn!(task_id = %task.task_id, error = %e, "Could not report outcome, leaving task to its lease");
                TaskDisposition::Abandoned
            }
        }
    }

    async fn acknowledge(&self, task_id: Uuid, token: Uuid) {
        if let Err(e) = self.queue.complete(task_id, token).await {
            debug!(%task_id, error = %e, "Acknowledge skipped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activities::FnActivity;
    use crate::core::{
        ActivityOptions, InMemoryEventLog, OrchestratorConfig, StartWorkflowRequest, TaskQueueRegistry,
        Workflow, WorkflowContext, WorkflowRegistry, WorkflowResult,
    };
    use serde_json::{json, Value};

    struct Echo;

    impl Workflow for Echo {
        fn workflow_type(&self) -> &str {
            "echo"
        }

        fn run(&self, ctx: &mut WorkflowContext<'_>, input: &Value) -> WorkflowResult<Value> {
            ctx.call_activity("echo", input.clone(), &ActivityOptions::default())
        }
    }

    async fn setup(activities: ActivityRegistry) -> (Arc<Orchestrator>, Worker) {
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(InMemoryEventLog::new()),
            Arc::new(TaskQueueRegistry::new()),
            WorkflowRegistry::new().with(Echo),
            OrchestratorConfig::default(),
        ));
        let queue = orchestrator.task_queue("q").await;
        let worker = Worker::new(orchestrator.clone(), queue, activities).with_worker_id("w-test");
        (orchestrator, worker)
    }

    #[tokio::test]
    async fn test_poll_once_completes_workflow() {
        let activities = ActivityRegistry::new().with(FnActivity::new("echo", Ok));
        let (orchestrator, worker) = setup(activities).await;

        assert_eq!(worker.poll_once().await, None);

        orchestrator
            .start_workflow(StartWorkflowRequest::new("wf", "echo", json!("hi"), "q"))
            .await
            .unwrap();

        assert_eq!(worker.poll_once().await, Some(TaskDisposition::Completed));
        assert_eq!(orchestrator.await_result("wf").await.unwrap(), json!("hi"));
        assert!(worker.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_unregistered_activity_is_retryable_failure() {
        let (orchestrator, worker) = setup(ActivityRegistry::new()).await;
        orchestrator
            .start_workflow(StartWorkflowRequest::new("wf", "echo", json!(1), "q"))
            .await
            .unwrap();

        assert_eq!(worker.poll_once().await, Some(TaskDisposition::Failed));

        let history = orchestrator.history("wf").await.unwrap();
        let failed = history
            .iter()
            .find_map(|e| match &e.kind {
                crate::domain::EventKind::ActivityFailed { retryable, message, .. } => {
                    Some((*retryable, message.clone()))
                }
                _ => None,
            })
            .unwrap();
        assert!(failed.0);
        assert!(failed.1.contains("not registered"));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let activities = ActivityRegistry::new().with(FnActivity::new("echo", Ok));
        let (orchestrator, worker) = setup(activities).await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run(shutdown_rx).await }
        });

        orchestrator
            .start_workflow(StartWorkflowRequest::new("wf", "echo", json!(7), "q"))
            .await
            .unwrap();
        assert_eq!(orchestrator.await_result("wf").await.unwrap(), json!(7));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
