//! Main orchestrator for workflow execution.
//!
//! Ties the event log, the replay engine, and the task queues together:
//! every change to a run goes through `append_with_retry`, which reads the
//! history, decides which events to add, and appends them with the history's
//! tail as the expected sequence. Newly appended `ActivityScheduled` events
//! are published to their task queue; terminal events purge the run's tasks
//! and wake `await_result` callers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::task::millis;
use crate::domain::{keys, ActivityTask, ErrorKind, Event, EventKind, RunKey, RunStatus, WorkflowRun};

use super::error::{EngineError, LogError, ReplayError};
use super::event_log::{EventLog, History};
use super::executor::{self, Command, OutstandingAttempt};
use super::registry::WorkflowRegistry;
use super::task_queue::{TaskQueue, TaskQueueRegistry};

/// What to do when a start request names a workflow id that already has runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IdReusePolicy {
    /// Start a new run only if the previous run is closed
    #[default]
    AllowDuplicate,

    /// Never reuse a workflow id
    RejectDuplicate,

    /// Cancel a running previous run, then start a new one
    TerminateIfRunning,
}

/// Request to start a workflow run
#[derive(Debug, Clone)]
pub struct StartWorkflowRequest {
    pub workflow_id: String,
    pub workflow_type: String,
    pub input: Value,
    pub task_queue: String,
    pub execution_timeout: Option<Duration>,
    pub id_reuse_policy: IdReusePolicy,
}

impl StartWorkflowRequest {
    pub fn new(
        workflow_id: impl Into<String>,
        workflow_type: impl Into<String>,
        input: Value,
        task_queue: impl Into<String>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            workflow_type: workflow_type.into(),
            input,
            task_queue: task_queue.into(),
            execution_timeout: None,
            id_reuse_policy: IdReusePolicy::default(),
        }
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }

    pub fn with_id_reuse_policy(mut self, policy: IdReusePolicy) -> Self {
        self.id_reuse_policy = policy;
        self
    }
}

/// Orchestrator tuning
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How often the timer loop checks deadlines
    pub timer_interval: Duration,

    /// Conflicting appends tolerated before giving up
    pub max_append_retries: u32,

    /// Poll fallback for `await_result`
    pub result_poll_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            timer_interval: Duration::from_millis(100),
            max_append_retries: 8,
            result_poll_interval: Duration::from_millis(200),
        }
    }
}

/// Main workflow orchestrator
pub struct Orchestrator {
    log: Arc<dyn EventLog>,
    queues: Arc<TaskQueueRegistry>,
    workflows: WorkflowRegistry,
    config: OrchestratorConfig,

    /// One mutex per workflow id; serializes replays of the same workflow
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,

    /// Runs the timer loop watches
    active: Mutex<HashSet<RunKey>>,

    /// Signalled whenever a run closes
    closed: Notify,
}

impl Orchestrator {
    pub fn new(
        log: Arc<dyn EventLog>,
        queues: Arc<TaskQueueRegistry>,
        workflows: WorkflowRegistry,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            log,
            queues,
            workflows,
            config,
            locks: Mutex::new(HashMap::new()),
            active: Mutex::new(HashSet::new()),
            closed: Notify::new(),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn workflows(&self) -> &WorkflowRegistry {
        &self.workflows
    }

    /// Shared queue with this name (created on first use)
    pub async fn task_queue(&self, name: &str) -> Arc<TaskQueue> {
        self.queues.get_or_create(name).await
    }

    // ========================================================================
    // Client API
    // ========================================================================

    /// Start a new run. Returns its run id.
    #[instrument(skip(self, request), fields(workflow_id = %request.workflow_id, workflow_type = %request.workflow_type))]
    pub async fn start_workflow(&self, request: StartWorkflowRequest) -> Result<Uuid, EngineError> {
        if !self.workflows.contains(&request.workflow_type) {
            return Err(EngineError::UnknownWorkflowType(request.workflow_type));
        }

        let lock = self.workflow_lock(&request.workflow_id).await;
        let _guard = lock.lock().await;

        if let Some(previous) = self.log.latest_run(&request.workflow_id).await? {
            let history = self.log.read_all(&previous).await?;
            let running = WorkflowRun::from_events(history.events())
                .map(|run| run.is_running())
                .unwrap_or(false);

            match (request.id_reuse_policy, running) {
                (IdReusePolicy::RejectDuplicate, _) | (IdReusePolicy::AllowDuplicate, true) => {
                    return Err(EngineError::AlreadyExists {
                        workflow_id: request.workflow_id,
                        run_id: previous.run_id,
                    });
                }
                (IdReusePolicy::TerminateIfRunning, true) => {
                    info!(run_id = %previous.run_id, "Terminating previous run");
                    self.append_with_retry(&previous, |_| {
                        Ok(vec![
                            Event::new(
                                previous.run_id,
                                keys::cancel_requested(previous.run_id),
                                EventKind::WorkflowCancelRequested {
                                    reason: "terminated by a new run".to_string(),
                                },
                            ),
                            Event::new(
                                previous.run_id,
                                keys::close(previous.run_id),
                                EventKind::WorkflowCancelled,
                            ),
                        ])
                    })
                    .await?;
                }
                _ => {}
            }
        }

        let run_id = Uuid::new_v4();
        let key = RunKey::new(request.workflow_id.clone(), run_id);
        let started = Event::new(
            run_id,
            keys::start(run_id),
            EventKind::WorkflowStarted {
                workflow_id: request.workflow_id,
                workflow_type: request.workflow_type,
                input: request.input,
                task_queue: request.task_queue,
                execution_timeout_ms: request.execution_timeout.map(millis),
            },
        );

        self.log.create_run(&key, started).await?;
        self.active.lock().await.insert(key.clone());
        info!(%run_id, "Workflow started");

        self.advance_locked(&key).await?;
        Ok(run_id)
    }

    /// Request cancellation of the latest run of a workflow
    #[instrument(skip(self, reason))]
    pub async fn cancel_workflow(&self, workflow_id: &str, reason: &str) -> Result<RunKey, EngineError> {
        let key = self.latest_run_key(workflow_id).await?;
        let lock = self.workflow_lock(workflow_id).await;
        let _guard = lock.lock().await;

        let appended = self
            .append_with_retry(&key, |history| {
                if !is_running(history) {
                    return Ok(Vec::new());
                }
                Ok(vec![Event::new(
                    key.run_id,
                    keys::cancel_requested(key.run_id),
                    EventKind::WorkflowCancelRequested {
                        reason: reason.to_string(),
                    },
                )])
            })
            .await?;

        if appended.is_empty() {
            debug!("Run already closed or cancel already requested");
        } else {
            info!(run_id = %key.run_id, "Cancel requested");
        }

        self.advance_locked(&key).await?;
        Ok(key)
    }

    /// Wait until the latest run of a workflow closes and return its result
    pub async fn await_result(&self, workflow_id: &str) -> Result<Value, EngineError> {
        let run = self.await_run(workflow_id).await?;
        match run.status {
            RunStatus::Completed { result } => Ok(result),
            RunStatus::Failed {
                error_kind,
                message,
            } => Err(EngineError::WorkflowFailed {
                workflow_id: workflow_id.to_string(),
                error_kind,
                message,
            }),
            RunStatus::TimedOut => Err(EngineError::WorkflowTimedOut(workflow_id.to_string())),
            RunStatus::Cancelled => Err(EngineError::WorkflowCancelled(workflow_id.to_string())),
            RunStatus::Running => Err(EngineError::Log(LogError::Corrupt(format!(
                "run of '{}' reported closed while running",
                workflow_id
            )))),
        }
    }

    /// Wait until the latest run of a workflow closes and return its final state
    pub async fn await_run(&self, workflow_id: &str) -> Result<WorkflowRun, EngineError> {
        loop {
            // Register interest before checking, so a close in between is not missed
            let notified = self.closed.notified();

            let run = self.describe(workflow_id).await?;
            if run.is_finished() {
                return Ok(run);
            }

            let _ = tokio::time::timeout(self.config.result_poll_interval, notified).await;
        }
    }

    /// Current state of the latest run of a workflow
    pub async fn describe(&self, workflow_id: &str) -> Result<WorkflowRun, EngineError> {
        let key = self.latest_run_key(workflow_id).await?;
        let history = self.log.read_all(&key).await?;
        run_from_history(&key, &history)
    }

    /// Full history of the latest run of a workflow
    pub async fn history(&self, workflow_id: &str) -> Result<History, EngineError> {
        let key = self.latest_run_key(workflow_id).await?;
        Ok(self.log.read_all(&key).await?)
    }

    /// All runs, oldest first
    pub async fn list_runs(&self) -> Result<Vec<WorkflowRun>, EngineError> {
        let mut runs = Vec::new();
        for key in self.log.list_runs().await? {
            let history = self.log.read_all(&key).await?;
            runs.push(run_from_history(&key, &history)?);
        }
        Ok(runs)
    }

    /// Rebuild in-memory state after a restart.
    ///
    /// Re-advances every running run and re-publishes its outstanding
    /// attempts. Returns the number of running runs found.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<usize, EngineError> {
        let mut recovered = 0;

        for key in self.log.list_runs().await? {
            let lock = self.workflow_lock(&key.workflow_id).await;
            let _guard = lock.lock().await;

            let history = self.log.read_all(&key).await?;
            if !is_running(&history) {
                continue;
            }

            self.active.lock().await.insert(key.clone());
            let outstanding = match executor::outstanding_attempts(history.events()) {
                Ok(outstanding) => outstanding,
                Err(e) => {
                    warn!(run = %key, error = %e, "Skipping unreadable history");
                    continue;
                }
            };
            for attempt in outstanding {
                self.publish_task(&key, &attempt.scheduled).await;
            }

            self.advance_locked(&key).await?;
            recovered += 1;
        }

        info!(recovered, "Recovery complete");
        Ok(recovered)
    }

    // ========================================================================
    // Worker reports
    // ========================================================================

    /// Record that a worker picked up an attempt.
    ///
    /// Returns `false` if the attempt is stale (run closed or outcome already
    /// recorded) and should not be executed.
    pub async fn record_activity_started(
        &self,
        task: &ActivityTask,
        worker_id: &str,
    ) -> Result<bool, EngineError> {
        let lock = self.workflow_lock(&task.run.workflow_id).await;
        let _guard = lock.lock().await;

        let mut live = true;
        self.append_with_retry(&task.run, |history| {
            live = attempt_is_open(history, task);
            if !live {
                return Ok(Vec::new());
            }
            Ok(vec![Event::new(
                task.run.run_id,
                keys::started(task.run.run_id, task.call_site, task.attempt),
                EventKind::ActivityStarted {
                    call_site: task.call_site,
                    attempt: task.attempt,
                    worker_id: worker_id.to_string(),
                },
            )])
        })
        .await?;

        if !live {
            debug!(run = %task.run, call_site = task.call_site, attempt = task.attempt, "Dropping stale start");
        }
        Ok(live)
    }

    /// Report a successful attempt. Returns `false` if the report was stale.
    #[instrument(skip(self, task, result), fields(run = %task.run, call_site = task.call_site, attempt = task.attempt))]
    pub async fn complete_activity(&self, task: &ActivityTask, result: Value) -> Result<bool, EngineError> {
        let kind = EventKind::ActivityCompleted {
            call_site: task.call_site,
            attempt: task.attempt,
            result,
        };
        self.record_outcome(task, kind).await
    }

    /// Report a failed attempt. Returns `false` if the report was stale.
    #[instrument(skip(self, task, message), fields(run = %task.run, call_site = task.call_site, attempt = task.attempt))]
    pub async fn fail_activity(
        &self,
        task: &ActivityTask,
        message: String,
        retryable: bool,
    ) -> Result<bool, EngineError> {
        let kind = EventKind::ActivityFailed {
            call_site: task.call_site,
            attempt: task.attempt,
            error_kind: ErrorKind::ApplicationError,
            message,
            retryable,
        };
        self.record_outcome(task, kind).await
    }

    async fn record_outcome(&self, task: &ActivityTask, kind: EventKind) -> Result<bool, EngineError> {
        let lock = self.workflow_lock(&task.run.workflow_id).await;
        let _guard = lock.lock().await;

        let appended = self
            .append_with_retry(&task.run, |history| {
                if !attempt_is_open(history, task) {
                    return Ok(Vec::new());
                }
                Ok(vec![Event::new(
                    task.run.run_id,
                    keys::outcome(task.run.run_id, task.call_site, task.attempt),
                    kind.clone(),
                )])
            })
            .await?;

        if appended.is_empty() {
            debug!("Dropping stale activity report");
            return Ok(false);
        }

        self.advance_locked(&task.run).await?;
        Ok(true)
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Inject timeouts for every attempt and run past its deadline.
    /// Returns the number of timeout events appended.
    pub async fn check_timeouts(&self) -> Result<usize, EngineError> {
        self.prune_locks().await;

        let keys: Vec<RunKey> = self.active.lock().await.iter().cloned().collect();
        let mut injected = 0;

        for key in keys {
            let lock = self.workflow_lock(&key.workflow_id).await;
            let _guard = lock.lock().await;
            injected += self.check_run_timeouts(&key).await?;
        }

        Ok(injected)
    }

    async fn check_run_timeouts(&self, key: &RunKey) -> Result<usize, EngineError> {
        let history = self.log.read_all(key).await?;
        let run = run_from_history(key, &history)?;
        if run.is_finished() {
            self.active.lock().await.remove(key);
            return Ok(0);
        }

        let now = Utc::now();

        if run.execution_deadline().is_some_and(|deadline| now >= deadline) {
            let appended = self
                .append_with_retry(key, |history| {
                    if !is_running(history) {
                        return Ok(Vec::new());
                    }
                    Ok(vec![Event::new(
                        key.run_id,
                        keys::close(key.run_id),
                        EventKind::WorkflowTimedOut,
                    )])
                })
                .await?;
            if !appended.is_empty() {
                warn!(run = %key, "Workflow execution timed out");
            }
            return Ok(appended.len());
        }

        let outstanding = match executor::outstanding_attempts(history.events()) {
            Ok(outstanding) => outstanding,
            Err(e) => {
                warn!(run = %key, error = %e, "Cannot check activity deadlines");
                return Ok(0);
            }
        };
        let expired: Vec<_> = outstanding
            .into_iter()
            .filter(|a| a.deadline().is_some_and(|deadline| now >= deadline))
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }

        let appended = self
            .append_with_retry(key, |history| {
                Ok(expired
                    .iter()
                    .filter(|a| {
                        !executor::attempt_has_outcome(
                            history.events(),
                            key.run_id,
                            a.call_site(),
                            a.attempt(),
                        )
                    })
                    .map(|a| {
                        let timeout_ms = match &a.scheduled.kind {
                            EventKind::ActivityScheduled {
                                start_to_close_timeout_ms,
                                ..
                            } => *start_to_close_timeout_ms,
                            _ => 0,
                        };
                        Event::new(
                            key.run_id,
                            keys::outcome(key.run_id, a.call_site(), a.attempt()),
                            EventKind::ActivityFailed {
                                call_site: a.call_site(),
                                attempt: a.attempt(),
                                error_kind: ErrorKind::Timeout,
                                message: format!(
                                    "no completion within start-to-close timeout of {}ms",
                                    timeout_ms
                                ),
                                retryable: true,
                            },
                        )
                    })
                    .collect())
            })
            .await?;

        for attempt in injected_timeouts(&expired, &appended) {
            warn!(run = %key, call_site = attempt.call_site(), attempt = attempt.attempt(), "Activity timed out");
            if let EventKind::ActivityScheduled { task_queue, .. } = &attempt.scheduled.kind {
                if let Some(queue) = self.queues.get(task_queue).await {
                    queue
                        .remove_attempt(key.run_id, attempt.call_site(), attempt.attempt())
                        .await;
                }
            }
        }

        if !appended.is_empty() {
            self.advance_locked(key).await?;
        }
        Ok(appended.len())
    }

    /// Run `check_timeouts` periodically until `shutdown` flips to true
    pub async fn run_timer_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.timer_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.check_timeouts().await {
                        warn!(error = %e, "Timeout check failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Timer loop stopping");
                        return;
                    }
                }
            }
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Replay a run and persist the resulting commands
    pub async fn advance(&self, key: &RunKey) -> Result<Vec<Event>, EngineError> {
        let lock = self.workflow_lock(&key.workflow_id).await;
        let _guard = lock.lock().await;
        self.advance_locked(key).await
    }

    /// `advance` for callers already holding the workflow lock
    async fn advance_locked(&self, key: &RunKey) -> Result<Vec<Event>, EngineError> {
        self.append_with_retry(key, |history| self.decide(key, history))
            .await
    }

    /// Compute the events a replay of `history` adds
    fn decide(&self, key: &RunKey, history: &History) -> Result<Vec<Event>, EngineError> {
        let run = run_from_history(key, history)?;
        if run.is_finished() {
            return Ok(Vec::new());
        }

        let Some(workflow) = self.workflows.get(&run.workflow_type) else {
            warn!(run = %key, workflow_type = %run.workflow_type, "Workflow type not registered, leaving run as is");
            return Ok(Vec::new());
        };

        match executor::replay(history.events(), workflow.as_ref()) {
            Ok(outcome) => Ok(outcome
                .commands
                .into_iter()
                .map(|command| command.into_event(key.run_id))
                .collect()),
            Err(ReplayError::NonDeterminism(message)) => {
                error!(run = %key, %message, "Non-deterministic replay, failing run");
                Ok(vec![Command::FailWorkflow {
                    error_kind: ErrorKind::NonDeterminismError,
                    message,
                }
                .into_event(key.run_id)])
            }
            Err(e @ ReplayError::MissingStart) => Err(LogError::Corrupt(e.to_string()).into()),
        }
    }

    /// Read, decide, and append with the read tail as the expected sequence.
    ///
    /// Conflicting appends are retried with a fresh read. Newly appended events
    /// are published before returning.
    async fn append_with_retry<F>(&self, key: &RunKey, mut build: F) -> Result<Vec<Event>, EngineError>
    where
        F: FnMut(&History) -> Result<Vec<Event>, EngineError>,
    {
        let mut attempts = 0u32;

        loop {
            let history = self.log.read_all(key).await?;
            let events = build(&history)?;
            if events.is_empty() {
                return Ok(Vec::new());
            }

            match self.log.append(key, history.last_seq(), events).await {
                Ok(result) => {
                    self.publish(key, &result.appended).await;
                    return Ok(result.appended);
                }
                Err(LogError::ConcurrentAppendConflict { expected, actual }) => {
                    attempts += 1;
                    debug!(run = %key, expected, actual, attempts, "Append conflict, retrying");
                    if attempts >= self.config.max_append_retries {
                        return Err(EngineError::AppendRetriesExhausted {
                            run: key.clone(),
                            attempts,
                        });
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Fan out newly appended events
    async fn publish(&self, key: &RunKey, appended: &[Event]) {
        for event in appended {
            match &event.kind {
                EventKind::ActivityScheduled {
                    activity_id,
                    attempt,
                    ..
                } => {
                    debug!(run = %key, %activity_id, attempt, "Activity scheduled");
                    self.publish_task(key, event).await;
                }
                EventKind::WorkflowCompleted { .. } => {
                    info!(run = %key, "Workflow completed");
                    self.close_run(key).await;
                }
                EventKind::WorkflowFailed {
                    error_kind,
                    message,
                } => {
                    error!(run = %key, %error_kind, %message, "Workflow failed");
                    self.close_run(key).await;
                }
                EventKind::WorkflowCancelled | EventKind::WorkflowTimedOut => {
                    info!(run = %key, event = ?event.event_type(), "Workflow closed");
                    self.close_run(key).await;
                }
                _ => {}
            }
        }
    }

    async fn publish_task(&self, key: &RunKey, scheduled: &Event) {
        if let Some(task) = ActivityTask::from_scheduled(&key.workflow_id, scheduled) {
            let queue = self.queues.get_or_create(&task.task_queue).await;
            queue.enqueue(task).await;
        }
    }

    async fn close_run(&self, key: &RunKey) {
        let purged = self.queues.remove_run(key.run_id).await;
        if purged > 0 {
            debug!(run = %key, purged, "Abandoned in-flight tasks");
        }
        self.active.lock().await.remove(key);
        self.closed.notify_waiters();
    }

    /// Drop per-workflow mutexes nobody holds or waits on.
    /// `workflow_lock` only hands out clones under the map lock, so an
    /// unshared entry can be recreated on demand.
    async fn prune_locks(&self) {
        let mut locks = self.locks.lock().await;
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        let pruned = before - locks.len();
        if pruned > 0 {
            debug!(pruned, "Released idle workflow locks");
        }
    }

    async fn workflow_lock(&self, workflow_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(workflow_id.to_string()).or_default().clone()
    }

    async fn latest_run_key(&self, workflow_id: &str) -> Result<RunKey, EngineError> {
        self.log
            .latest_run(workflow_id)
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))
    }
}

fn run_from_history(key: &RunKey, history: &History) -> Result<WorkflowRun, EngineError> {
    WorkflowRun::from_events(history.events()).ok_or_else(|| {
        EngineError::Log(LogError::Corrupt(format!(
            "history of {} does not start with WorkflowStarted",
            key
        )))
    })
}

fn is_running(history: &History) -> bool {
    WorkflowRun::from_events(history.events())
        .map(|run| run.is_running())
        .unwrap_or(false)
}

/// The run is open, the attempt was scheduled, and it has no outcome yet
/// Expired attempts whose timeout was actually appended, not beaten by a report
fn injected_timeouts<'a>(expired: &'a [OutstandingAttempt], appended: &[Event]) -> Vec<&'a OutstandingAttempt> {
    expired
        .iter()
        .filter(|a| {
            appended.iter().any(|e| {
                matches!(
                    e.kind,
                    EventKind::ActivityFailed { call_site, attempt, .. }
                        if call_site == a.call_site() && attempt == a.attempt()
                )
            })
        })
        .collect()
}

fn attempt_is_open(history: &History, task: &ActivityTask) -> bool {
    let run_id = task.run.run_id;
    is_running(history)
        && history.contains_key(&keys::scheduled(run_id, task.call_site, task.attempt))
        && !history.contains_key(&keys::outcome(run_id, task.call_site, task.attempt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event_log::InMemoryEventLog;
    use crate::core::executor::{Workflow, WorkflowContext, WorkflowResult};
    use crate::core::options::ActivityOptions;
    use serde_json::json;

    struct Single;

    impl Workflow for Single {
        fn workflow_type(&self) -> &str {
            "single"
        }

        fn run(&self, ctx: &mut WorkflowContext<'_>, input: &Value) -> WorkflowResult<Value> {
            ctx.call_activity("echo", input.clone(), &ActivityOptions::default())
        }
    }

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(
            Arc::new(InMemoryEventLog::new()),
            Arc::new(TaskQueueRegistry::new()),
            WorkflowRegistry::new().with(Single),
            OrchestratorConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_start_schedules_first_activity() {
        let orch = orchestrator();
        orch.start_workflow(StartWorkflowRequest::new("wf", "single", json!(1), "q"))
            .await
            .unwrap();

        let queue = orch.task_queue("q").await;
        assert_eq!(queue.len().await, 1);

        let history = orch.history("wf").await.unwrap();
        let types: Vec<_> = history.iter().map(|e| e.event_type()).collect();
        assert_eq!(
            types,
            vec![
                crate::domain::EventType::WorkflowStarted,
                crate::domain::EventType::ActivityScheduled
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_workflow_type_rejected() {
        let orch = orchestrator();
        let err = orch
            .start_workflow(StartWorkflowRequest::new("wf", "missing", json!(null), "q"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownWorkflowType(_)));
    }

    #[tokio::test]
    async fn test_duplicate_start_rejected_while_running() {
        let orch = orchestrator();
        let request = StartWorkflowRequest::new("wf", "single", json!(1), "q");
        orch.start_workflow(request.clone()).await.unwrap();

        let err = orch.start_workflow(request).await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_terminate_if_running_replaces_run() {
        let orch = orchestrator();
        let request = StartWorkflowRequest::new("wf", "single", json!(1), "q");
        let first = orch.start_workflow(request.clone()).await.unwrap();

        let second = orch
            .start_workflow(request.with_id_reuse_policy(IdReusePolicy::TerminateIfRunning))
            .await
            .unwrap();
        assert_ne!(first, second);

        let runs = orch.list_runs().await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].status, RunStatus::Cancelled);
        assert!(runs[1].is_running());

        // Only the new run's task remains
        assert_eq!(orch.task_queue("q").await.len().await, 1);
    }

    #[tokio::test]
    async fn test_stale_report_is_dropped() {
        let orch = orchestrator();
        orch.start_workflow(StartWorkflowRequest::new("wf", "single", json!(1), "q"))
            .await
            .unwrap();

        let claimed = orch
            .task_queue("q")
            .await
            .claim("w1", Duration::from_secs(30))
            .await
            .unwrap();

        assert!(orch.complete_activity(&claimed.task, json!(1)).await.unwrap());
        assert!(!orch.complete_activity(&claimed.task, json!(2)).await.unwrap());
        assert!(!orch.record_activity_started(&claimed.task, "w2").await.unwrap());

        assert_eq!(orch.await_result("wf").await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_cancel_closes_run_and_purges_tasks() {
        let orch = orchestrator();
        orch.start_workflow(StartWorkflowRequest::new("wf", "single", json!(1), "q"))
            .await
            .unwrap();

        orch.cancel_workflow("wf", "user request").await.unwrap();

        let run = orch.describe("wf").await.unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(run.cancel_requested);
        assert!(orch.task_queue("q").await.is_empty().await);
        assert!(matches!(
            orch.await_result("wf").await,
            Err(EngineError::WorkflowCancelled(_))
        ));
    }

    #[tokio::test]
    async fn test_execution_timeout() {
        let orch = orchestrator();
        orch.start_workflow(
            StartWorkflowRequest::new("wf", "single", json!(1), "q")
                .with_execution_timeout(Duration::ZERO),
        )
        .await
        .unwrap();

        assert_eq!(orch.check_timeouts().await.unwrap(), 1);
        assert_eq!(orch.describe("wf").await.unwrap().status, RunStatus::TimedOut);
        assert_eq!(orch.check_timeouts().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_out_of_range_execution_timeout_never_fires() {
        let orch = orchestrator();
        orch.start_workflow(
            StartWorkflowRequest::new("wf", "single", json!(1), "q")
                .with_execution_timeout(Duration::from_secs(u64::MAX / 1000)),
        )
        .await
        .unwrap();

        assert_eq!(orch.check_timeouts().await.unwrap(), 0);
        assert!(orch.describe("wf").await.unwrap().is_running());
    }

    #[tokio::test]
    async fn test_idle_workflow_locks_are_pruned() {
        let orch = orchestrator();
        for i in 0..3 {
            let workflow_id = format!("wf-{}", i);
            orch.start_workflow(StartWorkflowRequest::new(workflow_id.clone(), "single", json!(i), "q"))
                .await
                .unwrap();
            orch.cancel_workflow(&workflow_id, "done").await.unwrap();
        }
        assert_eq!(orch.locks.lock().await.len(), 3);

        // A held lock survives the sweep
        let held = orch.workflow_lock("wf-0").await;
        orch.check_timeouts().await.unwrap();
        assert_eq!(orch.locks.lock().await.len(), 1);

        drop(held);
        orch.check_timeouts().await.unwrap();
        assert!(orch.locks.lock().await.is_empty());
    }

    #[test]
    fn test_only_appended_timeouts_are_reported() {
        let run_id = Uuid::new_v4();
        let scheduled = |call_site: u32| OutstandingAttempt {
            scheduled: Event::new(
                run_id,
                keys::scheduled(run_id, call_site, 1),
                EventKind::ActivityScheduled {
                    call_site,
                    activity_id: format!("activity-{}", call_site),
                    activity_type: "echo".to_string(),
                    input: json!(call_site),
                    attempt: 1,
                    task_queue: "q".to_string(),
                    start_to_close_timeout_ms: 10,
                    backoff_ms: 0,
                },
            ),
            started_at: None,
        };
        let expired = vec![scheduled(0), scheduled(1)];

        // Call-site 0 completed before the timeout could be written
        let appended = vec![Event::new(
            run_id,
            keys::outcome(run_id, 1, 1),
            EventKind::ActivityFailed {
                call_site: 1,
                attempt: 1,
                error_kind: ErrorKind::Timeout,
                message: "timed out".to_string(),
                retryable: true,
            },
        )];

        let injected = injected_timeouts(&expired, &appended);
        assert_eq!(injected.len(), 1);
        assert_eq!(injected[0].call_site(), 1);
        assert!(injected_timeouts(&expired, &[]).is_empty());
    }

    #[tokio::test]
    async fn test_describe_unknown_workflow() {
        let orch = orchestrator();
        assert!(matches!(
            orch.describe("nope").await,
            Err(EngineError::WorkflowNotFound(_))
        ));
    }
}
