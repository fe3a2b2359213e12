//! Replay engine: rebuilds a workflow's logical position from its history and
//! computes the next batch of commands.
//!
//! Workflow programs are plain synchronous functions that are re-run from the
//! top on every replay. Each activity call claims the next call-site index
//! from the replay cursor. If the history already holds a result for that
//! call-site the call returns it immediately; otherwise the call yields
//! `Interrupt::Pending` and the program unwinds through `?`. Commands are only
//! emitted for call-sites (and attempts) the history has not seen yet, so a
//! replay over an unchanged history emits the same commands every time.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::task::{add_millis, millis};
use crate::domain::{keys, ErrorKind, Event, EventKind};

use super::error::ReplayError;
use super::options::{ActivityOptions, RetryPolicy};

/// Why a workflow program stopped before producing a result
#[derive(Debug, Clone, PartialEq)]
pub enum Interrupt {
    /// Waiting on an activity that has no outcome yet
    Pending,

    /// An activity failed for good (non-retryable or attempts exhausted)
    ActivityFailed(ActivityFailure),

    /// The workflow logic itself decided to fail
    Failed { message: String },
}

impl Interrupt {
    /// Fail the workflow with an application error
    pub fn fail(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

/// Result type for workflow programs; use `?` on every activity call
pub type WorkflowResult<T> = Result<T, Interrupt>;

/// Final failure of an activity call, surfaced to the workflow
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityFailure {
    pub call_site: u32,
    pub activity_id: String,
    pub activity_type: String,
    pub attempts: u32,
    pub error_kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl std::fmt::Display for ActivityFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "activity '{}' ({}) failed after {} attempt(s): {}: {}",
            self.activity_id, self.activity_type, self.attempts, self.error_kind, self.message
        )
    }
}

/// Deterministic workflow logic.
///
/// Implementations must not read clocks, randomness, or external state:
/// given the same input and the same activity results, `run` must make the
/// same calls in the same order.
pub trait Workflow: Send + Sync {
    /// Registered type name
    fn workflow_type(&self) -> &str;

    /// Execute the program against the replay context
    fn run(&self, ctx: &mut WorkflowContext<'_>, input: &Value) -> WorkflowResult<Value>;
}

/// An instruction produced by replay for the orchestrator to persist
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    ScheduleActivity {
        call_site: u32,
        activity_id: String,
        activity_type: String,
        input: Value,
        attempt: u32,
        task_queue: String,
        start_to_close_timeout_ms: u64,
        backoff_ms: u64,
    },
    CompleteWorkflow {
        result: Value,
    },
    FailWorkflow {
        error_kind: ErrorKind,
        message: String,
    },
    CancelWorkflow,
}

impl Command {
    /// The event this command is persisted as
    pub fn event_kind(&self) -> EventKind {
        match self.clone() {
            Self::ScheduleActivity {
                call_site,
                activity_id,
                activity_type,
                input,
                attempt,
                task_queue,
                start_to_close_timeout_ms,
                backoff_ms,
            } => EventKind::ActivityScheduled {
                call_site,
                activity_id,
                activity_type,
                input,
                attempt,
                task_queue,
                start_to_close_timeout_ms,
                backoff_ms,
            },
            Self::CompleteWorkflow { result } => EventKind::WorkflowCompleted { result },
            Self::FailWorkflow {
                error_kind,
                message,
            } => EventKind::WorkflowFailed {
                error_kind,
                message,
            },
            Self::CancelWorkflow => EventKind::WorkflowCancelled,
        }
    }

    /// Idempotency key of the resulting event
    pub fn idempotency_key(&self, run_id: Uuid) -> String {
        match self {
            Self::ScheduleActivity {
                call_site, attempt, ..
            } => keys::scheduled(run_id, *call_site, *attempt),
            Self::CompleteWorkflow { .. } | Self::FailWorkflow { .. } | Self::CancelWorkflow => {
                keys::close(run_id)
            }
        }
    }

    pub fn into_event(self, run_id: Uuid) -> Event {
        let key = self.idempotency_key(run_id);
        Event::new(run_id, key, self.event_kind())
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::ScheduleActivity { .. })
    }
}

// ============================================================================
// History index
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum AttemptOutcome {
    Completed(Value),
    Failed {
        error_kind: ErrorKind,
        message: String,
        retryable: bool,
    },
}

#[derive(Debug, Clone)]
struct AttemptRecord {
    attempt: u32,
    scheduled: Event,
    started_at: Option<DateTime<Utc>>,
    outcome: Option<AttemptOutcome>,
}

#[derive(Debug, Clone)]
struct CallRecord {
    activity_id: String,
    activity_type: String,
    input: Value,
    attempts: Vec<AttemptRecord>,
}

impl CallRecord {
    fn last_attempt(&self) -> Option<&AttemptRecord> {
        self.attempts.last()
    }

    fn attempt_mut(&mut self, attempt: u32) -> Option<&mut AttemptRecord> {
        self.attempts.iter_mut().find(|a| a.attempt == attempt)
    }
}

/// Everything replay needs, folded from a history in one pass
#[derive(Debug, Clone)]
struct HistoryIndex {
    workflow_id: String,
    run_id: Uuid,
    input: Value,
    task_queue: String,
    calls: BTreeMap<u32, CallRecord>,
    cancel_requested: bool,
    closed: bool,
}

impl HistoryIndex {
    fn build(history: &[Event]) -> Result<Self, ReplayError> {
        let first = history.first().ok_or(ReplayError::MissingStart)?;
        let EventKind::WorkflowStarted {
            workflow_id,
            input,
            task_queue,
            ..
        } = &first.kind
        else {
            return Err(ReplayError::MissingStart);
        };

        let mut index = Self {
            workflow_id: workflow_id.clone(),
            run_id: first.run_id,
            input: input.clone(),
            task_queue: task_queue.clone(),
            calls: BTreeMap::new(),
            cancel_requested: false,
            closed: false,
        };

        for event in &history[1..] {
            index.apply(event)?;
        }
        Ok(index)
    }

    fn apply(&mut self, event: &Event) -> Result<(), ReplayError> {
        match &event.kind {
            EventKind::ActivityScheduled {
                call_site,
                activity_id,
                activity_type,
                input,
                attempt,
                ..
            } => {
                let record = self.calls.entry(*call_site).or_insert_with(|| CallRecord {
                    activity_id: activity_id.clone(),
                    activity_type: activity_type.clone(),
                    input: input.clone(),
                    attempts: Vec::new(),
                });
                let expected = record.attempts.len() as u32 + 1;
                if *attempt != expected || record.activity_type != *activity_type {
                    return Err(ReplayError::NonDeterminism(format!(
                        "call-site {} scheduled as {} attempt {}, expected {} attempt {}",
                        call_site, activity_type, attempt, record.activity_type, expected
                    )));
                }
                record.attempts.push(AttemptRecord {
                    attempt: *attempt,
                    scheduled: event.clone(),
                    started_at: None,
                    outcome: None,
                });
            }
            EventKind::ActivityStarted {
                call_site, attempt, ..
            } => {
                if let Some(record) = self.attempt_mut(*call_site, *attempt) {
                    record.started_at.get_or_insert(event.timestamp);
                }
            }
            EventKind::ActivityCompleted {
                call_site,
                attempt,
                result,
            } => {
                if let Some(record) = self.attempt_mut(*call_site, *attempt) {
                    record.outcome = Some(AttemptOutcome::Completed(result.clone()));
                }
            }
            EventKind::ActivityFailed {
                call_site,
                attempt,
                error_kind,
                message,
                retryable,
            } => {
                if let Some(record) = self.attempt_mut(*call_site, *attempt) {
                    record.outcome = Some(AttemptOutcome::Failed {
                        error_kind: *error_kind,
                        message: message.clone(),
                        retryable: *retryable,
                    });
                }
            }
            EventKind::WorkflowCancelRequested { .. } => self.cancel_requested = true,
            EventKind::WorkflowStarted { .. } => {
                return Err(ReplayError::NonDeterminism(format!(
                    "duplicate WorkflowStarted at seq {}",
                    event.seq
                )));
            }
            EventKind::WorkflowCompleted { .. }
            | EventKind::WorkflowFailed { .. }
            | EventKind::WorkflowCancelled
            | EventKind::WorkflowTimedOut => self.closed = true,
        }
        Ok(())
    }

    fn attempt_mut(&mut self, call_site: u32, attempt: u32) -> Option<&mut AttemptRecord> {
        self.calls.get_mut(&call_site)?.attempt_mut(attempt)
    }
}

/// An activity attempt that has been scheduled but has no outcome
#[derive(Debug, Clone)]
pub struct OutstandingAttempt {
    /// The `ActivityScheduled` event of the attempt
    pub scheduled: Event,

    /// When a worker first reported starting it
    pub started_at: Option<DateTime<Utc>>,
}

impl OutstandingAttempt {
    pub fn call_site(&self) -> u32 {
        self.scheduled.call_site().unwrap_or_default()
    }

    pub fn attempt(&self) -> u32 {
        match &self.scheduled.kind {
            EventKind::ActivityScheduled { attempt, .. } => *attempt,
            _ => 0,
        }
    }

    /// When the attempt times out.
    ///
    /// The clock starts when a worker started the attempt, or when the task
    /// became claimable if no worker ever did. `None` if the deadline is out
    /// of range.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        let EventKind::ActivityScheduled {
            start_to_close_timeout_ms,
            backoff_ms,
            ..
        } = &self.scheduled.kind
        else {
            return None;
        };

        let clock_start = match self.started_at {
            Some(started_at) => started_at,
            None => add_millis(self.scheduled.timestamp, *backoff_ms)?,
        };
        add_millis(clock_start, *start_to_close_timeout_ms)
    }
}

/// Attempts in `history` that are still waiting for an outcome.
/// Empty once the run is closed.
pub fn outstanding_attempts(history: &[Event]) -> Result<Vec<OutstandingAttempt>, ReplayError> {
    let index = HistoryIndex::build(history)?;
    if index.closed {
        return Ok(Vec::new());
    }

    Ok(index
        .calls
        .values()
        .flat_map(|call| call.attempts.iter())
        .filter(|a| a.outcome.is_none())
        .map(|a| OutstandingAttempt {
            scheduled: a.scheduled.clone(),
            started_at: a.started_at,
        })
        .collect())
}

/// Whether `history` already holds an outcome for this attempt
pub fn attempt_has_outcome(history: &[Event], run_id: Uuid, call_site: u32, attempt: u32) -> bool {
    let key = keys::outcome(run_id, call_site, attempt);
    history.iter().any(|e| e.idempotency_key == key)
}

// ============================================================================
// Replay context
// ============================================================================

/// Handle to a scheduled activity call
#[derive(Debug, Clone)]
pub struct ActivityHandle {
    call_site: u32,
    activity_id: String,
    activity_type: String,
    retry_policy: RetryPolicy,
}

impl ActivityHandle {
    pub fn call_site(&self) -> u32 {
        self.call_site
    }

    pub fn activity_id(&self) -> &str {
        &self.activity_id
    }
}

/// Replay cursor handed to workflow programs
#[derive(Debug)]
pub struct WorkflowContext<'h> {
    index: &'h HistoryIndex,
    cursor: u32,
    commands: Vec<Command>,
    issued: HashSet<(u32, u32)>,
    divergence: Option<String>,
}

impl<'h> WorkflowContext<'h> {
    fn new(index: &'h HistoryIndex) -> Self {
        Self {
            index,
            cursor: 0,
            commands: Vec::new(),
            issued: HashSet::new(),
            divergence: None,
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.index.workflow_id
    }

    pub fn run_id(&self) -> Uuid {
        self.index.run_id
    }

    /// Whether the next call-site is already recorded in history
    pub fn is_replaying(&self) -> bool {
        self.index.calls.contains_key(&self.cursor)
    }

    /// Schedule an activity without waiting for it (for fan-out)
    pub fn schedule_activity(
        &mut self,
        activity_type: &str,
        input: Value,
        options: &ActivityOptions,
    ) -> ActivityHandle {
        let call_site = self.cursor;
        self.cursor += 1;

        let activity_id = options
            .activity_id
            .clone()
            .unwrap_or_else(|| format!("activity-{}", call_site));

        match self.index.calls.get(&call_site) {
            Some(record) => {
                if record.activity_type != activity_type
                    || record.activity_id != activity_id
                    || record.input != input
                {
                    self.diverge(format!(
                        "call-site {} was recorded as {} '{}' with input {}, workflow now calls {} '{}' with input {}",
                        call_site,
                        record.activity_type,
                        record.activity_id,
                        record.input,
                        activity_type,
                        activity_id,
                        input
                    ));
                }
            }
            None => {
                let task_queue = options
                    .task_queue
                    .clone()
                    .unwrap_or_else(|| self.index.task_queue.clone());
                self.issue(Command::ScheduleActivity {
                    call_site,
                    activity_id: activity_id.clone(),
                    activity_type: activity_type.to_string(),
                    input,
                    attempt: 1,
                    task_queue,
                    start_to_close_timeout_ms: options.start_to_close_timeout_ms,
                    backoff_ms: 0,
                });
            }
        }

        ActivityHandle {
            call_site,
            activity_id,
            activity_type: activity_type.to_string(),
            retry_policy: options.retry_policy.clone(),
        }
    }

    /// Wait for a scheduled activity's result
    pub fn wait(&mut self, handle: &ActivityHandle) -> WorkflowResult<Value> {
        if self.divergence.is_some() {
            return Err(Interrupt::Pending);
        }

        let index = self.index;
        let Some(record) = index.calls.get(&handle.call_site) else {
            return Err(Interrupt::Pending);
        };
        let Some(last) = record.last_attempt() else {
            return Err(Interrupt::Pending);
        };

        match &last.outcome {
            None => Err(Interrupt::Pending),
            Some(AttemptOutcome::Completed(result)) => Ok(result.clone()),
            Some(AttemptOutcome::Failed {
                error_kind,
                message,
                retryable,
            }) => {
                if *retryable && handle.retry_policy.should_retry(last.attempt) {
                    self.retry(handle, record, last);
                    return Err(Interrupt::Pending);
                }
                Err(Interrupt::ActivityFailed(ActivityFailure {
                    call_site: handle.call_site,
                    activity_id: handle.activity_id.clone(),
                    activity_type: handle.activity_type.clone(),
                    attempts: last.attempt,
                    error_kind: *error_kind,
                    message: message.clone(),
                    retryable: *retryable,
                }))
            }
        }
    }

    /// Schedule and wait in one step
    pub fn call_activity(
        &mut self,
        activity_type: &str,
        input: Value,
        options: &ActivityOptions,
    ) -> WorkflowResult<Value> {
        let handle = self.schedule_activity(activity_type, input, options);
        self.wait(&handle)
    }

    fn retry(&mut self, handle: &ActivityHandle, record: &CallRecord, last: &AttemptRecord) {
        let EventKind::ActivityScheduled {
            task_queue,
            start_to_close_timeout_ms,
            ..
        } = &last.scheduled.kind
        else {
            return;
        };

        let backoff = handle.retry_policy.delay_for_attempt(last.attempt);
        self.issue(Command::ScheduleActivity {
            call_site: handle.call_site,
            activity_id: record.activity_id.clone(),
            activity_type: record.activity_type.clone(),
            input: record.input.clone(),
            attempt: last.attempt + 1,
            task_queue: task_queue.clone(),
            start_to_close_timeout_ms: *start_to_close_timeout_ms,
            backoff_ms: millis(backoff),
        });
    }

    fn issue(&mut self, command: Command) {
        if let Command::ScheduleActivity {
            call_site, attempt, ..
        } = &command
        {
            if !self.issued.insert((*call_site, *attempt)) {
                return;
            }
        }
        self.commands.push(command);
    }

    fn diverge(&mut self, message: String) {
        self.divergence.get_or_insert(message);
    }
}

// ============================================================================
// Replay
// ============================================================================

/// Derived, never persisted view of where a workflow program stands
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkflowExecutionState {
    /// Number of call-sites the program reached in this replay
    pub cursor: u32,

    /// Call-sites whose latest attempt has no outcome
    pub pending_call_sites: Vec<u32>,

    /// Call-sites that completed successfully
    pub completed_calls: u32,

    pub cancel_requested: bool,

    pub closed: bool,
}

/// Result of a replay pass
#[derive(Debug, Clone, Default)]
pub struct ReplayOutcome {
    pub commands: Vec<Command>,
    pub state: WorkflowExecutionState,
}

/// Replay `history` through `workflow` and compute the next commands.
///
/// Pure function of its inputs: the same history always yields the same
/// commands. Fails with `ReplayError::NonDeterminism` when the program no
/// longer matches what the history recorded.
pub fn replay(history: &[Event], workflow: &dyn Workflow) -> Result<ReplayOutcome, ReplayError> {
    let index = HistoryIndex::build(history)?;

    let mut state = WorkflowExecutionState {
        cancel_requested: index.cancel_requested,
        closed: index.closed,
        ..Default::default()
    };
    for (site, call) in &index.calls {
        match call.last_attempt().and_then(|a| a.outcome.as_ref()) {
            None => state.pending_call_sites.push(*site),
            Some(AttemptOutcome::Completed(_)) => state.completed_calls += 1,
            Some(AttemptOutcome::Failed { .. }) => {}
        }
    }

    if index.closed {
        return Ok(ReplayOutcome {
            commands: Vec::new(),
            state,
        });
    }

    if index.cancel_requested {
        return Ok(ReplayOutcome {
            commands: vec![Command::CancelWorkflow],
            state,
        });
    }

    let mut ctx = WorkflowContext::new(&index);
    let result = workflow.run(&mut ctx, &index.input);
    state.cursor = ctx.cursor;

    if let Some(divergence) = ctx.divergence.take() {
        return Err(ReplayError::NonDeterminism(divergence));
    }
    if let Some(unreached) = index.calls.keys().find(|site| **site >= ctx.cursor) {
        return Err(ReplayError::NonDeterminism(format!(
            "history holds call-site {} but the workflow stopped after {} call(s)",
            unreached, ctx.cursor
        )));
    }

    let commands = match result {
        Ok(result) => vec![Command::CompleteWorkflow { result }],
        Err(Interrupt::Pending) => ctx.commands,
        Err(Interrupt::ActivityFailed(failure)) => vec![Command::FailWorkflow {
            error_kind: failure.error_kind,
            message: failure.to_string(),
        }],
        Err(Interrupt::Failed { message }) => vec![Command::FailWorkflow {
            error_kind: ErrorKind::ApplicationError,
            message,
        }],
    };

    Ok(ReplayOutcome { commands, state })
}
