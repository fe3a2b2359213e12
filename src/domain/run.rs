//! Workflow run state and reconstruction from events.
//!
//! A `WorkflowRun` is a read model: it is rebuilt from the event log whenever
//! it is needed and is never the source of truth.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::events::{ErrorKind, Event, EventKind};

/// Identity of a single run: `(workflow_id, run_id)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunKey {
    pub workflow_id: String,
    pub run_id: Uuid,
}

impl RunKey {
    pub fn new(workflow_id: impl Into<String>, run_id: Uuid) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id,
        }
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.workflow_id, self.run_id)
    }
}

/// A workflow execution, as reconstructed from its history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub key: RunKey,

    /// Registered workflow type name
    pub workflow_type: String,

    /// Task queue activities are dispatched to
    pub task_queue: String,

    /// Start input
    pub input: Value,

    /// Current status
    pub status: RunStatus,

    /// When the run started
    pub started_at: DateTime<Utc>,

    /// When the run reached a terminal state
    pub closed_at: Option<DateTime<Utc>>,

    /// Execution timeout, if one was requested
    pub execution_timeout_ms: Option<u64>,

    /// Whether a cancel request has been recorded
    pub cancel_requested: bool,

    /// Number of ActivityScheduled events (all attempts)
    pub activities_scheduled: u32,

    /// Number of ActivityCompleted events
    pub activities_completed: u32,

    /// Number of ActivityFailed events
    pub activities_failed: u32,

    /// Sequence number of the last event applied
    pub last_seq: u64,
}

impl WorkflowRun {
    /// Reconstruct run state from a sequence of events.
    ///
    /// Returns `None` when the history does not begin with `WorkflowStarted`.
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first = events.first()?;
        let EventKind::WorkflowStarted {
            workflow_id,
            workflow_type,
            input,
            task_queue,
            execution_timeout_ms,
        } = &first.kind
        else {
            return None;
        };

        let mut run = Self {
            key: RunKey::new(workflow_id.clone(), first.run_id),
            workflow_type: workflow_type.clone(),
            task_queue: task_queue.clone(),
            input: input.clone(),
            status: RunStatus::Running,
            started_at: first.timestamp,
            closed_at: None,
            execution_timeout_ms: *execution_timeout_ms,
            cancel_requested: false,
            activities_scheduled: 0,
            activities_completed: 0,
            activities_failed: 0,
            last_seq: first.seq,
        };

        for event in &events[1..] {
            run.apply_event(event);
        }

        Some(run)
    }

    /// Apply a single event to update run state
    pub fn apply_event(&mut self, event: &Event) {
        self.last_seq = event.seq;

        // Terminal states sink
        if self.is_finished() {
            return;
        }

        match &event.kind {
            EventKind::WorkflowStarted { .. } | EventKind::ActivityStarted { .. } => {}
            EventKind::ActivityScheduled { .. } => self.activities_scheduled += 1,
            EventKind::ActivityCompleted { .. } => self.activities_completed += 1,
            EventKind::ActivityFailed { .. } => self.activities_failed += 1,
            EventKind::WorkflowCancelRequested { .. } => self.cancel_requested = true,
            EventKind::WorkflowCompleted { result } => {
                self.close(RunStatus::Completed { result: result.clone() }, event);
            }
            EventKind::WorkflowFailed {
                error_kind,
                message,
            } => {
                self.close(
                    RunStatus::Failed {
                        error_kind: *error_kind,
                        message: message.clone(),
                    },
                    event,
                );
            }
            EventKind::WorkflowCancelled => self.close(RunStatus::Cancelled, event),
            EventKind::WorkflowTimedOut => self.close(RunStatus::TimedOut, event),
        }
    }

    fn close(&mut self, status: RunStatus, event: &Event) {
        self.status = status;
        self.closed_at = Some(event.timestamp);
    }

    /// Check if the run is still in progress
    pub fn is_running(&self) -> bool {
        matches!(self.status, RunStatus::Running)
    }

    /// Check if the run has reached a terminal state
    pub fn is_finished(&self) -> bool {
        !self.is_running()
    }

    /// Deadline after which the run times out. `None` without an execution
    /// timeout or when the deadline is out of range.
    pub fn execution_deadline(&self) -> Option<DateTime<Utc>> {
        self.execution_timeout_ms
            .and_then(|ms| super::task::add_millis(self.started_at, ms))
    }
}

/// Status of a workflow run. Every state except `Running` is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunStatus {
    Running,
    Completed { result: Value },
    Failed { error_kind: ErrorKind, message: String },
    TimedOut,
    Cancelled,
}

impl RunStatus {
    /// Short lowercase label for listings
    pub fn label(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::TimedOut => "timed-out",
            Self::Cancelled => "cancelled",
        }
    }
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Running
    }
}
