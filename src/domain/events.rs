//! Event types for the durable execution log.
//!
//! All state changes of a workflow run are recorded as immutable events in an
//! append-only log. Workflow state is never stored directly: it is derived by
//! replaying these events in sequence order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A single event in the append-only event log.
///
/// `seq` is assigned by the event log on append (1-based, contiguous per run);
/// events built by callers carry `seq == 0` until persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Position in the run's history
    pub seq: u64,

    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event was recorded
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to
    pub run_id: Uuid,

    /// Deduplication key; at most one event per key exists in a run
    pub idempotency_key: String,

    /// What happened
    pub kind: EventKind,
}

impl Event {
    /// Create a new, not yet persisted event with the current timestamp
    pub fn new(run_id: Uuid, idempotency_key: String, kind: EventKind) -> Self {
        Self {
            seq: 0,
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            idempotency_key,
            kind,
        }
    }

    /// Override the timestamp (used when injecting events for a past deadline)
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Flat type of this event
    pub fn event_type(&self) -> EventType {
        self.kind.event_type()
    }

    /// Call-site index for activity events
    pub fn call_site(&self) -> Option<u32> {
        match &self.kind {
            EventKind::ActivityScheduled { call_site, .. }
            | EventKind::ActivityStarted { call_site, .. }
            | EventKind::ActivityCompleted { call_site, .. }
            | EventKind::ActivityFailed { call_site, .. } => Some(*call_site),
            _ => None,
        }
    }

    /// Whether this event closes the run
    pub fn is_terminal(&self) -> bool {
        self.event_type().is_terminal()
    }
}

/// Payload of an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum EventKind {
    /// A run was created by a start request
    WorkflowStarted {
        workflow_id: String,
        workflow_type: String,
        input: Value,
        task_queue: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        execution_timeout_ms: Option<u64>,
    },

    /// The workflow asked for an activity invocation (one event per attempt)
    ActivityScheduled {
        call_site: u32,
        activity_id: String,
        activity_type: String,
        input: Value,
        attempt: u32,
        task_queue: String,
        start_to_close_timeout_ms: u64,
        #[serde(default)]
        backoff_ms: u64,
    },

    /// A worker picked up an attempt
    ActivityStarted {
        call_site: u32,
        attempt: u32,
        worker_id: String,
    },

    /// An attempt finished successfully
    ActivityCompleted {
        call_site: u32,
        attempt: u32,
        result: Value,
    },

    /// An attempt failed or timed out
    ActivityFailed {
        call_site: u32,
        attempt: u32,
        error_kind: ErrorKind,
        message: String,
        retryable: bool,
    },

    /// The workflow returned a result
    WorkflowCompleted { result: Value },

    /// The workflow failed
    WorkflowFailed { error_kind: ErrorKind, message: String },

    /// An external cancel request was received
    WorkflowCancelRequested { reason: String },

    /// The run was cancelled
    WorkflowCancelled,

    /// The run exceeded its execution timeout
    WorkflowTimedOut,
}

impl EventKind {
    /// Flat type of this payload
    pub fn event_type(&self) -> EventType {
        match self {
            Self::WorkflowStarted { .. } => EventType::WorkflowStarted,
            Self::ActivityScheduled { .. } => EventType::ActivityScheduled,
            Self::ActivityStarted { .. } => EventType::ActivityStarted,
            Self::ActivityCompleted { .. } => EventType::ActivityCompleted,
            Self::ActivityFailed { .. } => EventType::ActivityFailed,
            Self::WorkflowCompleted { .. } => EventType::WorkflowCompleted,
            Self::WorkflowFailed { .. } => EventType::WorkflowFailed,
            Self::WorkflowCancelRequested { .. } => EventType::WorkflowCancelRequested,
            Self::WorkflowCancelled => EventType::WorkflowCancelled,
            Self::WorkflowTimedOut => EventType::WorkflowTimedOut,
        }
    }
}

/// Types of events that can occur during workflow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    WorkflowStarted,
    ActivityScheduled,
    ActivityStarted,
    ActivityCompleted,
    ActivityFailed,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowCancelRequested,
    WorkflowCancelled,
    WorkflowTimedOut,
}

impl EventType {
    /// Terminal events close a run; nothing may follow them
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted
                | Self::WorkflowFailed
                | Self::WorkflowCancelled
                | Self::WorkflowTimedOut
        )
    }
}

/// Persisted failure taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The activity (or workflow) logic returned an error
    ApplicationError,

    /// No completion within the configured bound
    Timeout,

    /// Replay diverged from the persisted history
    NonDeterminismError,

    /// The run was cancelled while the call was outstanding
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ApplicationError => "ApplicationError",
            Self::Timeout => "Timeout",
            Self::NonDeterminismError => "NonDeterminismError",
            Self::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

/// Idempotency key builders.
///
/// Keys are derived from the run and the logical call-site index, never from
/// wall-clock data, so a retried orchestrator pass produces identical keys.
pub mod keys {
    use uuid::Uuid;

    pub fn start(run_id: Uuid) -> String {
        format!("{}:start", run_id)
    }

    pub fn cancel_requested(run_id: Uuid) -> String {
        format!("{}:cancel", run_id)
    }

    /// Shared by every terminal event, so a run closes exactly once
    pub fn close(run_id: Uuid) -> String {
        format!("{}:close", run_id)
    }

    pub fn scheduled(run_id: Uuid, call_site: u32, attempt: u32) -> String {
        format!("{}:call:{}:{}:scheduled", run_id, call_site, attempt)
    }

    pub fn started(run_id: Uuid, call_site: u32, attempt: u32) -> String {
        format!("{}:call:{}:{}:started", run_id, call_site, attempt)
    }

    /// Shared by completion and failure: one outcome per attempt
    pub fn outcome(run_id: Uuid, call_site: u32, attempt: u32) -> String {
        format!("{}:call:{}:{}:outcome", run_id, call_site, attempt)
    }
}
