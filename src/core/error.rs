//! Error types for the execution core.
//!
//! Orchestrator-internal races (`ConcurrentAppendConflict`) are retried by the
//! orchestrator and never reach callers; everything in `EngineError` is
//! surfaced.

use thiserror::Error;
use uuid::Uuid;

use crate::domain::{ErrorKind, RunKey};

/// Errors from an event log backend
#[derive(Debug, Error)]
pub enum LogError {
    #[error("Concurrent append conflict: expected tail {expected}, found {actual}")]
    ConcurrentAppendConflict { expected: u64, actual: u64 },

    #[error("Run not found: {0}")]
    RunNotFound(RunKey),

    #[error("Run already exists: {0}")]
    RunAlreadyExists(RunKey),

    #[error("Corrupt event log: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from a task queue
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Unknown task: {0}")]
    UnknownTask(Uuid),

    #[error("Lease on task {0} expired")]
    LeaseExpired(Uuid),

    #[error("Lease token does not match the current claim on task {0}")]
    LeaseMismatch(Uuid),
}

/// Errors surfaced by the orchestrator API
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Workflow '{workflow_id}' already has an active run {run_id}")]
    AlreadyExists { workflow_id: String, run_id: Uuid },

    #[error("Workflow type not registered: {0}")]
    UnknownWorkflowType(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Workflow '{workflow_id}' failed: {error_kind}: {message}")]
    WorkflowFailed {
        workflow_id: String,
        error_kind: ErrorKind,
        message: String,
    },

    #[error("Workflow '{0}' timed out")]
    WorkflowTimedOut(String),

    #[error("Workflow '{0}' was cancelled")]
    WorkflowCancelled(String),

    #[error("Gave up appending to {run} after {attempts} conflicting attempts")]
    AppendRetriesExhausted { run: RunKey, attempts: u32 },

    #[error(transparent)]
    Log(#[from] LogError),
}

/// Replay failures. Always fatal for the run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReplayError {
    #[error("Non-deterministic workflow: {0}")]
    NonDeterminism(String),

    #[error("History does not start with WorkflowStarted")]
    MissingStart,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = LogError::ConcurrentAppendConflict {
            expected: 3,
            actual: 5,
        };
        assert_eq!(
            err.to_string(),
            "Concurrent append conflict: expected tail 3, found 5"
        );

        let err = EngineError::from(LogError::Corrupt("bad line".to_string()));
        assert_eq!(err.to_string(), "Corrupt event log: bad line");

        let err = EngineError::WorkflowFailed {
            workflow_id: "bench_10_33".to_string(),
            error_kind: ErrorKind::Timeout,
            message: "no response".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Workflow 'bench_10_33' failed: Timeout: no response"
        );
    }
}
