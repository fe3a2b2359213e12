//! Core orchestration logic.
//!
//! This module contains:
//! - EventLog: Append-only, optimistically concurrent history per run
//! - TaskQueue: Lease-based activity dispatch
//! - Executor: Deterministic replay of workflow programs
//! - Orchestrator: Main execution engine
//! - Timing: Activity timing analysis over histories

pub mod error;
pub mod event_log;
pub mod executor;
pub mod options;
pub mod orchestrator;
pub mod registry;
pub mod task_queue;
pub mod timing;

// Re-export commonly used types
pub use error::{EngineError, LogError, QueueError, ReplayError};
pub use event_log::{AppendResult, EventLog, FileEventLog, History, InMemoryEventLog};
pub use executor::{
    replay, ActivityFailure, ActivityHandle, Command, Interrupt, ReplayOutcome, Workflow,
    WorkflowContext, WorkflowExecutionState, WorkflowResult,
};
pub use options::{ActivityOptions, RetryPolicy};
pub use orchestrator::{IdReusePolicy, Orchestrator, OrchestratorConfig, StartWorkflowRequest};
pub use registry::WorkflowRegistry;
pub use task_queue::{ClaimedTask, Lease, QueueStats, TaskQueue, TaskQueueRegistry};
pub use timing::{ActivityTiming, TimingReport};
