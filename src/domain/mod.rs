//! Domain types for the durable execution core.
//!
//! This module contains the core data structures:
//! - Events: Immutable records of workflow progress
//! - WorkflowRun: Run state derived from events
//! - ActivityTask: Dispatch records for scheduled activity attempts

pub mod events;
pub mod run;
pub mod task;

// Re-export commonly used types
pub use events::{keys, ErrorKind, Event, EventKind, EventType};
pub use run::{RunKey, RunStatus, WorkflowRun};
pub use task::ActivityTask;
