//! ledgerflow - Event-sourced durable workflow orchestrator
//!
//! Workflows are ordinary synchronous Rust programs that call activities
//! through a [`core::WorkflowContext`]. Every decision they make is recorded
//! in an append-only event log and recovered by replaying the program
//! against that log.
//!
//! # Architecture
//!
//! The system is built around event sourcing:
//! - All state changes are recorded as immutable events
//! - Current state is derived by replaying events
//! - Activities are dispatched through lease-based task queues
//! - Running workflows resume from their history after a crash
//!
//! # Modules
//!
//! - `core`: Event log, task queues, replay executor, orchestrator
//! - `domain`: Data structures (Event, WorkflowRun, ActivityTask)
//! - `worker`: Activity dispatcher polling a task queue
//! - `activities` / `workflows`: Built-in programs (fibonacci benchmark)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run the benchmark workflow with two workers
//! ledgerflow bench --iter 10 --fibo-n 33 --workers 2
//!
//! # Inspect a workflow
//! ledgerflow status bench_10_33
//! ledgerflow timing bench_10_33
//!
//! # Resume running workflows after a crash
//! ledgerflow recover
//! ```

pub mod activities;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod worker;
pub mod workflows;

// Re-export main types at crate root for convenience
pub use activities::{Activity, ActivityError, ActivityRegistry};
pub use core::{
    EventLog, Orchestrator, StartWorkflowRequest, TaskQueue, Workflow, WorkflowContext, WorkflowRegistry,
};
pub use domain::{ActivityTask, Event, EventKind, EventType, RunKey, RunStatus, WorkflowRun};
pub use worker::{Worker, WorkerOptions};
