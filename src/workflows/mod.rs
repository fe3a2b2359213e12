//! Workflow programs shipped with the engine.

pub mod bench;

pub use bench::{BenchInput, BenchWorkflow};
