//! Benchmark workflow: calls the fibo activity `iter` times.
//!
//! Sequential mode waits for each call before issuing the next one. Parallel
//! mode schedules every call up front, then collects results in call order.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::activities::FiboActivity;
use crate::core::{ActivityOptions, Interrupt, RetryPolicy, Workflow, WorkflowContext, WorkflowResult};

/// Input of a bench run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchInput {
    /// Number of activity calls
    #[serde(default = "default_iter")]
    pub iter: u32,

    /// Argument passed to every fibo call
    #[serde(default = "default_fibo_n")]
    pub fibo_n: u64,

    /// Fan out all calls at once
    #[serde(default)]
    pub parallel: bool,
}

fn default_iter() -> u32 {
    10
}
fn default_fibo_n() -> u64 {
    33
}

impl Default for BenchInput {
    fn default() -> Self {
        Self {
            iter: default_iter(),
            fibo_n: default_fibo_n(),
            parallel: false,
        }
    }
}

impl BenchInput {
    /// Conventional workflow id for this configuration
    pub fn workflow_id(&self) -> String {
        format!("bench_{}_{}", self.iter, self.fibo_n)
    }

    /// Conventional task queue for this configuration
    pub fn task_queue(&self) -> String {
        format!("bench-{}-task-queue", self.iter)
    }
}

/// The bench workflow
#[derive(Debug, Clone)]
pub struct BenchWorkflow {
    start_to_close_timeout: Duration,
    retry_policy: RetryPolicy,
}

impl Default for BenchWorkflow {
    fn default() -> Self {
        Self {
            start_to_close_timeout: Duration::from_secs(360),
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl BenchWorkflow {
    pub const TYPE: &'static str = "bench";

    pub fn with_start_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.start_to_close_timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    fn options(&self, i: u32) -> ActivityOptions {
        ActivityOptions::default()
            .with_activity_id(format!("task_{:02}", i))
            .with_start_to_close_timeout(self.start_to_close_timeout)
            .with_retry_policy(self.retry_policy.clone())
    }
}

impl Workflow for BenchWorkflow {
    fn workflow_type(&self) -> &str {
        Self::TYPE
    }

    fn run(&self, ctx: &mut WorkflowContext<'_>, input: &Value) -> WorkflowResult<Value> {
        let input: BenchInput = serde_json::from_value(input.clone())
            .map_err(|e| Interrupt::fail(format!("invalid bench input: {}", e)))?;

        let mut results = Vec::new();
        if input.parallel {
            let handles: Vec<_> = (0..input.iter)
                .map(|i| ctx.schedule_activity(FiboActivity::TYPE, json!(input.fibo_n), &self.options(i)))
                .collect();
            for handle in &handles {
                results.push(ctx.wait(handle)?);
            }
        } else {
            for i in 0..input.iter {
                results.push(ctx.call_activity(FiboActivity::TYPE, json!(input.fibo_n), &self.options(i))?);
            }
        }

        Ok(json!({
            "iterations": input.iter,
            "results": results,
        }))
    }
}
