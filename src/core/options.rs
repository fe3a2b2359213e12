//! Per-activity options exposed to workflow logic.
//!
//! Options are supplied by the workflow program at each call and are part of
//! its deterministic input: retry decisions made during replay depend only on
//! these values and the recorded history.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::task::millis;

/// Options for a single activity call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityOptions {
    /// User-facing activity id (defaults to "activity-{call_site}")
    #[serde(default)]
    pub activity_id: Option<String>,

    /// Queue override (defaults to the workflow's task queue)
    #[serde(default)]
    pub task_queue: Option<String>,

    /// Bound on a single attempt, from start to completion
    #[serde(default = "default_start_to_close_ms")]
    pub start_to_close_timeout_ms: u64,

    /// Retry policy for failed attempts
    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

fn default_start_to_close_ms() -> u64 {
    360_000
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            activity_id: None,
            task_queue: None,
            start_to_close_timeout_ms: default_start_to_close_ms(),
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl ActivityOptions {
    pub fn with_activity_id(mut self, activity_id: impl Into<String>) -> Self {
        self.activity_id = Some(activity_id.into());
        self
    }

    pub fn with_task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.task_queue = Some(task_queue.into());
        self
    }

    pub fn with_start_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.start_to_close_timeout_ms = millis(timeout);
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Effective attempt timeout
    pub fn start_to_close_timeout(&self) -> Duration {
        Duration::from_millis(self.start_to_close_timeout_ms)
    }
}

/// Retry policy for failed activity attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub fn no_retries() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Retry immediately up to `max_attempts` (useful for tests and benches)
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            ..Default::default()
        }
    }

    /// Delay before the attempt that follows `attempt` (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms.min(self.max_delay_ms));
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_delays() {
        let policy = RetryPolicy {
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 10000,
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(8000));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(10000)); // Capped
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::no_retries().should_retry(1));
    }

    #[test]
    fn test_immediate_policy_has_no_delay() {
        let policy = RetryPolicy::immediate(5);
        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(4), Duration::ZERO);
    }

    #[test]
    fn test_options_yaml_defaults() {
        let options: ActivityOptions = serde_yaml::from_str(
            r#"
activity_id: task_00
retry_policy:
  max_attempts: 5
"#,
        )
        .unwrap();

        assert_eq!(options.activity_id.as_deref(), Some("task_00"));
        assert_eq!(options.start_to_close_timeout(), Duration::from_secs(360));
        assert_eq!(options.retry_policy.max_attempts, 5);
        assert_eq!(options.retry_policy.initial_delay_ms, 1000);
    }
}
