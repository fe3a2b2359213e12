//! Activity interfaces.
//!
//! Activities are the non-deterministic units of work invoked by workflows:
//! plain input-to-output functions executed by workers. Side effects are
//! allowed; delivery is at-least-once, so an activity may run more than once
//! for the same call.

pub mod fibo;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub use fibo::FiboActivity;

/// Error returned by an activity
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ActivityError {
    pub message: String,

    /// Skip the retry policy and fail the call immediately
    pub non_retryable: bool,
}

impl ActivityError {
    /// Failure that the retry policy may retry
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            non_retryable: false,
        }
    }

    /// Failure that fails the call regardless of the retry policy
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            non_retryable: true,
        }
    }
}

/// Trait for activity implementations
#[async_trait]
pub trait Activity: Send + Sync {
    /// Registered activity type name
    fn activity_type(&self) -> &str;

    /// Execute with the scheduled input
    async fn execute(&self, input: Value) -> Result<Value, ActivityError>;
}

/// Activity backed by a synchronous closure
pub struct FnActivity<F> {
    activity_type: String,
    func: F,
}

impl<F> FnActivity<F>
where
    F: Fn(Value) -> Result<Value, ActivityError> + Send + Sync,
{
    pub fn new(activity_type: impl Into<String>, func: F) -> Self {
        Self {
            activity_type: activity_type.into(),
            func,
        }
    }
}

#[async_trait]
impl<F> Activity for FnActivity<F>
where
    F: Fn(Value) -> Result<Value, ActivityError> + Send + Sync,
{
    fn activity_type(&self) -> &str {
        &self.activity_type
    }

    async fn execute(&self, input: Value) -> Result<Value, ActivityError> {
        (self.func)(input)
    }
}

/// Registry with every built-in activity
pub fn builtin() -> ActivityRegistry {
    ActivityRegistry::new().with(FiboActivity)
}

/// Maps activity type names to implementations
#[derive(Clone, Default)]
pub struct ActivityRegistry {
    activities: HashMap<String, Arc<dyn Activity>>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an activity under its own type name (builder style)
    pub fn with(mut self, activity: impl Activity + 'static) -> Self {
        self.register(activity);
        self
    }

    pub fn register(&mut self, activity: impl Activity + 'static) {
        let activity: Arc<dyn Activity> = Arc::new(activity);
        self.activities
            .insert(activity.activity_type().to_string(), activity);
    }

    pub fn get(&self, activity_type: &str) -> Option<Arc<dyn Activity>> {
        self.activities.get(activity_type).cloned()
    }

    /// Registered type names, sorted
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.activities.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl std::fmt::Debug for ActivityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityRegistry")
            .field("types", &self.types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_fn_activity() {
        let registry = ActivityRegistry::new()
            .with(FnActivity::new("double", |input: Value| {
                let n = input
                    .as_i64()
                    .ok_or_else(|| ActivityError::non_retryable("expected an integer"))?;
                Ok(json!(n * 2))
            }))
            .with(FiboActivity);

        assert_eq!(registry.types(), vec!["double", "fibo"]);

        let double = registry.get("double").unwrap();
        assert_eq!(double.execute(json!(21)).await.unwrap(), json!(42));

        let err = double.execute(json!("x")).await.unwrap_err();
        assert!(err.non_retryable);
        assert_eq!(err.to_string(), "expected an integer");
    }
}
