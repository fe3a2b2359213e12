//! Fibonacci activity: naive recursion, used as a CPU-bound benchmark load.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Activity, ActivityError};

/// Largest `n` whose result fits in a u64
pub const MAX_FIBO_N: u64 = 93;

/// Naive recursive Fibonacci
pub fn fibo(n: u64) -> u64 {
    if n <= 1 {
        return n;
    }
    fibo(n - 1) + fibo(n - 2)
}

/// Computes `fibo(n)` on the blocking pool
#[derive(Debug, Clone, Copy, Default)]
pub struct FiboActivity;

impl FiboActivity {
    pub const TYPE: &'static str = "fibo";
}

#[async_trait]
impl Activity for FiboActivity {
    fn activity_type(&self) -> &str {
        Self::TYPE
    }

    async fn execute(&self, input: Value) -> Result<Value, ActivityError> {
        let n = input
            .as_u64()
            .ok_or_else(|| ActivityError::non_retryable(format!("fibo expects a non-negative integer, got {}", input)))?;
        if n > MAX_FIBO_N {
            return Err(ActivityError::non_retryable(format!(
                "fibo({}) overflows a 64-bit result",
                n
            )));
        }

        let result = tokio::task::spawn_blocking(move || fibo(n))
            .await
            .map_err(|e| ActivityError::retryable(format!("fibo worker thread failed: {}", e)))?;

        Ok(json!(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fibo_values() {
        assert_eq!(fibo(0), 0);
        assert_eq!(fibo(1), 1);
        assert_eq!(fibo(10), 55);
        assert_eq!(fibo(20), 6765);
    }

    #[tokio::test]
    async fn test_fibo_activity() {
        assert_eq!(FiboActivity.execute(json!(15)).await.unwrap(), json!(610));

        let err = FiboActivity.execute(json!(-1)).await.unwrap_err();
        assert!(err.non_retryable);

        let err = FiboActivity.execute(json!(MAX_FIBO_N + 1)).await.unwrap_err();
        assert!(err.non_retryable);
    }
}
