//! Centralized retry policy
//!
//! Every workflow step (extraction, each branch, aggregation) runs its
//! external work through [`run_with_retry`], so the bounded-attempt
//! loop, the exponential backoff with jitter, and the error
//! classification live in exactly one tested place.
//!
//! Classification semantics:
//! - `Transient`: retried until the attempt budget is exhausted
//! - `Permanent`: returned immediately, no retry
//! - `Unknown`: retried once, then treated as permanent

use crate::types::{ErrorClass, StepError};
use cardvault_common::config::EngineConfig;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Bounded-attempt retry policy with exponential backoff and jitter
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.backoff_base_ms),
            max_delay: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// Backoff delay before the given retry (attempt is 1-based; the
    /// delay precedes attempt `attempt + 1`). Exponential, capped, with
    /// half-width jitter to avoid thundering-herd against external
    /// services.
    pub fn delay_before_retry(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let raw = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_delay);
        let raw_ms = raw.as_millis() as u64;
        if raw_ms == 0 {
            return Duration::ZERO;
        }
        let half = raw_ms / 2;
        let jittered = half + rand::thread_rng().gen_range(0..=raw_ms - half);
        Duration::from_millis(jittered)
    }
}

#[cfg(test)]
impl RetryPolicy {
    /// Zero-delay policy for tests
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }
}

/// Successful step result with the attempts it consumed
#[derive(Debug)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

/// Terminal step failure with the attempts it consumed
#[derive(Debug)]
pub struct RetryExhausted {
    pub error: StepError,
    pub attempts: u32,
}

/// Run an operation under the retry policy
///
/// # Arguments
/// * `step_name` - Name for logging (e.g., "extraction", "pricing")
/// * `policy` - Attempt budget and backoff parameters
/// * `operation` - Async closure performing one attempt
pub async fn run_with_retry<F, Fut, T>(
    step_name: &str,
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<Retried<T>, RetryExhausted>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StepError>>,
{
    let mut attempt = 0u32;
    let mut unknown_seen = false;

    loop {
        attempt += 1;

        if attempt > 1 {
            tracing::debug!(step = step_name, attempt, "Retrying step");
        }

        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(step = step_name, attempt, "Step succeeded after retry");
                }
                return Ok(Retried { value, attempts: attempt });
            }
            Err(error) => {
                let class = error.class();

                let retryable = match class {
                    ErrorClass::Permanent => false,
                    ErrorClass::Transient => true,
                    ErrorClass::Unknown => {
                        // Conservative: one retry for unclassified errors
                        let first = !unknown_seen;
                        unknown_seen = true;
                        first
                    }
                };

                if !retryable || attempt >= policy.max_attempts {
                    tracing::warn!(
                        step = step_name,
                        attempt,
                        class = ?class,
                        error = %error,
                        "Step failed terminally"
                    );
                    return Err(RetryExhausted { error, attempts: attempt });
                }

                let delay = policy.delay_before_retry(attempt);
                tracing::warn!(
                    step = step_name,
                    attempt,
                    backoff_ms = delay.as_millis() as u64,
                    error = %error,
                    "Step failed, will retry after backoff"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_succeeds_first_attempt() {
        let policy = RetryPolicy::immediate(3);
        let result = run_with_retry("test", &policy, || async { Ok::<_, StepError>(42) })
            .await
            .unwrap();
        assert_eq!(result.value, 42);
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn test_transient_retried_until_success() {
        let policy = RetryPolicy::immediate(3);
        let calls = AtomicU32::new(0);

        let result = run_with_retry("test", &policy, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(StepError::Timeout("slow".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result.value, 7);
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test]
    async fn test_transient_exhausts_budget() {
        let policy = RetryPolicy::immediate(3);
        let calls = AtomicU32::new(0);

        let err = run_with_retry("test", &policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<u32, _>(StepError::Network("down".into())) }
        })
        .await
        .unwrap_err();

        assert_eq!(err.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_fails_immediately() {
        let policy = RetryPolicy::immediate(3);
        let calls = AtomicU32::new(0);

        let err = run_with_retry("test", &policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<u32, _>(StepError::UnreadableInput("corrupt".into())) }
        })
        .await
        .unwrap_err();

        assert_eq!(err.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_retried_exactly_once() {
        let policy = RetryPolicy::immediate(5);
        let calls = AtomicU32::new(0);

        let err = run_with_retry("test", &policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<u32, _>(StepError::Internal("odd".into())) }
        })
        .await
        .unwrap_err();

        // First failure earns one retry; the second unknown failure is terminal
        assert_eq!(err.attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
        };
        for attempt in 1..10 {
            assert!(policy.delay_before_retry(attempt) <= Duration::from_millis(400));
        }
    }
}
