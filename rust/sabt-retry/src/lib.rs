// sabt-retry: Deterministic retry helpers with metrics instrumentation
//
// Both shapes exist because the core is split: exporter file I/O is
// blocking, the request path is async. Semantics are identical.

use std::future::Future;

use sabt_clock::{jitter_fraction, AsyncSleeper, Sleeper};
use sabt_metrics::ServiceMetrics;
use thiserror::Error;

/// Retry policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// First-attempt delay in seconds
    pub base_delay: f64,
    /// Growth factor between attempts
    pub factor: f64,
    /// Upper bound on any single delay
    pub max_delay: f64,
    /// Total attempts including the first
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: 0.1,
            factor: 2.0,
            max_delay: 5.0,
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Deterministic backoff including jitter for `attempt` (1-indexed)
    pub fn backoff_for(&self, attempt: u32, correlation_id: &str, op: &str) -> f64 {
        let attempt = attempt.max(1);
        let raw = (self.base_delay * self.factor.powi(attempt as i32 - 1)).min(self.max_delay);
        let seed = format!("{correlation_id}:{op}");
        (raw * (0.9 + 0.2 * jitter_fraction(&seed, attempt))).min(self.max_delay)
    }
}

/// Terminal retry failure
#[derive(Debug, Error)]
#[error("RETRY_EXHAUSTED: در حال حاضر امکان انجام عملیات نیست؛ لطفاً بعداً دوباره تلاش کنید.")]
pub struct RetryExhausted<E> {
    pub op: String,
    pub correlation_id: String,
    pub last_error: E,
}

fn record_terminal(metrics: &ServiceMetrics, op: &str) {
    metrics
        .retry_attempts_total
        .with_label_values(&[op, "failure"])
        .inc();
    metrics.retry_exhaustion_total.with_label_values(&[op]).inc();
}

fn record_retry(metrics: &ServiceMetrics, op: &str, backoff: f64) {
    metrics
        .retry_attempts_total
        .with_label_values(&[op, "retry"])
        .inc();
    metrics
        .retry_backoff_seconds
        .with_label_values(&[op])
        .observe(backoff);
}

fn record_success(metrics: &ServiceMetrics, op: &str) {
    metrics
        .retry_attempts_total
        .with_label_values(&[op, "success"])
        .inc();
}

/// Run `f` under `policy`, sleeping through the injected sleeper.
///
/// Errors for which `is_retryable` returns false terminate immediately;
/// otherwise attempts continue until the policy is exhausted. Terminal
/// failures of either kind surface as `RetryExhausted` carrying the last
/// underlying error.
pub fn execute_with_retry<T, E, F>(
    mut f: F,
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    is_retryable: impl Fn(&E) -> bool,
    metrics: &ServiceMetrics,
    correlation_id: &str,
    op: &str,
) -> Result<T, RetryExhausted<E>>
where
    F: FnMut() -> Result<T, E>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f() {
            Ok(value) => {
                record_success(metrics, op);
                return Ok(value);
            }
            Err(error) => {
                if !is_retryable(&error) || attempt >= policy.max_attempts {
                    record_terminal(metrics, op);
                    return Err(RetryExhausted {
                        op: op.to_string(),
                        correlation_id: correlation_id.to_string(),
                        last_error: error,
                    });
                }
                let backoff = policy.backoff_for(attempt, correlation_id, op);
                record_retry(metrics, op, backoff);
                sleeper.sleep(backoff);
            }
        }
    }
}

/// Async twin of `execute_with_retry`
pub async fn execute_with_retry_async<T, E, F, Fut>(
    mut f: F,
    policy: &RetryPolicy,
    sleeper: &dyn AsyncSleeper,
    is_retryable: impl Fn(&E) -> bool,
    metrics: &ServiceMetrics,
    correlation_id: &str,
    op: &str,
) -> Result<T, RetryExhausted<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(value) => {
                record_success(metrics, op);
                return Ok(value);
            }
            Err(error) => {
                if !is_retryable(&error) || attempt >= policy.max_attempts {
                    record_terminal(metrics, op);
                    return Err(RetryExhausted {
                        op: op.to_string(),
                        correlation_id: correlation_id.to_string(),
                        last_error: error,
                    });
                }
                let backoff = policy.backoff_for(attempt, correlation_id, op);
                record_retry(metrics, op, backoff);
                sleeper.sleep(backoff).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use sabt_clock::{FrozenClock, TickSleeper};
    use std::sync::Arc;

    fn harness() -> (Arc<FrozenClock>, TickSleeper, ServiceMetrics) {
        let clock = Arc::new(FrozenClock::at(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let sleeper = TickSleeper::new(Arc::clone(&clock));
        let metrics = ServiceMetrics::new("retry_test").unwrap();
        (clock, sleeper, metrics)
    }

    #[derive(Debug)]
    struct TransientError;

    #[test]
    fn succeeds_after_transient_failures() {
        let (_clock, sleeper, metrics) = harness();
        let policy = RetryPolicy::default();
        let mut calls = 0;
        let result = execute_with_retry(
            || {
                calls += 1;
                if calls < 3 {
                    Err(TransientError)
                } else {
                    Ok(42)
                }
            },
            &policy,
            &sleeper,
            |_| true,
            &metrics,
            "corr-1",
            "test.op",
        );
        assert_eq!(result.unwrap(), 42);
        assert_eq!(
            metrics
                .retry_attempts_total
                .with_label_values(&["test.op", "retry"])
                .get(),
            2
        );
        assert_eq!(
            metrics
                .retry_attempts_total
                .with_label_values(&["test.op", "success"])
                .get(),
            1
        );
    }

    #[test]
    fn exhaustion_after_exactly_two_sleeps() {
        let (clock, sleeper, metrics) = harness();
        let policy = RetryPolicy::default();
        let result: Result<(), _> = execute_with_retry(
            || Err(TransientError),
            &policy,
            &sleeper,
            |_| true,
            &metrics,
            "corr-2",
            "test.op",
        );
        let err = result.unwrap_err();
        assert_eq!(err.op, "test.op");
        assert_eq!(err.correlation_id, "corr-2");
        assert_eq!(
            metrics
                .retry_attempts_total
                .with_label_values(&["test.op", "retry"])
                .get(),
            2
        );
        assert_eq!(
            metrics
                .retry_exhaustion_total
                .with_label_values(&["test.op"])
                .get(),
            1
        );
        // Two observed sleeps: attempt 1 and attempt 2 backoffs.
        let expected = policy.backoff_for(1, "corr-2", "test.op")
            + policy.backoff_for(2, "corr-2", "test.op");
        assert!((clock.monotonic() - expected).abs() < 1e-9);
    }

    #[test]
    fn non_retryable_error_fails_without_sleeping() {
        let (clock, sleeper, metrics) = harness();
        let policy = RetryPolicy::default();
        let result: Result<(), _> = execute_with_retry(
            || Err(TransientError),
            &policy,
            &sleeper,
            |_| false,
            &metrics,
            "corr-3",
            "test.op",
        );
        assert!(result.is_err());
        assert_eq!(clock.monotonic(), 0.0);
        assert_eq!(
            metrics
                .retry_attempts_total
                .with_label_values(&["test.op", "failure"])
                .get(),
            1
        );
    }

    #[test]
    fn backoff_is_deterministic_and_capped() {
        let policy = RetryPolicy {
            base_delay: 1.0,
            factor: 2.0,
            max_delay: 3.0,
            max_attempts: 5,
        };
        assert_eq!(
            policy.backoff_for(2, "c", "op"),
            policy.backoff_for(2, "c", "op")
        );
        assert!(policy.backoff_for(4, "c", "op") <= 3.0);
    }

    #[tokio::test]
    async fn async_variant_matches_sync_semantics() {
        let (_clock, sleeper, metrics) = harness();
        let policy = RetryPolicy::default();
        let mut calls = 0;
        let result = execute_with_retry_async(
            || {
                calls += 1;
                let attempt = calls;
                async move {
                    if attempt < 2 {
                        Err(TransientError)
                    } else {
                        Ok("done")
                    }
                }
            },
            &policy,
            &sleeper,
            |_| true,
            &metrics,
            "corr-4",
            "test.async",
        )
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(
            metrics
                .retry_attempts_total
                .with_label_values(&["test.async", "retry"])
                .get(),
            1
        );
    }
}
