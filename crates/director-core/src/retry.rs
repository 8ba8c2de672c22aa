//! Bounded retry wrapper for API-facing operations.
//!
//! Writes and reads against the API server retry on retryable failures
//! with Fibonacci backoff, up to a fixed attempt budget. Every attempt
//! is reported to the [`MetricsRecorder`] with its attempt number as a
//! label, capped at `"max"` so the label set stays bounded.

use std::time::Duration;

use tracing::{debug, warn};

use crate::backoff::FibonacciBackoff;
use crate::error::Error;
use crate::metrics::MetricsRecorder;

/// Retry budget and backoff bounds for one class of operation.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Backoff before the second attempt.
    pub min_backoff: Duration,
    /// Backoff ceiling.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Policy that fits within an enclosing deadline.
    ///
    /// Attempts are trimmed until the cumulative backoff leaves at least a
    /// second of headroom for the final attempt itself, so exhaustion (and
    /// the `"max"` attempt label) is reachable before the deadline fires.
    #[must_use]
    pub fn within_deadline(deadline: Duration) -> Self {
        let default = Self::default();
        let sleep_budget = deadline.as_secs().saturating_sub(1);
        let mut backoff = FibonacciBackoff::new(
            default.min_backoff.as_secs(),
            default.max_backoff.as_secs(),
        );
        let mut attempts = 1;
        let mut slept = 0;
        while attempts < default.max_attempts {
            let next = backoff.next_backoff().as_secs();
            if slept + next > sleep_budget {
                break;
            }
            slept += next;
            attempts += 1;
        }
        Self { max_attempts: attempts, ..default }
    }
}

/// Outcome bookkeeping for one wrapped operation.
#[derive(Debug, Clone, Default)]
pub struct RetryContext {
    /// Attempts actually made.
    pub attempts: u32,
    /// Whether the operation succeeded on a retry rather than first try.
    pub succeeded_after_retry: bool,
}

/// Attempt number as a bounded metric label.
#[must_use]
pub fn attempt_label(attempt: u32, max_attempts: u32) -> String {
    if attempt >= max_attempts {
        "max".to_string()
    } else {
        attempt.to_string()
    }
}

/// Runs `body` up to `policy.max_attempts` times, sleeping a Fibonacci
/// backoff between attempts. Non-retryable errors return immediately.
pub async fn with_retries<T, F, Fut>(
    policy: RetryPolicy,
    metrics: &dyn MetricsRecorder,
    namespace: &str,
    service: &str,
    op: &str,
    mut body: F,
) -> (Result<T, Error>, RetryContext)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut backoff = FibonacciBackoff::new(
        policy.min_backoff.as_secs(),
        policy.max_backoff.as_secs(),
    );
    let mut ctx = RetryContext::default();

    loop {
        ctx.attempts += 1;
        let label = attempt_label(ctx.attempts, policy.max_attempts);
        metrics.record_retry_attempt(namespace, service, op, &label);

        match body().await {
            Ok(value) => {
                if ctx.attempts > 1 {
                    ctx.succeeded_after_retry = true;
                    metrics.record_retry_success_after_retry(namespace, service, op);
                    debug!(namespace, service, op, attempts = ctx.attempts, "Succeeded after retry");
                }
                return (Ok(value), ctx);
            }
            Err(e) if e.is_retryable() && ctx.attempts < policy.max_attempts => {
                let delay = backoff.next_backoff();
                warn!(
                    namespace,
                    service,
                    op,
                    attempt = ctx.attempts,
                    delay_secs = delay.as_secs(),
                    "Retryable failure: {}",
                    e
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return (Err(e), ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::metrics::{MetricEvent, RecordingRecorder};

    fn fail_n_times(n: u32) -> (Arc<AtomicU32>, impl FnMut() -> std::pin::Pin<Box<dyn Future<Output = Result<u32, Error>> + Send>>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let body = move || {
            let c = counter.fetch_add(1, Ordering::SeqCst) + 1;
            Box::pin(async move {
                if c <= n {
                    Err(Error::Timeout("simulated".to_string()))
                } else {
                    Ok(c)
                }
            }) as std::pin::Pin<Box<dyn Future<Output = Result<u32, Error>> + Send>>
        };
        (calls, body)
    }

    #[test]
    fn attempt_label_caps_at_max() {
        assert_eq!(attempt_label(1, 5), "1");
        assert_eq!(attempt_label(4, 5), "4");
        assert_eq!(attempt_label(5, 5), "max");
        assert_eq!(attempt_label(7, 5), "max");
    }

    #[tokio::test(start_paused = true)]
    async fn first_try_success_records_single_attempt() {
        let metrics = RecordingRecorder::new();
        let (_, body) = fail_n_times(0);
        let (result, ctx) =
            with_retries(RetryPolicy::default(), &metrics, "ns", "s1", "endpoint_write", body)
                .await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(ctx.attempts, 1);
        assert!(!ctx.succeeded_after_retry);
        assert_eq!(
            metrics.count(|e| matches!(e, MetricEvent::RetryAttempt { .. })),
            1
        );
        assert_eq!(
            metrics.count(|e| matches!(e, MetricEvent::RetrySuccessAfterRetry { .. })),
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failures_then_success_records_each_attempt_and_one_recovery() {
        let metrics = RecordingRecorder::new();
        let (calls, body) = fail_n_times(3);
        let (result, ctx) =
            with_retries(RetryPolicy::default(), &metrics, "ns", "s1", "endpoint_write", body)
                .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(ctx.attempts, 4);
        assert!(ctx.succeeded_after_retry);
        assert_eq!(
            metrics.count(|e| matches!(e, MetricEvent::RetryAttempt { .. })),
            4
        );
        assert_eq!(
            metrics.count(|e| matches!(e, MetricEvent::RetrySuccessAfterRetry { .. })),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_labels_final_attempt_max() {
        let metrics = RecordingRecorder::new();
        let (calls, body) = fail_n_times(100);
        let (result, ctx) =
            with_retries(RetryPolicy::default(), &metrics, "ns", "s1", "endpoint_write", body)
                .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(ctx.attempts, 5);
        assert!(!ctx.succeeded_after_retry);
        let attempts: Vec<String> = metrics
            .events()
            .into_iter()
            .filter_map(|e| match e {
                MetricEvent::RetryAttempt { attempt, .. } => Some(attempt),
                _ => None,
            })
            .collect();
        assert_eq!(attempts, vec!["1", "2", "3", "4", "max"]);
        assert_eq!(
            metrics.count(|e| matches!(e, MetricEvent::RetrySuccessAfterRetry { .. })),
            0
        );
    }

    #[test]
    fn deadline_bound_policy_trims_attempts_to_fit() {
        let tight = RetryPolicy::within_deadline(Duration::from_secs(5));
        assert_eq!(tight.max_attempts, 4);
        let roomy = RetryPolicy::within_deadline(Duration::from_secs(30));
        assert_eq!(roomy.max_attempts, 5);
        let immediate = RetryPolicy::within_deadline(Duration::from_secs(1));
        assert_eq!(immediate.max_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_bound_policy_exhausts_before_the_deadline() {
        let metrics = RecordingRecorder::new();
        let (_, body) = fail_n_times(100);
        let deadline = Duration::from_secs(5);
        let policy = RetryPolicy::within_deadline(deadline);
        let (result, ctx) = tokio::time::timeout(
            deadline,
            with_retries(policy, &metrics, "ns", "s1", "endpoint_write", body),
        )
        .await
        .expect("retries must exhaust inside the deadline");
        assert!(result.is_err());
        assert_eq!(ctx.attempts, 4);
        let attempts: Vec<String> = metrics
            .events()
            .into_iter()
            .filter_map(|e| match e {
                MetricEvent::RetryAttempt { attempt, .. } => Some(attempt),
                _ => None,
            })
            .collect();
        assert_eq!(attempts, vec!["1", "2", "3", "max"]);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_returns_immediately() {
        let metrics = RecordingRecorder::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let (result, ctx): (Result<(), Error>, _) = with_retries(
            RetryPolicy::default(),
            &metrics,
            "ns",
            "s1",
            "endpoint_write",
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::PortResolutionFailed("no such port".to_string())) }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.attempts, 1);
    }
}
