//! Client-side API budget.
//!
//! A token bucket shared by all reconcile workers keeps the controller's
//! aggregate request rate against the API server bounded, independent of
//! how many services are churning at once.

use std::sync::Mutex;

use tokio::time::{Duration, Instant};
use tracing::trace;

#[derive(Debug)]
struct BudgetState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket limiting API request rate.
///
/// Refills at `qps` tokens per second up to `burst`; [`acquire`](Self::acquire)
/// waits until a token is available.
#[derive(Debug)]
pub struct ApiBudget {
    qps: f64,
    burst: f64,
    state: Mutex<BudgetState>,
}

impl ApiBudget {
    /// Creates a full bucket. `qps` and `burst` are clamped to at least 1.
    #[must_use]
    pub fn new(qps: u32, burst: u32) -> Self {
        let qps = f64::from(qps.max(1));
        let burst = f64::from(burst.max(1));
        Self {
            qps,
            burst,
            state: Mutex::new(BudgetState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Takes one token, waiting for the refill if the bucket is empty.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self
                    .state
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.qps).min(self.burst);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.qps)
            };
            trace!(
                wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                "API budget exhausted, waiting"
            );
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_is_available_immediately() {
        let budget = ApiBudget::new(10, 3);
        let start = Instant::now();
        budget.acquire().await;
        budget.acquire().await;
        budget.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_bucket_waits_for_refill() {
        let budget = ApiBudget::new(10, 1);
        budget.acquire().await;
        let start = Instant::now();
        budget.acquire().await;
        // 10 qps refills one token in 100ms
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_do_not_accumulate_past_burst() {
        let budget = ApiBudget::new(100, 2);
        tokio::time::advance(Duration::from_secs(60)).await;
        budget.acquire().await;
        budget.acquire().await;
        let start = Instant::now();
        budget.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(10));
    }
}
