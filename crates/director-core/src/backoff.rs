//! # Fibonacci Backoff
//!
//! Progressive backoff that grows more slowly than exponential backoff,
//! suitable for operations that may retry several times without overwhelming
//! the API server.
//!
//! Default write-retry sequence in seconds: 1s, 1s, 2s, 3s, 5s, 8s, ... capped.

use std::time::Duration;

/// Fibonacci backoff calculator.
///
/// Each backoff is the sum of the previous two, starting from `min_secs`
/// and capped at `max_secs`.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    min_secs: u64,
    prev_secs: u64,
    current_secs: u64,
    max_secs: u64,
}

impl FibonacciBackoff {
    /// Creates a backoff bounded by `min_secs` and `max_secs`.
    #[must_use]
    pub fn new(min_secs: u64, max_secs: u64) -> Self {
        Self {
            min_secs,
            prev_secs: 0,
            current_secs: min_secs,
            max_secs,
        }
    }

    /// Returns the current backoff and advances the sequence.
    pub fn next_backoff(&mut self) -> Duration {
        let result = Duration::from_secs(self.current_secs);
        let next = self.prev_secs + self.current_secs;
        self.prev_secs = self.current_secs;
        self.current_secs = next.min(self.max_secs);
        result
    }

    /// Resets to the initial state after a success.
    pub fn reset(&mut self) {
        self.prev_secs = 0;
        self.current_secs = self.min_secs;
    }

    /// Backoff for a given consecutive-error count, without internal state.
    ///
    /// Used by the requeue policy, where the error count lives in the status
    /// registry rather than in a backoff instance per Service.
    #[must_use]
    pub fn for_error_count(error_count: u32, min_secs: u64, max_secs: u64) -> Duration {
        if error_count <= 1 {
            return Duration::from_secs(min_secs.min(max_secs));
        }
        let mut prev = min_secs;
        let mut current = min_secs;
        for _ in 2..=error_count {
            let next = prev + current;
            prev = current;
            current = next.min(max_secs);
            if current >= max_secs {
                break;
            }
        }
        Duration::from_secs(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fibonacci_sequence() {
        let mut backoff = FibonacciBackoff::new(1, 30);

        assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(2));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(3));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(5));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(8));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(13));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(21));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(30));
    }

    #[test]
    fn caps_at_max() {
        let mut backoff = FibonacciBackoff::new(1, 5);
        for _ in 0..10 {
            assert!(backoff.next_backoff() <= Duration::from_secs(5));
        }
        assert_eq!(backoff.next_backoff(), Duration::from_secs(5));
    }

    #[test]
    fn reset_restarts_the_sequence() {
        let mut backoff = FibonacciBackoff::new(1, 30);
        backoff.next_backoff();
        backoff.next_backoff();
        backoff.next_backoff();
        backoff.reset();
        assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(2));
    }

    #[test]
    fn stateless_error_count_backoff() {
        assert_eq!(FibonacciBackoff::for_error_count(0, 1, 60), Duration::from_secs(1));
        assert_eq!(FibonacciBackoff::for_error_count(1, 1, 60), Duration::from_secs(1));
        assert_eq!(FibonacciBackoff::for_error_count(2, 1, 60), Duration::from_secs(2));
        assert_eq!(FibonacciBackoff::for_error_count(3, 1, 60), Duration::from_secs(3));
        assert_eq!(FibonacciBackoff::for_error_count(4, 1, 60), Duration::from_secs(5));
        assert_eq!(FibonacciBackoff::for_error_count(20, 1, 60), Duration::from_secs(60));
    }
}
