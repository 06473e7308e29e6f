//! # Fibonacci Backoff
//!
//! Progressive retry delay for failed reconciliation attempts. It grows more
//! slowly than an exponential backoff, so a management server that is briefly
//! unreachable is retried soon while a longer outage settles at the cap.
//!
//! Sequence with the controller defaults: 10s, 10s, 20s, 30s, 50s, 80s, 130s,
//! 210s, 300s (max).

use std::time::Duration;

/// Fibonacci backoff calculator
///
/// Each delay is the sum of the previous two, starting from `min_seconds`
/// twice and capped at `max_seconds`.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    /// Minimum backoff in seconds (for reset)
    min_seconds: u64,
    /// Previous backoff in seconds
    prev_seconds: u64,
    /// Current backoff in seconds
    current_seconds: u64,
    /// Maximum backoff in seconds
    max_seconds: u64,
}

impl FibonacciBackoff {
    /// Create a new Fibonacci backoff with minimum and maximum values in seconds
    #[must_use]
    pub fn new(min_seconds: u64, max_seconds: u64) -> Self {
        Self {
            min_seconds,
            prev_seconds: 0,
            current_seconds: min_seconds,
            max_seconds,
        }
    }

    /// Get the next backoff in seconds and advance the sequence
    pub fn next_backoff_seconds(&mut self) -> u64 {
        let result = self.current_seconds;

        let next = self.prev_seconds + self.current_seconds;
        self.prev_seconds = self.current_seconds;
        self.current_seconds = std::cmp::min(next, self.max_seconds);

        result
    }

    /// Get the next backoff as a `Duration` and advance the sequence
    #[must_use]
    pub fn next_backoff(&mut self) -> Duration {
        Duration::from_secs(self.next_backoff_seconds())
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.prev_seconds = 0;
        self.current_seconds = self.min_seconds;
    }

    /// Stateless delay for the given consecutive error count (0-indexed)
    #[must_use]
    pub fn calculate_for_error_count(error_count: u32, min_seconds: u64, max_seconds: u64) -> Duration {
        if error_count <= 1 {
            return Duration::from_secs(min_seconds);
        }

        let mut prev = min_seconds;
        let mut current = min_seconds;
        for _ in 2..=error_count {
            let next = prev + current;
            prev = current;
            current = std::cmp::min(next, max_seconds);
            if current >= max_seconds {
                break;
            }
        }

        Duration::from_secs(current)
    }
}
