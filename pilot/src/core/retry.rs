//! Retry budget for consecutive failed verification attempts.

use tracing::debug;

/// Fixed number of consecutive failures a turn tolerates.
pub const RETRY_BUDGET: u32 = 3;

/// Decision after recording a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryVerdict {
    /// Ask the model for a corrected command; `remaining` attempts are left.
    Retry { remaining: u32 },
    /// The budget is spent; the turn must end as `FailedExhausted`.
    Exhausted,
}

/// Per-task counter of consecutive failed attempts.
///
/// Only the session mutates it, through [`record_success`](Self::record_success)
/// and [`record_failure`](Self::record_failure).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryGovernor {
    count: u32,
    cap: u32,
}

impl Default for RetryGovernor {
    fn default() -> Self {
        Self::new(RETRY_BUDGET)
    }
}

impl RetryGovernor {
    pub fn new(cap: u32) -> Self {
        Self { count: 0, cap }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn cap(&self) -> u32 {
        self.cap
    }

    pub fn is_exhausted(&self) -> bool {
        self.count >= self.cap
    }

    /// A verified round resets the streak.
    pub fn record_success(&mut self) {
        if self.count > 0 {
            debug!(previous = self.count, "retry counter reset");
        }
        self.count = 0;
    }

    pub fn record_failure(&mut self) -> RetryVerdict {
        self.count = self.count.saturating_add(1).min(self.cap);
        debug!(count = self.count, cap = self.cap, "retry counter incremented");
        if self.is_exhausted() {
            RetryVerdict::Exhausted
        } else {
            RetryVerdict::Retry {
                remaining: self.cap - self.count,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausts_on_third_consecutive_failure() {
        let mut governor = RetryGovernor::default();
        assert_eq!(
            governor.record_failure(),
            RetryVerdict::Retry { remaining: 2 }
        );
        assert_eq!(
            governor.record_failure(),
            RetryVerdict::Retry { remaining: 1 }
        );
        assert_eq!(governor.record_failure(), RetryVerdict::Exhausted);
        assert!(governor.is_exhausted());
    }

    #[test]
    fn success_after_failures_resets_to_zero() {
        for k in 0..RETRY_BUDGET {
            let mut governor = RetryGovernor::default();
            for _ in 0..k {
                governor.record_failure();
            }
            governor.record_success();
            assert_eq!(governor.count(), 0, "after {k} failures");
        }
    }

    #[test]
    fn count_never_exceeds_cap() {
        let mut governor = RetryGovernor::default();
        for _ in 0..10 {
            governor.record_failure();
        }
        assert_eq!(governor.count(), RETRY_BUDGET);
    }
}
