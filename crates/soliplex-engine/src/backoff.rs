// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Exponential retry backoff with jitter.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

/// Engine-wide retry backoff: `min(cap, base * 2^(k-1))` with uniform
/// jitter, never exceeding the cap.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Ceiling on any produced delay.
    pub cap: Duration,
    /// Uniform jitter fraction; 0.2 means +-20%.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            cap: Duration::from_secs(600),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Create a policy with the default +-20% jitter.
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            jitter: 0.2,
        }
    }

    /// Delay before retry attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        let exp = self
            .base
            .saturating_mul(multiplier)
            .min(self.cap)
            .as_secs_f64();

        let factor = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter)
        } else {
            1.0
        };

        Duration::from_secs_f64(exp * factor).min(self.cap)
    }

    /// Earliest instant retry attempt `attempt` may be claimed.
    pub fn not_before(&self, now: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
        let delay = self.delay_for_attempt(attempt);
        now + chrono::Duration::milliseconds(delay.as_millis() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(5),
            cap: Duration::from_secs(600),
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(20));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(40));
    }

    #[test]
    fn test_backoff_caps() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(5),
            cap: Duration::from_secs(600),
            jitter: 0.0,
        };
        // 5 * 2^9 = 2560s, clamped.
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(600));
        // Saturating exponent far past any real retry budget.
        assert_eq!(policy.delay_for_attempt(64), Duration::from_secs(600));
    }

    #[test]
    fn test_jitter_stays_in_window_and_under_cap() {
        let policy = BackoffPolicy::default();
        for attempt in 1..12 {
            let expected = policy
                .base
                .saturating_mul(2u32.saturating_pow(attempt - 1))
                .min(policy.cap)
                .as_secs_f64();
            for _ in 0..50 {
                let delay = policy.delay_for_attempt(attempt);
                assert!(delay <= policy.cap, "attempt {} exceeded cap", attempt);
                assert!(
                    delay.as_secs_f64() >= expected * (1.0 - policy.jitter) - 1e-6,
                    "attempt {} fell below the jitter window",
                    attempt
                );
                assert!(
                    delay.as_secs_f64() <= expected * (1.0 + policy.jitter) + 1e-6,
                    "attempt {} rose above the jitter window",
                    attempt
                );
            }
        }
    }

    #[test]
    fn test_not_before_is_in_the_future() {
        let policy = BackoffPolicy::default();
        let now = Utc::now();
        let gate = policy.not_before(now, 1);
        assert!(gate > now);
    }
}
