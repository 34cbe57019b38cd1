//! Retry policies and bounded exponential backoff.
//!
//! The delay for attempt `k` (1-indexed) is:
//!
//! ```text
//! base     = initial_delay * multiplier^(k-1)
//! capped   = min(base, max_delay)
//! jittered = capped * (1 + uniform(-jitter, +jitter))
//! ```
//!
//! Jitter comes from an injected [`Jitter`] source so tests can pin it.
//! With the default jitter of 0.2, the delay for attempt `k` always lies in
//! `[0.8 * capped, 1.2 * capped]`.

use chrono::Duration;

use crate::clock::Jitter;

/// A named retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Policy name, as referenced by the rules table.
    pub name: String,
    /// Whether errors under this policy may be retried at all.
    pub retryable: bool,
    /// Attempts charged against the policy before escalation.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Exponential growth factor per attempt.
    pub multiplier: f64,
    /// Jitter fraction, e.g. `0.2` for ±20%.
    pub jitter: f64,
}

impl RetryPolicy {
    /// The built-in default policy: retryable, 3 attempts, 1s initial,
    /// 300s cap, doubling, ±20% jitter.
    #[must_use]
    pub fn default_policy() -> Self {
        Self {
            name: "default".to_string(),
            retryable: true,
            max_retries: 3,
            initial_delay: Duration::seconds(1),
            max_delay: Duration::seconds(300),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }

    /// Computes the jittered delay for attempt `attempt` (1-indexed).
    ///
    /// Attempt 0 is treated as attempt 1.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    pub fn backoff_for_attempt(&self, attempt: u32, jitter: &dyn Jitter) -> Duration {
        let exponent = attempt.max(1) - 1;
        let initial_ms = self.initial_delay.num_milliseconds() as f64;
        let max_ms = self.max_delay.num_milliseconds() as f64;

        let base_ms = initial_ms * self.multiplier.powi(exponent_as_i32(exponent));
        let capped_ms = base_ms.min(max_ms);
        let factor = 1.0 + jitter.uniform(-self.jitter, self.jitter);
        let jittered_ms = (capped_ms * factor).max(0.0);

        Duration::milliseconds(jittered_ms.round() as i64)
    }
}

#[allow(clippy::cast_possible_wrap)]
const fn exponent_as_i32(exponent: u32) -> i32 {
    if exponent > i32::MAX as u32 {
        i32::MAX
    } else {
        exponent as i32
    }
}
