//! Sliding-window admission math.
//!
//! For a key with window `W` and limit `L`, a request at time `t` is
//! admitted iff the count of admitted requests in `(t - W, t]` is below
//! `L`. Entries older than `t - W` are evicted lazily at check time, so
//! memory per key is bounded by `L`.
//!
//! This module holds only the per-key window state; keying and cross-
//! instance sharing live in the daemon's shared-state cache.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

/// Outcome of a rate-limit admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    /// Whether the request was admitted (and recorded).
    pub allowed: bool,
    /// Admissions remaining in the current window after this decision.
    pub remaining: u32,
    /// When a rejected caller may try again.
    pub retry_after: Option<Duration>,
}

/// Recorded admissions for one rate-limit key.
#[derive(Debug, Clone, Default)]
pub struct SlidingWindow {
    entries: VecDeque<DateTime<Utc>>,
}

impl SlidingWindow {
    /// An empty window.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Number of admissions currently recorded (including expired entries
    /// not yet evicted).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no admissions are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Checks and, if admitted, records a request at `now`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn admit(&mut self, now: DateTime<Utc>, window: Duration, limit: u32) -> RateDecision {
        self.evict(now, window);

        let in_window = self.entries.len() as u64;
        if in_window < u64::from(limit) {
            self.entries.push_back(now);
            RateDecision {
                allowed: true,
                remaining: limit.saturating_sub(in_window as u32 + 1),
                retry_after: None,
            }
        } else {
            // the window frees up when its oldest entry ages out
            let retry_after = self
                .entries
                .front()
                .map(|oldest| (*oldest + window) - now)
                .filter(|d| *d > Duration::zero())
                .unwrap_or_else(|| Duration::seconds(1));
            RateDecision {
                allowed: false,
                remaining: 0,
                retry_after: Some(retry_after),
            }
        }
    }

    /// Records an occurrence without an admission check.
    ///
    /// Used for budget counters (e.g. vendor failures per hour) where every
    /// occurrence counts and the question is asked separately.
    pub fn record(&mut self, now: DateTime<Utc>, window: Duration) {
        self.evict(now, window);
        self.entries.push_back(now);
    }

    /// Counts entries inside `(now - window, now]`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn count(&mut self, now: DateTime<Utc>, window: Duration) -> u64 {
        self.evict(now, window);
        self.entries.len() as u64
    }

    fn evict(&mut self, now: DateTime<Utc>, window: Duration) {
        let cutoff = now - window;
        while self
            .entries
            .front()
            .is_some_and(|entry| *entry <= cutoff)
        {
            self.entries.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn window() -> Duration {
        Duration::seconds(60)
    }

    #[test]
    fn admits_up_to_limit_in_window() {
        let mut win = SlidingWindow::new();
        for i in 0..5 {
            let decision = win.admit(t0(), window(), 5);
            assert!(decision.allowed, "admission {i} should pass");
        }
        let decision = win.admit(t0(), window(), 5);
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[test]
    fn remaining_counts_down() {
        let mut win = SlidingWindow::new();
        assert_eq!(win.admit(t0(), window(), 3).remaining, 2);
        assert_eq!(win.admit(t0(), window(), 3).remaining, 1);
        assert_eq!(win.admit(t0(), window(), 3).remaining, 0);
    }

    #[test]
    fn entries_age_out_of_the_window() {
        let mut win = SlidingWindow::new();
        for _ in 0..3 {
            assert!(win.admit(t0(), window(), 3).allowed);
        }
        assert!(!win.admit(t0(), window(), 3).allowed);

        // exactly one window later, the slate is clean
        let later = t0() + window() + Duration::seconds(1);
        assert!(win.admit(later, window(), 3).allowed);
        assert_eq!(win.len(), 1);
    }

    #[test]
    fn no_window_interval_exceeds_the_limit() {
        // admissions spread over time: any 60s interval holds at most L
        let mut win = SlidingWindow::new();
        let mut admitted: Vec<DateTime<Utc>> = Vec::new();
        for step in 0..240 {
            let now = t0() + Duration::seconds(step);
            if win.admit(now, window(), 10).allowed {
                admitted.push(now);
            }
        }
        for anchor in &admitted {
            let upper = *anchor;
            let lower = upper - window();
            let in_interval = admitted
                .iter()
                .filter(|t| **t > lower && **t <= upper)
                .count();
            assert!(in_interval <= 10, "interval ending {upper} holds {in_interval}");
        }
    }

    #[test]
    fn retry_after_points_at_oldest_entry_expiry() {
        let mut win = SlidingWindow::new();
        assert!(win.admit(t0(), window(), 1).allowed);

        let at = t0() + Duration::seconds(20);
        let decision = win.admit(at, window(), 1);
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after, Some(Duration::seconds(40)));
    }

    #[test]
    fn record_and_count_for_budget_windows() {
        let mut win = SlidingWindow::new();
        let hour = Duration::hours(1);
        win.record(t0(), hour);
        win.record(t0() + Duration::minutes(10), hour);
        win.record(t0() + Duration::minutes(50), hour);

        assert_eq!(win.count(t0() + Duration::minutes(55), hour), 3);
        // the first record ages out after an hour
        assert_eq!(win.count(t0() + Duration::minutes(61), hour), 2);
    }

    #[test]
    fn memory_stays_bounded_by_limit() {
        let mut win = SlidingWindow::new();
        for step in 0..10_000 {
            let now = t0() + Duration::milliseconds(step * 10);
            let _ = win.admit(now, window(), 50);
        }
        assert!(win.len() <= 50);
    }
}
