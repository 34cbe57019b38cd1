//! Circuit breaker state machine for vendor protection.
//!
//! Pure transition logic over an explicit [`BreakerSnapshot`]; the snapshot
//! itself is held in the shared-state cache (and mirrored to the vendor row
//! for restart recovery) by the daemon.
//!
//! States and transitions:
//!
//! | From | Condition | To |
//! |------|-----------|----|
//! | `Closed` | `failure_count >= failure_threshold` within the rolling window | `Open` |
//! | `Open` | `now - opened_at >= cooldown` | `HalfOpen` |
//! | `HalfOpen` | one probe succeeds | `Closed` (counters reset) |
//! | `HalfOpen` | one probe fails | `Open` (`opened_at` reset) |
//!
//! # Invariants
//!
//! - [INV-CB001] After a transition to `Open`, admission is rejected for at
//!   least `cooldown`.
//! - [INV-CB002] At most `probe_cap` probes are in flight in `HalfOpen`; the
//!   next permit is granted only after a prior probe resolves.
//! - [INV-CB003] Isolated historical failures do not accumulate: the failure
//!   count decays when the rolling window passes without failures.
//!
//! The transition `Open -> HalfOpen` happens exactly at
//! `now - opened_at = cooldown`, not before.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Configuration
// =============================================================================

/// Per-vendor breaker configuration.
///
/// Built from the vendor configuration table at startup; durations arrive
/// already converted from their config-file second counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive-window failures that trip the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays `Open` before probing.
    pub cooldown: Duration,
    /// Maximum concurrent probes in `HalfOpen`.
    pub probe_cap: u32,
    /// Rolling window over which failures are counted.
    pub failure_window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            cooldown: Duration::seconds(300),
            probe_cap: 1,
            failure_window: Duration::seconds(300),
        }
    }
}

// =============================================================================
// State
// =============================================================================

/// The three breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    /// Normal operation.
    Closed,
    /// Shedding load after a failure burst.
    Open,
    /// Testing recovery with a bounded number of probes.
    HalfOpen,
}

impl BreakerState {
    /// Storage identifier for the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }

    /// Parses a storage identifier.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "CLOSED" => Some(Self::Closed),
            "OPEN" => Some(Self::Open),
            "HALF_OPEN" => Some(Self::HalfOpen),
            _ => None,
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker is closed; traffic flows.
    Allow,
    /// Breaker is half-open; this request is admitted as a probe. The
    /// caller must later report the probe outcome via
    /// [`BreakerSnapshot::probe_resolved`].
    Probe,
    /// Breaker is open (or probe slots are exhausted); shed the request.
    Reject {
        /// Hint: when the caller may try again.
        retry_in: Duration,
    },
}

/// Mutable breaker state for one vendor.
///
/// The snapshot is the unit of exchange with the shared-state cache:
/// load, transition, store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    /// Current state.
    pub state: BreakerState,
    /// Failures recorded within the rolling window.
    pub failure_count: u32,
    /// When the breaker last transitioned to `Open`.
    pub opened_at: Option<DateTime<Utc>>,
    /// When the last failure was recorded (window decay anchor).
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Probes currently in flight while `HalfOpen`.
    pub probes_in_flight: u32,
}

impl BreakerSnapshot {
    /// A fresh, closed breaker.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            opened_at: None,
            last_failure_at: None,
            probes_in_flight: 0,
        }
    }

    /// Checks admission at `now`, applying the `Open -> HalfOpen` cooldown
    /// transition if due. A [`Admission::Probe`] result reserves one probe
    /// slot.
    pub fn admit(&mut self, config: &BreakerConfig, now: DateTime<Utc>) -> Admission {
        match self.state {
            BreakerState::Closed => Admission::Allow,
            BreakerState::Open => {
                let opened_at = self.opened_at.unwrap_or(now);
                let elapsed = now - opened_at;
                if elapsed >= config.cooldown {
                    self.state = BreakerState::HalfOpen;
                    self.probes_in_flight = 0;
                    self.take_probe_slot(config)
                } else {
                    Admission::Reject {
                        retry_in: config.cooldown - elapsed,
                    }
                }
            },
            BreakerState::HalfOpen => self.take_probe_slot(config),
        }
    }

    fn take_probe_slot(&mut self, config: &BreakerConfig) -> Admission {
        if self.probes_in_flight < config.probe_cap {
            self.probes_in_flight += 1;
            Admission::Probe
        } else {
            Admission::Reject {
                retry_in: Duration::seconds(1),
            }
        }
    }

    /// Records a failure observed outside a probe (normal `Closed` traffic).
    ///
    /// Returns the state after the transition.
    pub fn record_failure(&mut self, config: &BreakerConfig, now: DateTime<Utc>) -> BreakerState {
        self.decay(config, now);
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure_at = Some(now);

        if self.state == BreakerState::Closed && self.failure_count >= config.failure_threshold {
            self.trip(now);
        }
        self.state
    }

    /// Records a success observed outside a probe.
    ///
    /// In `Closed`, successes clear the failure count so a slow trickle of
    /// isolated failures never trips the breaker.
    pub fn record_success(&mut self, _config: &BreakerConfig, _now: DateTime<Utc>) -> BreakerState {
        if self.state == BreakerState::Closed {
            self.failure_count = 0;
        }
        self.state
    }

    /// Resolves one in-flight probe.
    ///
    /// Success closes the breaker and resets counters; failure re-opens it
    /// with a fresh `opened_at`.
    pub fn probe_resolved(
        &mut self,
        success: bool,
        _config: &BreakerConfig,
        now: DateTime<Utc>,
    ) -> BreakerState {
        self.probes_in_flight = self.probes_in_flight.saturating_sub(1);
        if self.state != BreakerState::HalfOpen {
            return self.state;
        }
        if success {
            self.state = BreakerState::Closed;
            self.failure_count = 0;
            self.opened_at = None;
            self.probes_in_flight = 0;
        } else {
            self.failure_count = self.failure_count.saturating_add(1);
            self.last_failure_at = Some(now);
            self.trip(now);
        }
        self.state
    }

    /// Releases a probe slot without an outcome (the probed request was
    /// never actually sent, e.g. it deduplicated away). State is
    /// untouched; only the slot frees up.
    pub fn probe_abandoned(&mut self) {
        self.probes_in_flight = self.probes_in_flight.saturating_sub(1);
    }

    fn trip(&mut self, now: DateTime<Utc>) {
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
        self.probes_in_flight = 0;
    }

    fn decay(&mut self, config: &BreakerConfig, now: DateTime<Utc>) {
        if let Some(last) = self.last_failure_at {
            if now - last >= config.failure_window {
                self.failure_count = 0;
            }
        }
    }
}

impl Default for BreakerSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            cooldown: Duration::seconds(60),
            probe_cap: 1,
            failure_window: Duration::seconds(300),
        }
    }

    #[test]
    fn trips_open_at_threshold() {
        let cfg = config();
        let mut snap = BreakerSnapshot::new();
        assert_eq!(snap.record_failure(&cfg, t0()), BreakerState::Closed);
        assert_eq!(snap.record_failure(&cfg, t0()), BreakerState::Closed);
        assert_eq!(snap.record_failure(&cfg, t0()), BreakerState::Open);
        assert_eq!(snap.opened_at, Some(t0()));
    }

    #[test]
    fn open_rejects_until_cooldown() {
        let cfg = config();
        let mut snap = BreakerSnapshot::new();
        for _ in 0..3 {
            snap.record_failure(&cfg, t0());
        }

        let just_before = t0() + Duration::seconds(59);
        assert!(matches!(
            snap.admit(&cfg, just_before),
            Admission::Reject { .. }
        ));
        // the reject hint counts down to the cooldown boundary
        if let Admission::Reject { retry_in } = snap.admit(&cfg, just_before) {
            assert_eq!(retry_in, Duration::seconds(1));
        }
    }

    #[test]
    fn transitions_half_open_exactly_at_cooldown() {
        let cfg = config();
        let mut snap = BreakerSnapshot::new();
        for _ in 0..3 {
            snap.record_failure(&cfg, t0());
        }

        let at_boundary = t0() + Duration::seconds(60);
        assert_eq!(snap.admit(&cfg, at_boundary), Admission::Probe);
        assert_eq!(snap.state, BreakerState::HalfOpen);
    }

    #[test]
    fn probe_success_closes_and_resets() {
        let cfg = config();
        let mut snap = BreakerSnapshot::new();
        for _ in 0..3 {
            snap.record_failure(&cfg, t0());
        }
        let probe_at = t0() + Duration::seconds(61);
        assert_eq!(snap.admit(&cfg, probe_at), Admission::Probe);

        assert_eq!(
            snap.probe_resolved(true, &cfg, probe_at),
            BreakerState::Closed
        );
        assert_eq!(snap.failure_count, 0);
        assert_eq!(snap.opened_at, None);
    }

    #[test]
    fn probe_failure_reopens_with_fresh_cooldown() {
        let cfg = config();
        let mut snap = BreakerSnapshot::new();
        for _ in 0..3 {
            snap.record_failure(&cfg, t0());
        }
        let probe_at = t0() + Duration::seconds(61);
        assert_eq!(snap.admit(&cfg, probe_at), Admission::Probe);
        assert_eq!(
            snap.probe_resolved(false, &cfg, probe_at),
            BreakerState::Open
        );
        assert_eq!(snap.opened_at, Some(probe_at));

        // rejected again for a full cooldown from the probe failure
        let later = probe_at + Duration::seconds(59);
        assert!(matches!(snap.admit(&cfg, later), Admission::Reject { .. }));
    }

    #[test]
    fn probe_cap_bounds_concurrent_probes() {
        let cfg = BreakerConfig {
            probe_cap: 2,
            ..config()
        };
        let mut snap = BreakerSnapshot::new();
        for _ in 0..3 {
            snap.record_failure(&cfg, t0());
        }
        let probe_at = t0() + Duration::seconds(60);
        assert_eq!(snap.admit(&cfg, probe_at), Admission::Probe);
        assert_eq!(snap.admit(&cfg, probe_at), Admission::Probe);
        assert!(matches!(
            snap.admit(&cfg, probe_at),
            Admission::Reject { .. }
        ));

        // a resolved probe frees a slot
        snap.probe_resolved(true, &cfg, probe_at);
        assert_eq!(snap.state, BreakerState::Closed);
    }

    #[test]
    fn abandoned_probe_frees_the_slot_without_transition() {
        let cfg = config();
        let mut snap = BreakerSnapshot::new();
        for _ in 0..3 {
            snap.record_failure(&cfg, t0());
        }
        let probe_at = t0() + Duration::seconds(60);
        assert_eq!(snap.admit(&cfg, probe_at), Admission::Probe);
        assert!(matches!(
            snap.admit(&cfg, probe_at),
            Admission::Reject { .. }
        ));

        snap.probe_abandoned();
        assert_eq!(snap.state, BreakerState::HalfOpen);
        // the freed slot admits the next probe
        assert_eq!(snap.admit(&cfg, probe_at), Admission::Probe);
    }

    #[test]
    fn stale_failures_decay_out_of_the_window() {
        let cfg = config();
        let mut snap = BreakerSnapshot::new();
        snap.record_failure(&cfg, t0());
        snap.record_failure(&cfg, t0());

        // well past the rolling window: the stale count is forgotten
        let much_later = t0() + Duration::seconds(600);
        assert_eq!(snap.record_failure(&cfg, much_later), BreakerState::Closed);
        assert_eq!(snap.failure_count, 1);
    }

    #[test]
    fn success_in_closed_clears_the_count() {
        let cfg = config();
        let mut snap = BreakerSnapshot::new();
        snap.record_failure(&cfg, t0());
        snap.record_failure(&cfg, t0());
        snap.record_success(&cfg, t0());
        assert_eq!(snap.failure_count, 0);
        // the next failure starts counting from scratch
        assert_eq!(snap.record_failure(&cfg, t0()), BreakerState::Closed);
    }

    #[test]
    fn state_round_trips_through_storage_form() {
        for state in [
            BreakerState::Closed,
            BreakerState::Open,
            BreakerState::HalfOpen,
        ] {
            assert_eq!(BreakerState::parse(state.as_str()), Some(state));
        }
    }
}
