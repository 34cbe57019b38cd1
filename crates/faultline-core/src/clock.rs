//! Injected time and randomness sources.
//!
//! Every time- or randomness-dependent computation in the system receives
//! these as explicit handles rather than reaching for ambient state, so
//! tests can pin both.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync {
    /// Returns the current instant in UTC.
    fn now(&self) -> DateTime<Utc>;
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A manually advanced clock for tests.
///
/// Starts at a fixed instant and only moves when told to. Shared freely via
/// `Arc`; interior mutability keeps `advance` callable through a shared
/// reference.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Creates a clock pinned at `start`.
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Moves the clock forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock().expect("clock mutex poisoned");
        *now = *now + delta;
    }

    /// Pins the clock to an absolute instant.
    pub fn set(&self, instant: DateTime<Utc>) {
        let mut now = self.now.lock().expect("clock mutex poisoned");
        *now = instant;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock mutex poisoned")
    }
}

/// Source of uniform random draws for backoff jitter and poll smearing.
pub trait Jitter: Send + Sync {
    /// Returns a uniform draw from `[lo, hi]`.
    fn uniform(&self, lo: f64, hi: f64) -> f64;
}

/// Thread-local RNG backed jitter source.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRngJitter;

impl Jitter for ThreadRngJitter {
    fn uniform(&self, lo: f64, hi: f64) -> f64 {
        if lo >= hi {
            return lo;
        }
        rand::thread_rng().gen_range(lo..=hi)
    }
}

/// Jitter source that always returns the same factor, clamped into range.
///
/// Tests use this to make backoff delays exact.
#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(pub f64);

impl Jitter for FixedJitter {
    fn uniform(&self, lo: f64, hi: f64) -> f64 {
        self.0.clamp(lo, hi)
    }
}
