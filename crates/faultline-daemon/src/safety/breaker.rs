//! Per-vendor circuit breaker manager.
//!
//! The pure transition math lives in `faultline_core::breaker`; this
//! manager is the load / transition / store loop around the shared-state
//! cache, with a durable mirror on the vendor row so restarts do not
//! forget a tripped breaker.
//!
//! Failure recording here also feeds the vendor failure-budget window, so
//! there is exactly one place vendor failures are counted.

use std::sync::Arc;

use chrono::Duration;
use faultline_core::breaker::{Admission, BreakerConfig, BreakerSnapshot, BreakerState};
use faultline_core::clock::Clock;
use faultline_core::config::FaultlineConfig;
use tracing::{debug, warn};

use crate::cache::{CacheError, SharedStateCache};
use crate::store::AdminStore;

/// Window over which vendor failures count against the hourly budget.
pub const VENDOR_FAILURE_BUDGET_WINDOW_SECS: i64 = 3600;

/// Key prefix for vendor failure-budget windows.
pub(crate) fn vendor_failure_key(vendor: &str) -> String {
    format!("budget:vendor_failures:{vendor}")
}

/// Outcome of a breaker admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerCheck {
    /// The admission decision.
    pub admission: Admission,
    /// Set when the cache was unavailable and the fail-closed path was
    /// taken.
    pub degraded: bool,
}

/// Manages breaker state for every vendor.
pub struct BreakerManager {
    cache: Arc<dyn SharedStateCache>,
    admin: AdminStore,
    config: Arc<FaultlineConfig>,
    clock: Arc<dyn Clock>,
}

impl BreakerManager {
    /// Creates a manager over the shared cache and admin store.
    #[must_use]
    pub fn new(
        cache: Arc<dyn SharedStateCache>,
        admin: AdminStore,
        config: Arc<FaultlineConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cache,
            admin,
            config,
            clock,
        }
    }

    fn breaker_config(&self, vendor: &str) -> BreakerConfig {
        self.config.breaker_config(vendor)
    }

    /// Checks admission for a vendor.
    ///
    /// Cache unavailability fails closed: the vendor is treated as `Open`
    /// for a full cooldown. A [`Admission::Probe`] result reserves a probe
    /// slot that MUST be resolved via [`Self::probe_resolved`].
    pub async fn check(&self, vendor: &str) -> BreakerCheck {
        let cfg = self.breaker_config(vendor);
        let now = self.clock.now();

        let mut snapshot = match self.load(vendor).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(vendor = %vendor, error = %err, "cache unavailable, breaker failing closed");
                return BreakerCheck {
                    admission: Admission::Reject {
                        retry_in: cfg.cooldown,
                    },
                    degraded: true,
                };
            },
        };

        let before = snapshot.state;
        let admission = snapshot.admit(&cfg, now);
        self.persist(vendor, snapshot, before).await;

        debug!(vendor = %vendor, admission = ?admission, "breaker check");
        BreakerCheck {
            admission,
            degraded: false,
        }
    }

    /// Records a vendor failure observed on normal (non-probe) traffic.
    ///
    /// Returns the breaker state after the transition.
    pub async fn record_failure(&self, vendor: &str) -> BreakerState {
        let cfg = self.breaker_config(vendor);
        let now = self.clock.now();
        self.note_budget_failure(vendor).await;

        let Ok(mut snapshot) = self.load(vendor).await else {
            return BreakerState::Open;
        };
        let before = snapshot.state;
        let state = snapshot.record_failure(&cfg, now);
        if state == BreakerState::Open && before != BreakerState::Open {
            warn!(
                vendor = %vendor,
                failure_count = snapshot.failure_count,
                "circuit breaker opened"
            );
        }
        self.persist(vendor, snapshot, before).await;
        state
    }

    /// Records a vendor success observed on normal (non-probe) traffic.
    pub async fn record_success(&self, vendor: &str) -> BreakerState {
        let cfg = self.breaker_config(vendor);
        let now = self.clock.now();

        let Ok(mut snapshot) = self.load(vendor).await else {
            return BreakerState::Open;
        };
        let before = snapshot.state;
        let state = snapshot.record_success(&cfg, now);
        self.persist(vendor, snapshot, before).await;
        state
    }

    /// Resolves an in-flight probe.
    pub async fn probe_resolved(&self, vendor: &str, success: bool) -> BreakerState {
        let cfg = self.breaker_config(vendor);
        let now = self.clock.now();
        if !success {
            self.note_budget_failure(vendor).await;
        }

        let Ok(mut snapshot) = self.load(vendor).await else {
            return BreakerState::Open;
        };
        let before = snapshot.state;
        let state = snapshot.probe_resolved(success, &cfg, now);
        if state == BreakerState::Closed && before != BreakerState::Closed {
            debug!(vendor = %vendor, "circuit breaker closed after successful probe");
        }
        self.persist(vendor, snapshot, before).await;
        state
    }

    /// Releases a reserved probe slot whose request was never sent
    /// (e.g. the submission deduplicated away). No state transition.
    pub async fn probe_abandoned(&self, vendor: &str) {
        let Ok(mut snapshot) = self.load(vendor).await else {
            return;
        };
        let before = snapshot.state;
        snapshot.probe_abandoned();
        self.persist(vendor, snapshot, before).await;
    }

    /// Current state without side effects (for metrics and operators).
    pub async fn state(&self, vendor: &str) -> BreakerState {
        self.load(vendor)
            .await
            .map_or(BreakerState::Open, |snapshot| snapshot.state)
    }

    async fn load(&self, vendor: &str) -> Result<BreakerSnapshot, CacheError> {
        if let Some(snapshot) = self.cache.load_breaker(vendor).await? {
            return Ok(snapshot);
        }
        // cold cache: seed from the durable mirror so restarts keep a
        // tripped breaker tripped
        let mirror = self.admin.load_breaker_mirror(vendor).unwrap_or_default();
        Ok(mirror)
    }

    async fn persist(&self, vendor: &str, snapshot: BreakerSnapshot, before: BreakerState) {
        let state_changed = snapshot.state != before;
        if let Err(err) = self.cache.store_breaker(vendor, snapshot.clone()).await {
            warn!(vendor = %vendor, error = %err, "failed to store breaker snapshot");
        }
        if state_changed {
            if let Err(err) = self.admin.save_breaker_mirror(vendor, &snapshot) {
                warn!(vendor = %vendor, error = %err, "failed to mirror breaker state");
            }
        }
    }

    async fn note_budget_failure(&self, vendor: &str) {
        let key = vendor_failure_key(vendor);
        let window = Duration::seconds(VENDOR_FAILURE_BUDGET_WINDOW_SECS);
        if let Err(err) = self
            .cache
            .record_window(&key, self.clock.now(), window)
            .await
        {
            warn!(vendor = %vendor, error = %err, "failed to record vendor failure budget");
        }
    }
}
