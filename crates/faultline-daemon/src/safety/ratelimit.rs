//! Sliding-window rate limiter keyed by tenant, tenant+vendor, or
//! workflow.
//!
//! When the shared-state cache is unavailable the limiter fails open:
//! requests are admitted, the outcome is flagged degraded, and the
//! pipeline records it. That is a deliberate trade biasing toward ingest
//! availability; vendor protection is the breaker's job and fails closed.

use std::sync::Arc;

use chrono::Duration;
use faultline_core::clock::Clock;
use faultline_core::config::FaultlineConfig;
use faultline_core::ratelimit::RateDecision;
use tracing::warn;

use crate::cache::SharedStateCache;

/// The admission window: one minute.
const WINDOW_SECS: i64 = 60;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateOutcome {
    /// The admission decision.
    pub decision: RateDecision,
    /// Set when the cache was unavailable and the fail-open path was
    /// taken.
    pub degraded: bool,
}

/// Sliding-window rate limiter over the shared-state cache.
pub struct RateLimiter {
    cache: Arc<dyn SharedStateCache>,
    config: Arc<FaultlineConfig>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Creates a limiter over the shared cache.
    #[must_use]
    pub fn new(
        cache: Arc<dyn SharedStateCache>,
        config: Arc<FaultlineConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cache,
            config,
            clock,
        }
    }

    /// Admission check on the tenant key.
    pub async fn admit_tenant(&self, tenant_id: &str) -> RateOutcome {
        let limit = self.config.pipeline.tenant_rate_limit_per_minute;
        self.admit(&format!("rl:tenant:{tenant_id}"), limit).await
    }

    /// Admission check on the tenant+vendor key.
    pub async fn admit_tenant_vendor(&self, tenant_id: &str, vendor: &str) -> RateOutcome {
        let limit = self.config.vendor_rate_limit(vendor);
        self.admit(&format!("rl:tenant_vendor:{tenant_id}:{vendor}"), limit)
            .await
    }

    /// Admission check on the workflow key (remediation replays).
    pub async fn admit_workflow(&self, workflow_id: &str) -> RateOutcome {
        let limit = self.config.pipeline.tenant_rate_limit_per_minute;
        self.admit(&format!("rl:workflow:{workflow_id}"), limit).await
    }

    async fn admit(&self, key: &str, limit: u32) -> RateOutcome {
        let now = self.clock.now();
        match self
            .cache
            .admit_window(key, now, Duration::seconds(WINDOW_SECS), limit)
            .await
        {
            Ok(decision) => RateOutcome {
                decision,
                degraded: false,
            },
            Err(err) => {
                warn!(key = %key, error = %err, "cache unavailable, rate limiter failing open");
                RateOutcome {
                    decision: RateDecision {
                        allowed: true,
                        remaining: limit,
                        retry_after: None,
                    },
                    degraded: true,
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use faultline_core::clock::ManualClock;
    use faultline_core::config::{VendorConfig, VendorRateLimitConfig};

    use super::*;
    use crate::cache::{FlakyCache, InMemoryCache};

    fn limiter(cache: Arc<dyn SharedStateCache>) -> (RateLimiter, Arc<ManualClock>) {
        let mut config = FaultlineConfig::default();
        config.pipeline.tenant_rate_limit_per_minute = 3;
        config.vendors.insert(
            "stripe".to_string(),
            VendorConfig {
                rate_limit: VendorRateLimitConfig { per_minute: 2 },
                ..VendorConfig::default()
            },
        );
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        ));
        (
            RateLimiter::new(cache, Arc::new(config), clock.clone()),
            clock,
        )
    }

    #[tokio::test]
    async fn tenant_key_enforces_the_tenant_limit() {
        let (limiter, _clock) = limiter(Arc::new(InMemoryCache::new()));

        for _ in 0..3 {
            assert!(limiter.admit_tenant("t1").await.decision.allowed);
        }
        let outcome = limiter.admit_tenant("t1").await;
        assert!(!outcome.decision.allowed);
        assert!(outcome.decision.retry_after.is_some());

        // other tenants are unaffected
        assert!(limiter.admit_tenant("t2").await.decision.allowed);
    }

    #[tokio::test]
    async fn vendor_key_is_separate_and_tighter() {
        let (limiter, _clock) = limiter(Arc::new(InMemoryCache::new()));

        assert!(limiter.admit_tenant_vendor("t1", "stripe").await.decision.allowed);
        assert!(limiter.admit_tenant_vendor("t1", "stripe").await.decision.allowed);
        assert!(!limiter.admit_tenant_vendor("t1", "stripe").await.decision.allowed);

        // unconfigured vendors fall back to the default per-minute limit
        assert!(limiter.admit_tenant_vendor("t1", "other").await.decision.allowed);
    }

    #[tokio::test]
    async fn window_rolls_over_with_the_clock() {
        let (limiter, clock) = limiter(Arc::new(InMemoryCache::new()));
        for _ in 0..3 {
            assert!(limiter.admit_tenant("t1").await.decision.allowed);
        }
        assert!(!limiter.admit_tenant("t1").await.decision.allowed);

        clock.advance(Duration::seconds(61));
        assert!(limiter.admit_tenant("t1").await.decision.allowed);
    }

    #[tokio::test]
    async fn cache_loss_fails_open_with_degraded_flag() {
        let flaky = Arc::new(FlakyCache::new(InMemoryCache::new()));
        let (limiter, _clock) = limiter(flaky.clone());

        flaky.set_unavailable(true);
        let outcome = limiter.admit_tenant("t1").await;
        assert!(outcome.decision.allowed);
        assert!(outcome.degraded);
    }
}
