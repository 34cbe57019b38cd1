//! Retry-budget enforcement.
//!
//! Two budgets bound automated remediation:
//!
//! - per-workflow: `incident.retry_count` must stay below
//!   `max_retries_per_workflow`;
//! - per-vendor: failures recorded in the trailing hour must stay below
//!   `max_retries_per_vendor_per_hour`.
//!
//! Exceeding either never surfaces to the event caller; the coordinator
//! observes it and selects escalation instead of retry.

use std::sync::Arc;

use chrono::Duration;
use faultline_core::clock::Clock;
use faultline_core::config::FaultlineConfig;
use faultline_core::incident::Incident;
use tracing::warn;

use super::breaker::{VENDOR_FAILURE_BUDGET_WINDOW_SECS, vendor_failure_key};
use crate::cache::SharedStateCache;

/// Enforces workflow and vendor retry budgets.
pub struct RetryBudget {
    cache: Arc<dyn SharedStateCache>,
    config: Arc<FaultlineConfig>,
    clock: Arc<dyn Clock>,
}

impl RetryBudget {
    /// Creates a budget enforcer.
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

    /// Returns `true` iff the incident still has workflow retry budget.
    ///
    /// The `B_w`-th retry is permitted; the one after is not.
    #[must_use]
    pub fn permit_workflow_retry(&self, incident: &Incident) -> bool {
        incident.retry_count < self.config.safety.max_retries_per_workflow
    }

    /// Returns `true` iff the vendor's trailing-hour failure count is
    /// under budget. Cache unavailability fails closed (no permit), which
    /// pushes the coordinator toward escalation rather than more vendor
    /// traffic.
    pub async fn permit_vendor_activity(&self, vendor: &str) -> bool {
        let key = vendor_failure_key(vendor);
        let window = Duration::seconds(VENDOR_FAILURE_BUDGET_WINDOW_SECS);
        match self.cache.count_window(&key, self.clock.now(), window).await {
            Ok(count) => count < u64::from(self.config.safety.max_retries_per_vendor_per_hour),
            Err(err) => {
                warn!(vendor = %vendor, error = %err, "cache unavailable, denying vendor activity");
                false
            },
        }
    }
}
