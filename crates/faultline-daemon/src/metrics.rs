//! Prometheus metrics for daemon health observability.
//!
//! # Metrics Families
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `faultline_events_ingested_total` | Counter | `outcome` |
//! | `faultline_rejections_total` | Counter | `code` |
//! | `faultline_actions_total` | Counter | `kind`, `status` |
//! | `faultline_degraded_mode_total` | Counter | `component` |
//! | `faultline_incidents_open` | Gauge | |
//! | `faultline_breaker_state` | Gauge | `vendor` (0=closed, 1=half-open, 2=open) |
//! | `faultline_detection_lag_seconds` | Histogram | |
//!
//! The registry is exported in Prometheus text format by the daemon's
//! `/metrics` endpoint (localhost only).

use std::sync::Arc;

use faultline_core::breaker::BreakerState;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use thiserror::Error;

/// Histogram buckets for detection lag (seconds from receipt to grouping).
pub const DETECTION_LAG_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Failed to register a metric with Prometheus.
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Failed to encode metrics output.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Daemon metrics families.
///
/// All metrics use interior mutability and are safe to share across
/// tasks; the struct is `Clone`, `Send`, and `Sync`.
#[derive(Clone)]
pub struct FaultlineMetrics {
    events_ingested_total: IntCounterVec,
    rejections_total: IntCounterVec,
    actions_total: IntCounterVec,
    degraded_mode_total: IntCounterVec,
    incidents_open: IntGauge,
    breaker_state: IntGaugeVec,
    detection_lag: Histogram,
}

impl FaultlineMetrics {
    /// Creates the metric families and registers them with `registry`.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::RegistrationFailed`] on duplicate names.
    pub fn new(registry: &Registry) -> Result<Self, MetricsError> {
        let events_ingested_total = IntCounterVec::new(
            Opts::new(
                "faultline_events_ingested_total",
                "Events accepted by the ingestion pipeline",
            ),
            &["outcome"],
        )?;
        let rejections_total = IntCounterVec::new(
            Opts::new(
                "faultline_rejections_total",
                "Ingestion rejections by rejection code",
            ),
            &["code"],
        )?;
        let actions_total = IntCounterVec::new(
            Opts::new(
                "faultline_actions_total",
                "Remediation actions by kind and terminal status",
            ),
            &["kind", "status"],
        )?;
        let degraded_mode_total = IntCounterVec::new(
            Opts::new(
                "faultline_degraded_mode_total",
                "Times a safety component ran in degraded mode",
            ),
            &["component"],
        )?;
        let incidents_open = IntGauge::new(
            "faultline_incidents_open",
            "Incidents currently in a non-terminal status",
        )?;
        let breaker_state = IntGaugeVec::new(
            Opts::new(
                "faultline_breaker_state",
                "Breaker state per vendor (0=closed, 1=half-open, 2=open)",
            ),
            &["vendor"],
        )?;
        let detection_lag = Histogram::with_opts(
            HistogramOpts::new(
                "faultline_detection_lag_seconds",
                "Lag between event receipt and incident grouping",
            )
            .buckets(DETECTION_LAG_BUCKETS.to_vec()),
        )?;

        registry.register(Box::new(events_ingested_total.clone()))?;
        registry.register(Box::new(rejections_total.clone()))?;
        registry.register(Box::new(actions_total.clone()))?;
        registry.register(Box::new(degraded_mode_total.clone()))?;
        registry.register(Box::new(incidents_open.clone()))?;
        registry.register(Box::new(breaker_state.clone()))?;
        registry.register(Box::new(detection_lag.clone()))?;

        Ok(Self {
            events_ingested_total,
            rejections_total,
            actions_total,
            degraded_mode_total,
            incidents_open,
            breaker_state,
            detection_lag,
        })
    }

    /// Records an accepted or duplicate ingestion.
    pub fn event_ingested(&self, outcome: &str) {
        self.events_ingested_total
            .with_label_values(&[outcome])
            .inc();
    }

    /// Records an ingestion rejection.
    pub fn rejection(&self, code: &str) {
        self.rejections_total.with_label_values(&[code]).inc();
    }

    /// Records an action reaching a terminal status.
    pub fn action_completed(&self, kind: &str, status: &str) {
        self.actions_total.with_label_values(&[kind, status]).inc();
    }

    /// Records a degraded-mode activation for a safety component.
    pub fn degraded(&self, component: &str) {
        self.degraded_mode_total
            .with_label_values(&[component])
            .inc();
    }

    /// Updates the open-incident gauge.
    #[allow(clippy::cast_possible_wrap)]
    pub fn set_incidents_open(&self, count: u64) {
        self.incidents_open.set(count.min(i64::MAX as u64) as i64);
    }

    /// Updates a vendor's breaker-state gauge.
    pub fn set_breaker_state(&self, vendor: &str, state: BreakerState) {
        let value = match state {
            BreakerState::Closed => 0,
            BreakerState::HalfOpen => 1,
            BreakerState::Open => 2,
        };
        self.breaker_state.with_label_values(&[vendor]).set(value);
    }

    /// Observes the receipt-to-grouping lag for one event.
    pub fn observe_detection_lag(&self, seconds: f64) {
        self.detection_lag.observe(seconds.max(0.0));
    }
}

impl std::fmt::Debug for FaultlineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultlineMetrics").finish_non_exhaustive()
    }
}

/// Registry plus its metric families.
pub struct MetricsRegistry {
    registry: Registry,
    metrics: FaultlineMetrics,
}

impl MetricsRegistry {
    /// Creates a fresh registry with all families registered.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] on registration failure.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();
        let metrics = FaultlineMetrics::new(&registry)?;
        Ok(Self { registry, metrics })
    }

    /// The metric families handle.
    #[must_use]
    pub fn metrics(&self) -> FaultlineMetrics {
        self.metrics.clone()
    }

    /// Encodes every registered family in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::EncodingFailed`] if encoding fails.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&families, &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry").finish_non_exhaustive()
    }
}

/// Shared reference to a metrics registry.
pub type SharedMetricsRegistry = Arc<MetricsRegistry>;

/// Creates a new shared metrics registry.
///
/// # Errors
///
/// Returns [`MetricsError`] on registration failure.
pub fn new_shared_registry() -> Result<SharedMetricsRegistry, MetricsError> {
    Ok(Arc::new(MetricsRegistry::new()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn families_register_and_encode() {
        let registry = MetricsRegistry::new().unwrap();
        let metrics = registry.metrics();

        metrics.event_ingested("accepted");
        metrics.event_ingested("duplicate");
        metrics.rejection("rate_limited");
        metrics.action_completed("RETRY", "FAILED");
        metrics.degraded("rate_limiter");
        metrics.set_incidents_open(3);
        metrics.set_breaker_state("stripe", BreakerState::Open);
        metrics.observe_detection_lag(0.2);

        let text = registry.encode_text().unwrap();
        assert!(text.contains("faultline_events_ingested_total"));
        assert!(text.contains("faultline_breaker_state"));
        assert!(text.contains("outcome=\"accepted\""));
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = Registry::new();
        FaultlineMetrics::new(&registry).unwrap();
        assert!(FaultlineMetrics::new(&registry).is_err());
    }
}
