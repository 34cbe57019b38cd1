//! Runtime configuration.
//!
//! All configuration is loaded once at startup from a TOML file and is
//! read-only afterwards. Reload means restart or an explicit swap of the
//! constructed root; nothing mutates these structures under load.
//!
//! Every field has a default so an empty file (or no file) yields a
//! working daemon.

use std::collections::HashMap;
use std::path::Path;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::breaker::BreakerConfig;
use crate::retry::RetryPolicy;
use crate::rules::{RuleEntry, RulesTable};
use crate::types::Severity;

// =============================================================================
// Errors
// =============================================================================

/// Configuration loading or validation errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Offending path.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file was not valid TOML for this schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A semantic constraint was violated.
    #[error("invalid config: {message}")]
    Invalid {
        /// What was wrong.
        message: String,
    },
}

// =============================================================================
// Sections
// =============================================================================

/// Global safety limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyLimitsConfig {
    /// Maximum remediation retries charged per workflow incident.
    pub max_retries_per_workflow: u32,
    /// Maximum vendor failures tolerated per rolling hour before
    /// remediation is forced to escalate.
    pub max_retries_per_vendor_per_hour: u32,
}

impl Default for SafetyLimitsConfig {
    fn default() -> Self {
        Self {
            max_retries_per_workflow: 5,
            max_retries_per_vendor_per_hour: 100,
        }
    }
}

/// Pipeline timeouts and intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Deadline for any single store operation, in seconds.
    pub store_timeout_secs: u64,
    /// Deadline for one classifier call, in seconds.
    pub classifier_timeout_secs: u64,
    /// Scheduler poll interval, in milliseconds (jittered).
    pub scheduler_poll_interval_ms: u64,
    /// Detector poll interval, in milliseconds (jittered).
    pub detector_poll_interval_ms: u64,
    /// Default per-tenant ingestion admissions per minute.
    pub tenant_rate_limit_per_minute: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            store_timeout_secs: 5,
            classifier_timeout_secs: 10,
            scheduler_poll_interval_ms: 500,
            detector_poll_interval_ms: 1000,
            tenant_rate_limit_per_minute: 600,
        }
    }
}

/// Metrics endpoint settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Port for the Prometheus HTTP endpoint (localhost only).
    pub port: u16,
    /// Disables the endpoint entirely.
    pub disabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: 9464,
            disabled: false,
        }
    }
}

/// One named retry policy, as configured.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicyConfig {
    /// Whether errors under this policy may be retried.
    pub retryable: bool,
    /// Attempts before escalation.
    pub max_retries: u32,
    /// Delay before the first retry, in seconds.
    pub initial_delay_secs: f64,
    /// Upper bound on any single delay, in seconds.
    pub max_delay_secs: f64,
    /// Exponential growth factor.
    pub multiplier: f64,
    /// Jitter fraction in `[0, 1)`.
    pub jitter: f64,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            retryable: true,
            max_retries: 3,
            initial_delay_secs: 1.0,
            max_delay_secs: 300.0,
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryPolicyConfig {
    /// Materializes the domain policy under a name.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn to_policy(self, name: &str) -> RetryPolicy {
        RetryPolicy {
            name: name.to_string(),
            retryable: self.retryable,
            max_retries: self.max_retries,
            initial_delay: secs_f64_to_duration(self.initial_delay_secs),
            max_delay: secs_f64_to_duration(self.max_delay_secs),
            multiplier: self.multiplier,
            jitter: self.jitter,
        }
    }
}

/// One configured error code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorCodeConfig {
    /// Severity assigned to incidents under this code.
    pub severity: Severity,
    /// Retry policy name.
    pub retry_policy: String,
    /// Whether this error class is retryable.
    pub retryable: bool,
}

impl Default for ErrorCodeConfig {
    fn default() -> Self {
        Self {
            severity: Severity::Medium,
            retry_policy: "default".to_string(),
            retryable: true,
        }
    }
}

/// Breaker settings for one vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VendorBreakerConfig {
    /// Failures within the window that trip the breaker.
    pub failure_threshold: u32,
    /// Seconds the breaker stays open before probing.
    pub cooldown_secs: u64,
    /// Maximum concurrent half-open probes.
    pub probe_cap: u32,
    /// Rolling failure-count window, in seconds.
    pub failure_window_secs: u64,
}

impl Default for VendorBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            cooldown_secs: 300,
            probe_cap: 1,
            failure_window_secs: 300,
        }
    }
}

impl VendorBreakerConfig {
    /// Materializes the domain breaker configuration.
    #[must_use]
    pub fn to_breaker_config(self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            cooldown: secs_to_duration(self.cooldown_secs),
            probe_cap: self.probe_cap,
            failure_window: secs_to_duration(self.failure_window_secs),
        }
    }
}

/// Full vendor configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct VendorConfig {
    /// Breaker settings.
    pub breaker: VendorBreakerConfig,
    /// Rate limit settings.
    pub rate_limit: VendorRateLimitConfig,
}

/// Rate limit settings for one vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VendorRateLimitConfig {
    /// Admissions per minute per tenant for this vendor.
    pub per_minute: u32,
}

impl Default for VendorRateLimitConfig {
    fn default() -> Self {
        Self { per_minute: 100 }
    }
}

// =============================================================================
// Root
// =============================================================================

/// The complete faultline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FaultlineConfig {
    /// Global safety limits.
    pub safety: SafetyLimitsConfig,
    /// Pipeline timeouts and intervals.
    pub pipeline: PipelineConfig,
    /// Metrics endpoint settings.
    pub metrics: MetricsConfig,
    /// Named retry policies. A `default` policy is always available.
    pub retry_policies: HashMap<String, RetryPolicyConfig>,
    /// Error code rules.
    pub error_codes: HashMap<String, ErrorCodeConfig>,
    /// Per-vendor protective settings.
    pub vendors: HashMap<String, VendorConfig>,
}

impl FaultlineConfig {
    /// Loads and validates configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on read, parse, or validation failure.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml(&raw)?;
        tracing::debug!(
            path = %path.display(),
            error_codes = config.error_codes.len(),
            retry_policies = config.retry_policies.len(),
            vendors = config.vendors.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Parses and validates configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on parse or validation failure.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates semantic constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, policy) in &self.retry_policies {
            if !(0.0..1.0).contains(&policy.jitter) {
                return Err(invalid(format!(
                    "retry policy {name:?}: jitter {} outside [0, 1)",
                    policy.jitter
                )));
            }
            if policy.multiplier < 1.0 {
                return Err(invalid(format!(
                    "retry policy {name:?}: multiplier {} below 1.0",
                    policy.multiplier
                )));
            }
            if policy.max_delay_secs < policy.initial_delay_secs {
                return Err(invalid(format!(
                    "retry policy {name:?}: max_delay below initial_delay"
                )));
            }
        }
        for (code, entry) in &self.error_codes {
            if entry.retry_policy != "default"
                && !self.retry_policies.contains_key(&entry.retry_policy)
            {
                return Err(invalid(format!(
                    "error code {code:?} references unknown retry policy {:?}",
                    entry.retry_policy
                )));
            }
        }
        for (vendor, cfg) in &self.vendors {
            if cfg.breaker.probe_cap == 0 {
                return Err(invalid(format!("vendor {vendor:?}: probe_cap must be > 0")));
            }
            if cfg.breaker.failure_threshold == 0 {
                return Err(invalid(format!(
                    "vendor {vendor:?}: failure_threshold must be > 0"
                )));
            }
        }
        Ok(())
    }

    /// Returns the named retry policy, falling back to the built-in
    /// default when the name is unknown.
    #[must_use]
    pub fn retry_policy(&self, name: &str) -> RetryPolicy {
        self.retry_policies
            .get(name)
            .map_or_else(RetryPolicy::default_policy, |cfg| cfg.to_policy(name))
    }

    /// Builds the read-only rules table.
    #[must_use]
    pub fn rules_table(&self) -> RulesTable {
        let entries = self
            .error_codes
            .iter()
            .map(|(code, cfg)| {
                (
                    code.clone(),
                    RuleEntry {
                        severity: cfg.severity,
                        retry_policy: cfg.retry_policy.clone(),
                        retryable: cfg.retryable,
                    },
                )
            })
            .collect();
        RulesTable::new(entries)
    }

    /// Returns the breaker configuration for a vendor (defaults when the
    /// vendor is not explicitly configured).
    #[must_use]
    pub fn breaker_config(&self, vendor: &str) -> BreakerConfig {
        self.vendors
            .get(vendor)
            .map_or_else(BreakerConfig::default, |cfg| {
                cfg.breaker.to_breaker_config()
            })
    }

    /// Returns the per-minute rate limit for a vendor.
    #[must_use]
    pub fn vendor_rate_limit(&self, vendor: &str) -> u32 {
        self.vendors
            .get(vendor)
            .map_or(VendorRateLimitConfig::default().per_minute, |cfg| {
                cfg.rate_limit.per_minute
            })
    }
}

fn invalid(message: String) -> ConfigError {
    ConfigError::Invalid { message }
}

#[allow(clippy::cast_possible_truncation)]
fn secs_f64_to_duration(secs: f64) -> Duration {
    Duration::milliseconds((secs * 1000.0).round() as i64)
}

#[allow(clippy::cast_possible_wrap)]
fn secs_to_duration(secs: u64) -> Duration {
    Duration::seconds(secs.min(i64::MAX as u64) as i64)
}
