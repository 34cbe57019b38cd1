//! Rejection taxonomy for the ingestion surface.
//!
//! Every ingestion rejection is a typed record with a machine code and a
//! status class the surface layer can map directly. `duplicate` is
//! success-shaped and never appears here as an error.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::CorrelationId;

/// Machine-readable rejection codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionCode {
    /// Schema violation.
    Validation,
    /// Tenant present but not active.
    TenantInactive,
    /// Tenant or workflow missing.
    NotFound,
    /// Kill switch engaged or workflow inactive.
    WorkflowDisabled,
    /// Rate limit exceeded; carries a retry-after hint.
    RateLimited,
    /// Vendor breaker open.
    BreakerOpen,
    /// Transient or unknown failure; the caller may retry.
    Internal,
}

impl RejectionCode {
    /// HTTP-ish status class for the code.
    #[must_use]
    pub const fn status_class(self) -> u16 {
        match self {
            Self::Validation | Self::TenantInactive => 400,
            Self::NotFound => 404,
            Self::WorkflowDisabled => 403,
            Self::RateLimited => 429,
            Self::BreakerOpen => 503,
            Self::Internal => 500,
        }
    }

    /// Wire identifier for the code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::TenantInactive => "tenant_inactive",
            Self::NotFound => "not_found",
            Self::WorkflowDisabled => "workflow_disabled",
            Self::RateLimited => "rate_limited",
            Self::BreakerOpen => "breaker_open",
            Self::Internal => "internal",
        }
    }

    /// Returns `true` if the caller may retry the same request.
    #[must_use]
    pub const fn retryable(self) -> bool {
        matches!(self, Self::RateLimited | Self::BreakerOpen | Self::Internal)
    }
}

impl std::fmt::Display for RejectionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully materialized rejection, ready for the surface layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rejection {
    /// Machine code.
    pub code: RejectionCode,
    /// Human-readable message.
    pub message: String,
    /// Structured details (offending field, limits, hints).
    pub details: Value,
    /// Correlation token of the rejected request.
    pub correlation_id: CorrelationId,
    /// Seconds until retry is sensible, for `rate_limited`.
    pub retry_after_secs: Option<u64>,
}
