//! Shared identifier and tenancy types.
//!
//! Identifiers are opaque prefixed strings (`EVT-`, `INC-`, `DEC-`, `ACT-`)
//! generated from v4 UUIDs. Tenant, workflow, and vendor identifiers are
//! operator-assigned and carried as plain strings.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Identifier generation
// =============================================================================

/// Generates a fresh event identifier.
#[must_use]
pub fn new_event_id() -> String {
    format!("EVT-{}", Uuid::new_v4())
}

/// Generates a fresh incident identifier.
#[must_use]
pub fn new_incident_id() -> String {
    format!("INC-{}", Uuid::new_v4())
}

/// Generates a fresh decision identifier.
#[must_use]
pub fn new_decision_id() -> String {
    format!("DEC-{}", Uuid::new_v4())
}

/// Generates a fresh action identifier.
#[must_use]
pub fn new_action_id() -> String {
    format!("ACT-{}", Uuid::new_v4())
}

// =============================================================================
// Correlation identifiers
// =============================================================================

/// Opaque request correlation token.
///
/// Carried from the inbound request when present, otherwise freshly
/// generated. Propagated through every row persisted during a request so
/// an operator can reconstruct the full path of one submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Maximum accepted length for an inbound correlation token.
    pub const MAX_LEN: usize = 128;

    /// Generates a fresh opaque correlation token.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("COR-{}", Uuid::new_v4().simple()))
    }

    /// Adopts an inbound token if present and well-formed, otherwise
    /// generates a fresh one.
    ///
    /// Oversized or empty inbound tokens are discarded rather than rejected:
    /// correlation is best-effort observability, never a gate.
    #[must_use]
    pub fn from_inbound(inbound: Option<&str>) -> Self {
        match inbound {
            Some(token) if !token.is_empty() && token.len() <= Self::MAX_LEN => {
                Self(token.to_string())
            },
            _ => Self::generate(),
        }
    }

    /// Wraps an already-validated token (e.g. read back from storage).
    #[must_use]
    pub fn from_stored(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the token as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Severity
// =============================================================================

/// Incident severity levels, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    /// Informational; no urgency.
    Low,
    /// Default severity for unclassified failures.
    #[default]
    Medium,
    /// Elevated; on-call attention warranted.
    High,
    /// Maximum severity. Escalation never raises past this.
    Critical,
}

impl Severity {
    /// Returns the severity as its storage identifier.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }

    /// Parses a storage identifier back into a severity.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "LOW" => Some(Self::Low),
            "MEDIUM" => Some(Self::Medium),
            "HIGH" => Some(Self::High),
            "CRITICAL" => Some(Self::Critical),
            _ => None,
        }
    }

    /// Returns the next severity level up, capped at [`Severity::Critical`].
    #[must_use]
    pub const fn escalated(self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Tenancy records
// =============================================================================

/// A tenant. All data in the system is scoped to exactly one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    /// Operator-assigned tenant identifier.
    pub id: String,
    /// Human-readable tenant name.
    pub name: String,
    /// Writes on behalf of an inactive tenant are rejected.
    pub active: bool,
}

/// A workflow within a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    /// Operator-assigned workflow identifier.
    pub id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Human-readable workflow name.
    pub name: String,
    /// Inactive workflows reject ingestion independently of kill switches.
    pub active: bool,
}

/// An operator-controlled kill switch.
///
/// When `workflow_id` is `None` the switch applies tenant-wide. Switches are
/// created by operators and deactivated explicitly; nothing in the automated
/// path flips them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillSwitch {
    /// Tenant the switch applies to.
    pub tenant_id: String,
    /// Workflow scope, or `None` for tenant-wide.
    pub workflow_id: Option<String>,
    /// Whether the switch is currently engaged.
    pub active: bool,
    /// Operator-supplied reason.
    pub reason: String,
    /// Who engaged the switch.
    pub activated_by: String,
    /// When the switch was engaged.
    pub activated_at: DateTime<Utc>,
}

/// An external vendor named by event payloads.
///
/// Durable circuit breaker state for the vendor is persisted alongside the
/// record; the live snapshot is held in the shared-state cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vendor {
    /// Vendor identifier.
    pub id: String,
    /// Vendor name as it appears in event payloads.
    pub name: String,
    /// Requests per minute admitted for this vendor per tenant.
    pub rate_limit_per_minute: u32,
}
