//! Incident entity and lifecycle.
//!
//! Incidents group failure events that share a fingerprint. The lifecycle
//! is a strict forward chain with one terminal branch:
//!
//! ```text
//! NEW -> ANALYZING -> ACTIONED -> RESOLVED
//!   \________\____________\-> IGNORED   (from any non-terminal state)
//! ```
//!
//! # Invariants
//!
//! - [INV-INC001] `event_count >= 1` and is monotonically non-decreasing.
//! - [INV-INC002] `RESOLVED` and `IGNORED` are terminal.
//! - [INV-INC003] Severity upgrades fire at most once per trigger
//!   (count threshold, duration threshold), capped at `CRITICAL`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::Severity;

/// Metadata flag set once the count-based severity upgrade has fired.
pub const META_COUNT_UPGRADED: &str = "severity_upgraded_by_count";

/// Metadata flag set once the duration-based severity upgrade has fired.
pub const META_DURATION_UPGRADED: &str = "severity_upgraded_by_duration";

/// Event count above which severity is upgraded once.
pub const SEVERITY_COUNT_THRESHOLD: u64 = 100;

/// First-to-last span above which severity is upgraded once.
pub const SEVERITY_DURATION_THRESHOLD_SECS: i64 = 3600;

/// Incident lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentStatus {
    /// Just created from the first correlated event.
    New,
    /// Classification is in progress or recorded.
    Analyzing,
    /// A remediation action has been created.
    Actioned,
    /// Remediation succeeded or an operator closed the incident.
    Resolved,
    /// Operator chose to ignore; terminal.
    Ignored,
}

impl IncidentStatus {
    /// Storage identifier for the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Analyzing => "ANALYZING",
            Self::Actioned => "ACTIONED",
            Self::Resolved => "RESOLVED",
            Self::Ignored => "IGNORED",
        }
    }

    /// Parses a storage identifier.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "NEW" => Some(Self::New),
            "ANALYZING" => Some(Self::Analyzing),
            "ACTIONED" => Some(Self::Actioned),
            "RESOLVED" => Some(Self::Resolved),
            "IGNORED" => Some(Self::Ignored),
            _ => None,
        }
    }

    /// Returns `true` for terminal states.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved | Self::Ignored)
    }

    /// Returns `true` if `self -> to` is a legal lifecycle transition.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        match (self, to) {
            (Self::New, Self::Analyzing)
            | (Self::Analyzing, Self::Actioned)
            | (Self::Actioned, Self::Resolved) => true,
            (from, Self::Ignored) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An illegal lifecycle transition was attempted.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal incident transition {from} -> {to}")]
pub struct IllegalIncidentTransition {
    /// Current status.
    pub from: IncidentStatus,
    /// Requested status.
    pub to: IncidentStatus,
}

/// An incident: one open grouping of correlated failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    /// Opaque incident identifier (`INC-...`).
    pub id: String,
    /// Tenant scope.
    pub tenant_id: String,
    /// Workflow scope.
    pub workflow_id: String,
    /// Fingerprint this incident groups.
    pub signature: String,
    /// Human-readable title.
    pub title: String,
    /// Lifecycle status.
    pub status: IncidentStatus,
    /// Current severity.
    pub severity: Severity,
    /// Number of correlated events; never decreases.
    pub event_count: u64,
    /// `occurred_at` of the first correlated event.
    pub first_seen_at: DateTime<Utc>,
    /// Latest `occurred_at` among correlated events.
    pub last_seen_at: DateTime<Utc>,
    /// Remediation attempts charged against the workflow retry budget.
    pub retry_count: u32,
    /// Free-form metadata (error code, upgrade flags, audit notes).
    pub metadata: Value,
}

impl Incident {
    /// Validates and applies a lifecycle transition.
    ///
    /// # Errors
    ///
    /// Returns [`IllegalIncidentTransition`] when the pair is not in the
    /// legal set; the incident is left unchanged.
    pub fn transition_to(&mut self, to: IncidentStatus) -> Result<(), IllegalIncidentTransition> {
        if !self.status.can_transition_to(to) {
            return Err(IllegalIncidentTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Returns a metadata string field, if present.
    #[must_use]
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// Returns `true` if the given metadata flag has been set.
    #[must_use]
    pub fn metadata_flag(&self, key: &str) -> bool {
        self.metadata
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Decides whether a severity upgrade is due, and which flag records it.
    ///
    /// Returns `None` when nothing is due. At most one trigger fires per
    /// call; the count trigger is checked first.
    #[must_use]
    pub fn due_severity_upgrade(&self) -> Option<&'static str> {
        if self.event_count > SEVERITY_COUNT_THRESHOLD && !self.metadata_flag(META_COUNT_UPGRADED) {
            return Some(META_COUNT_UPGRADED);
        }
        let span_secs = (self.last_seen_at - self.first_seen_at).num_seconds();
        if span_secs > SEVERITY_DURATION_THRESHOLD_SECS
            && !self.metadata_flag(META_DURATION_UPGRADED)
        {
            return Some(META_DURATION_UPGRADED);
        }
        None
    }
}
