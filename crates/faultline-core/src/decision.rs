//! Immutable decision records.
//!
//! Every automated choice is audited as a decision row. Rows are inserted
//! once and never updated; the store exposes no mutation path for them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kinds of decision records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionKind {
    /// Classifier output for an incident.
    Classification,
    /// Root-cause analysis note.
    Rca,
    /// A coordinator recommendation (including suppression notes).
    Recommendation,
}

impl DecisionKind {
    /// Storage identifier for the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Classification => "CLASSIFICATION",
            Self::Rca => "RCA",
            Self::Recommendation => "RECOMMENDATION",
        }
    }

    /// Parses a storage identifier.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "CLASSIFICATION" => Some(Self::Classification),
            "RCA" => Some(Self::Rca),
            "RECOMMENDATION" => Some(Self::Recommendation),
            _ => None,
        }
    }
}

impl std::fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable decision audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// Opaque decision identifier (`DEC-...`).
    pub id: String,
    /// Incident the decision concerns.
    pub incident_id: String,
    /// What kind of decision this is.
    pub kind: DecisionKind,
    /// Free-text reasoning from the classifier or coordinator.
    pub reasoning: String,
    /// Classifier confidence in `[0, 1]`; `0.0` for fallbacks.
    pub confidence: f64,
    /// Which model or rule set produced the decision.
    pub model_tag: String,
    /// When the decision was recorded.
    pub created_at: DateTime<Utc>,
}
