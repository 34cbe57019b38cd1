//! Decision recorder: the immutable audit trail of automated choices.
//!
//! Every classifier result is persisted before the action coordinator
//! acts on it, and every coordinator-side note (suppressions,
//! re-selections) lands here too. Rows are write-once.

use std::sync::Arc;

use faultline_core::classifier::Classification;
use faultline_core::clock::Clock;
use faultline_core::decision::{Decision, DecisionKind};
use faultline_core::incident::Incident;
use faultline_core::types::new_decision_id;

use crate::store::{DecisionStore, StoreError};

/// Reasoning prefix for single-flight suppression notes.
pub const SUPPRESSION_REASONING: &str = "action_suppressed:single_flight";

/// Writes immutable decision records.
pub struct DecisionRecorder {
    decisions: DecisionStore,
    clock: Arc<dyn Clock>,
}

impl DecisionRecorder {
    /// Creates a recorder over the decision store.
    #[must_use]
    pub fn new(decisions: DecisionStore, clock: Arc<dyn Clock>) -> Self {
        Self { decisions, clock }
    }

    /// Persists a classification result for an incident. Returns the
    /// recorded decision.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on write failure.
    pub fn record_classification(
        &self,
        incident: &Incident,
        classification: &Classification,
    ) -> Result<Decision, StoreError> {
        let decision = Decision {
            id: new_decision_id(),
            incident_id: incident.id.clone(),
            kind: DecisionKind::Classification,
            reasoning: classification.reasoning.clone(),
            confidence: classification.confidence,
            model_tag: classification.model_tag.clone(),
            created_at: self.clock.now(),
        };
        self.decisions.insert(&decision)?;
        Ok(decision)
    }

    /// Persists a coordinator recommendation note (re-selection after a
    /// failed attempt, suppression, reversal request).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on write failure.
    pub fn record_note(
        &self,
        incident_id: &str,
        reasoning: impl Into<String>,
        model_tag: &str,
    ) -> Result<Decision, StoreError> {
        let decision = Decision {
            id: new_decision_id(),
            incident_id: incident_id.to_string(),
            kind: DecisionKind::Recommendation,
            reasoning: reasoning.into(),
            confidence: 1.0,
            model_tag: model_tag.to_string(),
            created_at: self.clock.now(),
        };
        self.decisions.insert(&decision)?;
        Ok(decision)
    }

    /// Persists the suppression note for a single-flight conflict.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on write failure.
    pub fn record_suppression(&self, incident_id: &str) -> Result<Decision, StoreError> {
        self.record_note(incident_id, SUPPRESSION_REASONING, "coordinator")
    }
}

impl std::fmt::Debug for DecisionRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionRecorder").finish_non_exhaustive()
    }
}
