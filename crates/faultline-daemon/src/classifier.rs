//! Classifier implementations.
//!
//! The production default is [`RuleClassifier`], a deterministic
//! classifier driven by the rules table with no external calls. Anything
//! implementing the core contract can be swapped in; the consumer-side
//! timeout mapping in [`classify_or_fallback`] is what makes that safe.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use faultline_core::classifier::{
    BoxFuture, Classification, Classifier, ClassifierError, Recommendation,
};
use faultline_core::event::StoredEvent;
use faultline_core::fingerprint::UNKNOWN_ERROR_CODE;
use faultline_core::incident::Incident;
use faultline_core::rules::RulesTable;
use faultline_core::types::Severity;
use tracing::{debug, warn};

/// Confidence reported for explicitly configured error codes.
const KNOWN_CODE_CONFIDENCE: f64 = 0.9;

/// Confidence reported for unknown codes (default rule applied).
const UNKNOWN_CODE_CONFIDENCE: f64 = 0.4;

/// Deterministic, rules-driven classifier.
#[derive(Debug)]
pub struct RuleClassifier {
    rules: Arc<RulesTable>,
    model_tag: String,
}

impl RuleClassifier {
    /// Creates a classifier over the rules table.
    #[must_use]
    pub fn new(rules: Arc<RulesTable>) -> Self {
        Self {
            rules,
            model_tag: "rules-v1".to_string(),
        }
    }
}

impl Classifier for RuleClassifier {
    fn classify<'a>(
        &'a self,
        incident: &'a Incident,
        _recent_events: &'a [StoredEvent],
    ) -> BoxFuture<'a, Result<Classification, ClassifierError>> {
        Box::pin(async move {
            let error_code = incident
                .metadata_str("error_code")
                .unwrap_or(UNKNOWN_ERROR_CODE);
            let rule = self.rules.lookup(error_code);

            let recommended = if incident.severity >= Severity::Critical {
                Recommendation::Escalate
            } else if rule.retryable {
                Recommendation::Retry
            } else if rule.severity >= Severity::High {
                Recommendation::Escalate
            } else {
                Recommendation::Manual
            };

            let confidence = if self.rules.contains(error_code) {
                KNOWN_CODE_CONFIDENCE
            } else {
                UNKNOWN_CODE_CONFIDENCE
            };

            debug!(
                incident_id = %incident.id,
                error_code = %error_code,
                recommended = ?recommended,
                "rule classification"
            );

            Ok(Classification {
                category: error_code.to_string(),
                confidence,
                recommended,
                reasoning: format!(
                    "error code {error_code:?} evaluated with policy {:?}",
                    rule.retry_policy
                ),
                model_tag: self.model_tag.clone(),
            })
        })
    }
}

/// Runs a classifier under a timeout, mapping expiry and failure to the
/// documented escalation fallback. This is the only way the rest of the
/// daemon invokes classification.
pub async fn classify_or_fallback(
    classifier: &dyn Classifier,
    incident: &Incident,
    recent_events: &[StoredEvent],
    timeout: StdDuration,
) -> Classification {
    match tokio::time::timeout(timeout, classifier.classify(incident, recent_events)).await {
        Ok(Ok(classification)) => classification,
        Ok(Err(err)) => {
            warn!(incident_id = %incident.id, error = %err, "classifier failed, falling back");
            Classification::timeout_fallback()
        },
        Err(_) => {
            warn!(incident_id = %incident.id, "classifier timed out, falling back");
            Classification::timeout_fallback()
        },
    }
}
