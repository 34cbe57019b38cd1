//! The classifier adapter contract.
//!
//! The core depends only on this narrow interface; how classification is
//! realized (rule table, external model, constant stub) is a deployment
//! concern. The consumer must tolerate nondeterminism, bound latency with
//! a timeout, and treat failure as a timeout.
//!
//! # Async Pattern
//!
//! Trait methods return [`BoxFuture`] to stay object-safe, so the daemon
//! can hold a `dyn Classifier` and swap implementations freely.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::StoredEvent;
use crate::incident::Incident;

/// A boxed future for object-safe async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Reasoning string recorded when the classifier times out or fails.
pub const TIMEOUT_REASONING: &str = "classifier_timeout";

/// The classifier's recommended next step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Recommendation {
    /// Replay the failed work.
    Retry,
    /// Escalate to humans.
    Escalate,
    /// Ask for manual review.
    Manual,
}

/// One classification result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// Failure category label.
    pub category: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Recommended next step.
    pub recommended: Recommendation,
    /// Free-text reasoning.
    pub reasoning: String,
    /// Identifier of the producing model or rule set.
    pub model_tag: String,
}

impl Classification {
    /// The fallback applied when the classifier times out or fails:
    /// escalate, zero confidence.
    #[must_use]
    pub fn timeout_fallback() -> Self {
        Self {
            category: "unclassified".to_string(),
            confidence: 0.0,
            recommended: Recommendation::Escalate,
            reasoning: TIMEOUT_REASONING.to_string(),
            model_tag: "fallback".to_string(),
        }
    }
}

/// Classifier backend errors.
///
/// Any error is treated by the consumer exactly like a timeout.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClassifierError {
    /// The backend did not answer within its deadline.
    #[error("classifier timed out")]
    Timeout,

    /// The backend failed outright.
    #[error("classifier backend failed: {message}")]
    Backend {
        /// Backend-reported detail.
        message: String,
    },
}

/// The classification contract.
pub trait Classifier: Send + Sync {
    /// Classifies an incident given its recent correlated events.
    ///
    /// Implementations need not be deterministic. Callers enforce their
    /// own timeout around this future.
    fn classify<'a>(
        &'a self,
        incident: &'a Incident,
        recent_events: &'a [StoredEvent],
    ) -> BoxFuture<'a, Result<Classification, ClassifierError>>;
}
