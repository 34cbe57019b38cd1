//! Workflow event types and submission validation.
//!
//! An [`EventSubmission`] is the external contract: what a producer sends.
//! A [`StoredEvent`] is the persisted row: the submission plus the fields
//! the pipeline stamps on (`id`, `received_at`, `correlation_id`). Events
//! are immutable once written.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::CorrelationId;

// =============================================================================
// Limits
// =============================================================================

/// Maximum length of an event type string.
pub const MAX_EVENT_TYPE_LEN: usize = 255;

/// Maximum length of an idempotency key.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

/// Maximum serialized payload size in bytes (10 KiB).
pub const MAX_PAYLOAD_BYTES: usize = 10 * 1024;

/// Payload key naming an external vendor.
pub const PAYLOAD_VENDOR_KEY: &str = "vendor";

/// Payload key carrying the producer's error code.
pub const PAYLOAD_ERROR_CODE_KEY: &str = "error_code";

// =============================================================================
// Validation errors
// =============================================================================

/// A submission failed schema validation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ValidationError {
    /// A required string field was empty or too long.
    #[error("{field} length {length} outside 1..={max}")]
    FieldLength {
        /// Field name.
        field: &'static str,
        /// Observed length.
        length: usize,
        /// Maximum allowed length.
        max: usize,
    },

    /// The payload was not a JSON object.
    #[error("payload must be a JSON object")]
    PayloadNotObject,

    /// The serialized payload exceeded the size cap.
    #[error("payload size {size} exceeds {max} bytes")]
    PayloadTooLarge {
        /// Serialized size in bytes.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// The schema version was not a `MAJOR.MINOR.PATCH` string.
    #[error("schema_version {value:?} is not a semver string")]
    SchemaVersion {
        /// The offending value.
        value: String,
    },
}

// =============================================================================
// EventSubmission
// =============================================================================

/// A workflow event as submitted by an external producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSubmission {
    /// Tenant the event belongs to.
    pub tenant_id: String,
    /// Workflow the event belongs to.
    pub workflow_id: String,
    /// Dot-separated event type, e.g. `payment.failed`.
    pub event_type: String,
    /// Structured payload.
    pub payload: Value,
    /// Producer-chosen replay key, unique per tenant.
    pub idempotency_key: String,
    /// When the event occurred at the producer (RFC3339 UTC).
    pub occurred_at: DateTime<Utc>,
    /// Producer schema version, `MAJOR.MINOR.PATCH`.
    pub schema_version: String,
}

impl EventSubmission {
    /// Validates the submission against the schema limits.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint. Steps later in the ingestion
    /// pipeline never run for an invalid submission.
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_len("event_type", &self.event_type, MAX_EVENT_TYPE_LEN)?;
        check_len(
            "idempotency_key",
            &self.idempotency_key,
            MAX_IDEMPOTENCY_KEY_LEN,
        )?;
        check_len("tenant_id", &self.tenant_id, MAX_EVENT_TYPE_LEN)?;
        check_len("workflow_id", &self.workflow_id, MAX_EVENT_TYPE_LEN)?;

        if !self.payload.is_object() {
            return Err(ValidationError::PayloadNotObject);
        }
        let size = serde_json::to_string(&self.payload)
            .map(|s| s.len())
            .unwrap_or(usize::MAX);
        if size > MAX_PAYLOAD_BYTES {
            return Err(ValidationError::PayloadTooLarge {
                size,
                max: MAX_PAYLOAD_BYTES,
            });
        }

        if !is_semver(&self.schema_version) {
            return Err(ValidationError::SchemaVersion {
                value: self.schema_version.clone(),
            });
        }

        Ok(())
    }

    /// Returns the vendor named by the payload, if any.
    #[must_use]
    pub fn vendor(&self) -> Option<&str> {
        payload_str(&self.payload, PAYLOAD_VENDOR_KEY)
    }

    /// Returns the error code carried by the payload, if any.
    #[must_use]
    pub fn error_code(&self) -> Option<&str> {
        payload_str(&self.payload, PAYLOAD_ERROR_CODE_KEY)
    }
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    if value.is_empty() || value.len() > max {
        return Err(ValidationError::FieldLength {
            field,
            length: value.len(),
            max,
        });
    }
    Ok(())
}

fn is_semver(value: &str) -> bool {
    let mut parts = 0;
    for part in value.split('.') {
        parts += 1;
        if parts > 3 || part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
    }
    parts == 3
}

fn payload_str<'a>(payload: &'a Value, key: &str) -> Option<&'a str> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

// =============================================================================
// StoredEvent
// =============================================================================

/// A persisted workflow event. Immutable after commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Opaque event identifier (`EVT-...`).
    pub id: String,
    /// Tenant the event belongs to.
    pub tenant_id: String,
    /// Workflow the event belongs to.
    pub workflow_id: String,
    /// Dot-separated event type.
    pub event_type: String,
    /// Structured payload, exactly as submitted.
    pub payload: Value,
    /// Producer-chosen replay key.
    pub idempotency_key: String,
    /// When the event occurred at the producer.
    pub occurred_at: DateTime<Utc>,
    /// When the pipeline accepted the event.
    pub received_at: DateTime<Utc>,
    /// Correlation token for the ingesting request.
    pub correlation_id: CorrelationId,
    /// Vendor named by the payload, extracted at ingest.
    pub vendor: Option<String>,
    /// Producer schema version.
    pub schema_version: String,
}

impl StoredEvent {
    /// Builds the persisted form of a submission.
    #[must_use]
    pub fn from_submission(
        id: String,
        submission: &EventSubmission,
        received_at: DateTime<Utc>,
        correlation_id: CorrelationId,
    ) -> Self {
        Self {
            id,
            tenant_id: submission.tenant_id.clone(),
            workflow_id: submission.workflow_id.clone(),
            event_type: submission.event_type.clone(),
            payload: submission.payload.clone(),
            idempotency_key: submission.idempotency_key.clone(),
            occurred_at: submission.occurred_at,
            received_at,
            correlation_id,
            vendor: submission.vendor().map(str::to_string),
            schema_version: submission.schema_version.clone(),
        }
    }

    /// Returns the error code carried by the payload, if any.
    #[must_use]
    pub fn error_code(&self) -> Option<&str> {
        payload_str(&self.payload, PAYLOAD_ERROR_CODE_KEY)
    }

    /// Returns `true` if this event indicates a failure.
    ///
    /// See [`is_failure_event`].
    #[must_use]
    pub fn is_failure(&self) -> bool {
        is_failure_event(&self.event_type, &self.payload)
    }

    /// Clock skew between producer and receiver, in whole seconds.
    ///
    /// Positive when the event claims to have occurred after it was
    /// received. Skew is recorded, never enforced.
    #[must_use]
    pub fn clock_skew_secs(&self) -> i64 {
        (self.occurred_at - self.received_at).num_seconds()
    }
}

/// Returns `true` if the event indicates a workflow failure.
///
/// The rule is a union of the type surface and the payload surface:
///
/// - the event type ends in `.failed`, or contains a `failed`, `error`,
///   `timeout`, or `rejected` token, or
/// - the payload carries a non-empty `error_code` or `error_message`, or
///   `status` is one of `failed`, `error`, `rejected`.
#[must_use]
pub fn is_failure_event(event_type: &str, payload: &Value) -> bool {
    let ty = event_type.to_ascii_lowercase();
    if ty.ends_with(".failed") {
        return true;
    }
    if ty
        .split('.')
        .any(|tok| matches!(tok, "failed" | "error" | "timeout" | "rejected"))
    {
        return true;
    }

    if payload_str(payload, PAYLOAD_ERROR_CODE_KEY).is_some() {
        return true;
    }
    if payload_str(payload, "error_message").is_some() {
        return true;
    }
    matches!(
        payload_str(payload, "status"),
        Some("failed" | "error" | "rejected")
    )
}
