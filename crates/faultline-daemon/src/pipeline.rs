//! The ingestion pipeline.
//!
//! Accepts a validated submission and runs the strictly ordered gate
//! sequence; a later step never executes once an earlier one has failed:
//!
//! 1. idempotency check (stored id returned as `Duplicate`)
//! 2. tenant gate
//! 3. workflow gate (inactive or kill-switched)
//! 4. rate-limit gate (tenant key; tenant+vendor key when a vendor is
//!    named)
//! 5. breaker gate (vendor only; half-open admits as a bounded probe)
//! 6. persist (the unique index on `(tenant_id, idempotency_key)` is the
//!    final duplicate tiebreaker)
//! 7. detection wake-up
//!
//! The only write is the event insert, which commits atomically: a
//! transient store failure leaves no partial row. The wake-up (step 7) is
//! fire-and-forget: the detector's durable watermark guarantees catch-up,
//! so a lost notification only delays detection to the next poll tick and
//! ingestion never fails because dispatch did.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use faultline_core::breaker::Admission;
use faultline_core::clock::Clock;
use faultline_core::event::{EventSubmission, StoredEvent, ValidationError};
use faultline_core::reject::{Rejection, RejectionCode};
use faultline_core::types::{CorrelationId, new_event_id};
use serde_json::json;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::metrics::FaultlineMetrics;
use crate::safety::{BreakerManager, RateLimiter};
use crate::store::{AdminStore, EventInsert, EventStore, StoreError};

// =============================================================================
// Results
// =============================================================================

/// How an accepted submission was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStatus {
    /// A new event row was written.
    Accepted,
    /// Idempotent replay: the original row's id is returned.
    Duplicate,
}

impl IngestStatus {
    /// Wire identifier for the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Duplicate => "duplicate",
        }
    }
}

/// Successful ingestion response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReceipt {
    /// Identifier of the persisted (or pre-existing) event.
    pub event_id: String,
    /// Whether this was a fresh write or an idempotent replay.
    pub status: IngestStatus,
    /// Correlation token for the request.
    pub correlation_id: CorrelationId,
}

/// Typed ingestion failures, in the order the gates run.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IngestError {
    /// Schema violation.
    #[error("validation failed: {source}")]
    Validation {
        /// The violated constraint.
        #[from]
        source: ValidationError,
    },

    /// Tenant exists but is not active.
    #[error("tenant {tenant_id} is inactive")]
    TenantInactive {
        /// The inactive tenant.
        tenant_id: String,
    },

    /// Tenant or workflow missing.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind.
        entity: &'static str,
        /// Identifier looked up.
        id: String,
    },

    /// Workflow inactive or kill-switched.
    #[error("workflow {workflow_id} is disabled: {reason}")]
    WorkflowDisabled {
        /// The disabled workflow.
        workflow_id: String,
        /// Why ingestion is blocked.
        reason: String,
    },

    /// A sliding-window limit rejected the request.
    #[error("rate limited on {scope}; retry after {retry_after_secs}s")]
    RateLimited {
        /// Which key rejected (`tenant` or `tenant_vendor`).
        scope: &'static str,
        /// Seconds until the window frees up.
        retry_after_secs: u64,
    },

    /// The vendor's breaker is shedding load.
    #[error("vendor {vendor} unavailable; retry in {retry_in_secs}s")]
    BreakerOpen {
        /// The protected vendor.
        vendor: String,
        /// Seconds until the breaker may probe.
        retry_in_secs: u64,
    },

    /// The caller's deadline expired between steps.
    #[error("deadline exceeded at step {step}")]
    DeadlineExceeded {
        /// The step that found the deadline gone.
        step: &'static str,
    },

    /// Transient store failure; the caller may retry. No partial row
    /// remains.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IngestError {
    /// Maps the failure to its rejection code.
    #[must_use]
    pub const fn code(&self) -> RejectionCode {
        match self {
            Self::Validation { .. } => RejectionCode::Validation,
            Self::TenantInactive { .. } => RejectionCode::TenantInactive,
            Self::NotFound { .. } => RejectionCode::NotFound,
            Self::WorkflowDisabled { .. } => RejectionCode::WorkflowDisabled,
            Self::RateLimited { .. } => RejectionCode::RateLimited,
            Self::BreakerOpen { .. } => RejectionCode::BreakerOpen,
            Self::DeadlineExceeded { .. } | Self::Store(_) => RejectionCode::Internal,
        }
    }

    /// Materializes the surface-layer rejection record.
    #[must_use]
    pub fn to_rejection(&self, correlation_id: CorrelationId) -> Rejection {
        let retry_after_secs = match self {
            Self::RateLimited {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            Self::BreakerOpen { retry_in_secs, .. } => Some(*retry_in_secs),
            _ => None,
        };
        Rejection {
            code: self.code(),
            message: self.to_string(),
            details: json!({}),
            correlation_id,
            retry_after_secs,
        }
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// The ingestion pipeline. Cheap to share behind an `Arc`.
pub struct IngestionPipeline {
    events: EventStore,
    admin: AdminStore,
    ratelimit: RateLimiter,
    breaker: Arc<BreakerManager>,
    clock: Arc<dyn Clock>,
    detector_wakeup: Arc<Notify>,
    metrics: FaultlineMetrics,
}

impl IngestionPipeline {
    /// Wires the pipeline. `detector_wakeup` is shared with the incident
    /// detector.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        events: EventStore,
        admin: AdminStore,
        ratelimit: RateLimiter,
        breaker: Arc<BreakerManager>,
        clock: Arc<dyn Clock>,
        detector_wakeup: Arc<Notify>,
        metrics: FaultlineMetrics,
    ) -> Self {
        Self {
            events,
            admin,
            ratelimit,
            breaker,
            clock,
            detector_wakeup,
            metrics,
        }
    }

    /// Ingests one submission.
    ///
    /// `deadline` is the caller's deadline; it is checked between steps.
    /// Expiry before the persist step has no effect to roll back; the
    /// persist itself is a single atomic insert.
    ///
    /// # Errors
    ///
    /// Returns the first gate failure, typed; see [`IngestError`].
    pub async fn ingest(
        &self,
        submission: &EventSubmission,
        correlation_id: CorrelationId,
        deadline: DateTime<Utc>,
    ) -> Result<IngestReceipt, IngestError> {
        let outcome = self
            .ingest_inner(submission, correlation_id.clone(), deadline)
            .await;
        match &outcome {
            Ok(receipt) => self.metrics.event_ingested(receipt.status.as_str()),
            Err(err) => self.metrics.rejection(err.code().as_str()),
        }
        outcome
    }

    async fn ingest_inner(
        &self,
        submission: &EventSubmission,
        correlation_id: CorrelationId,
        deadline: DateTime<Utc>,
    ) -> Result<IngestReceipt, IngestError> {
        submission.validate()?;

        // Step 1: idempotency check. A hit is success-shaped.
        self.check_deadline(deadline, "idempotency")?;
        if let Some(existing_id) = self
            .events
            .find_by_idempotency_key(&submission.tenant_id, &submission.idempotency_key)?
        {
            debug!(
                correlation_id = %correlation_id,
                event_id = %existing_id,
                "idempotent replay"
            );
            return Ok(IngestReceipt {
                event_id: existing_id,
                status: IngestStatus::Duplicate,
                correlation_id,
            });
        }

        // Step 2: tenant gate.
        self.check_deadline(deadline, "tenant_gate")?;
        let tenant = self
            .admin
            .get_tenant(&submission.tenant_id)?
            .ok_or_else(|| IngestError::NotFound {
                entity: "tenant",
                id: submission.tenant_id.clone(),
            })?;
        if !tenant.active {
            return Err(IngestError::TenantInactive {
                tenant_id: tenant.id,
            });
        }

        // Step 3: workflow gate, kill switches included.
        self.check_deadline(deadline, "workflow_gate")?;
        let workflow = self
            .admin
            .get_workflow(&submission.workflow_id)?
            .filter(|wf| wf.tenant_id == submission.tenant_id)
            .ok_or_else(|| IngestError::NotFound {
                entity: "workflow",
                id: submission.workflow_id.clone(),
            })?;
        if !workflow.active {
            return Err(IngestError::WorkflowDisabled {
                workflow_id: workflow.id,
                reason: "workflow inactive".to_string(),
            });
        }
        if let Some(switch) = self
            .admin
            .active_kill_switch(&submission.tenant_id, &submission.workflow_id)?
        {
            let scope = switch
                .workflow_id
                .as_deref()
                .map_or("tenant-wide", |_| "workflow");
            return Err(IngestError::WorkflowDisabled {
                workflow_id: workflow.id,
                reason: format!("{scope} kill switch engaged: {}", switch.reason),
            });
        }

        // Step 4: rate-limit gates. Tenant first, then tenant+vendor.
        self.check_deadline(deadline, "rate_limit_gate")?;
        let vendor = submission.vendor().map(str::to_string);
        let tenant_outcome = self.ratelimit.admit_tenant(&submission.tenant_id).await;
        if tenant_outcome.degraded {
            self.metrics.degraded("rate_limiter");
        }
        if !tenant_outcome.decision.allowed {
            return Err(rate_limited("tenant", &tenant_outcome.decision));
        }
        if let Some(vendor_name) = vendor.as_deref() {
            let vendor_outcome = self
                .ratelimit
                .admit_tenant_vendor(&submission.tenant_id, vendor_name)
                .await;
            if vendor_outcome.degraded {
                self.metrics.degraded("rate_limiter");
            }
            if !vendor_outcome.decision.allowed {
                return Err(rate_limited("tenant_vendor", &vendor_outcome.decision));
            }
        }

        // Step 5: breaker gate (vendor only).
        self.check_deadline(deadline, "breaker_gate")?;
        let mut admitted_as_probe = false;
        if let Some(vendor_name) = vendor.as_deref() {
            let check = self.breaker.check(vendor_name).await;
            if check.degraded {
                self.metrics.degraded("breaker");
            }
            match check.admission {
                Admission::Allow => {},
                Admission::Probe => admitted_as_probe = true,
                Admission::Reject { retry_in } => {
                    return Err(IngestError::BreakerOpen {
                        vendor: vendor_name.to_string(),
                        retry_in_secs: duration_secs(retry_in),
                    });
                },
            }
        }

        // Step 6: persist. The unique index is the last word on
        // duplicates; a constraint hit folds back into the step-1 outcome.
        self.check_deadline(deadline, "persist")?;
        let received_at = self.clock.now();
        let event = StoredEvent::from_submission(
            new_event_id(),
            submission,
            received_at,
            correlation_id.clone(),
        );
        let insert = self.events.insert(&event);

        let (event_id, status) = match insert {
            Ok(EventInsert::Inserted) => (event.id.clone(), IngestStatus::Accepted),
            Ok(EventInsert::Duplicate { existing_id }) => {
                // free the probe slot: this probe never reached the vendor
                if admitted_as_probe {
                    if let Some(vendor_name) = vendor.as_deref() {
                        self.breaker.probe_abandoned(vendor_name).await;
                    }
                }
                return Ok(IngestReceipt {
                    event_id: existing_id,
                    status: IngestStatus::Duplicate,
                    correlation_id,
                });
            },
            Err(err) => {
                warn!(correlation_id = %correlation_id, error = %err, "event persist failed");
                if admitted_as_probe {
                    if let Some(vendor_name) = vendor.as_deref() {
                        self.breaker.probe_abandoned(vendor_name).await;
                    }
                }
                return Err(err.into());
            },
        };

        // The stored event carries the vendor outcome signal: a
        // failure-shaped event against a vendor is that vendor failing.
        if let Some(vendor_name) = vendor.as_deref() {
            let failed = event.is_failure();
            if admitted_as_probe {
                self.breaker.probe_resolved(vendor_name, !failed).await;
            } else if failed {
                self.breaker.record_failure(vendor_name).await;
            } else {
                self.breaker.record_success(vendor_name).await;
            }
            self.metrics
                .set_breaker_state(vendor_name, self.breaker.state(vendor_name).await);
        }

        // Step 7: wake the detector. Fire-and-forget by design.
        self.detector_wakeup.notify_one();

        info!(
            correlation_id = %correlation_id,
            event_id = %event_id,
            tenant_id = %submission.tenant_id,
            workflow_id = %submission.workflow_id,
            event_type = %submission.event_type,
            "event ingested"
        );

        Ok(IngestReceipt {
            event_id,
            status,
            correlation_id,
        })
    }

    fn check_deadline(
        &self,
        deadline: DateTime<Utc>,
        step: &'static str,
    ) -> Result<(), IngestError> {
        if self.clock.now() > deadline {
            return Err(IngestError::DeadlineExceeded { step });
        }
        Ok(())
    }
}

impl std::fmt::Debug for IngestionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionPipeline").finish_non_exhaustive()
    }
}

fn rate_limited(scope: &'static str, decision: &faultline_core::ratelimit::RateDecision) -> IngestError {
    IngestError::RateLimited {
        scope,
        retry_after_secs: decision.retry_after.map_or(1, duration_secs),
    }
}

#[allow(clippy::cast_sign_loss)]
fn duration_secs(duration: chrono::Duration) -> u64 {
    duration.num_seconds().max(1) as u64
}
