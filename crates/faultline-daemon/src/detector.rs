//! Incident detector: the event-to-incident grouping worker.
//!
//! A long-running worker tails the events table past a durable rowid
//! watermark. The ingestion pipeline wakes it on every accepted event,
//! but the watermark is the source of truth: after a crash or a lost
//! wake-up the worker catches up from persisted events on its poll tick.
//!
//! The watermark only advances after an event is fully processed. A
//! transient failure stops the batch without advancing, so the event is
//! reprocessed on the next tick rather than lost.
//!
//! # Grouping rules
//!
//! - An event is a failure iff its type or payload says so (see
//!   `faultline_core::event::is_failure_event`).
//! - Lookup-or-create is serialized by the store's partial unique index:
//!   an insert race folds back into the update path.
//! - Severity upgrades fire at most once per trigger (count crossing 100,
//!   first-to-last span exceeding 1h), capped at `CRITICAL`.
//! - The classifier runs on incident creation and on severity upgrade,
//!   never on plain correlation updates.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration as StdDuration;

use faultline_core::classifier::Classifier;
use faultline_core::clock::{Clock, Jitter};
use faultline_core::config::FaultlineConfig;
use faultline_core::event::StoredEvent;
use faultline_core::fingerprint::{Fingerprinter, UNKNOWN_ERROR_CODE};
use faultline_core::incident::{Incident, IncidentStatus};
use faultline_core::rules::RulesTable;
use faultline_core::types::new_incident_id;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::classifier::classify_or_fallback;
use crate::coordinator::{ActionCoordinator, CoordinatorError};
use crate::metrics::FaultlineMetrics;
use crate::recorder::DecisionRecorder;
use crate::store::{EventStore, IncidentInsert, IncidentStore, Store, StoreError};

/// Watermark identity for this worker.
pub const DETECTOR_WORKER_ID: &str = "incident-detector";

/// Events processed per drain batch.
pub const DETECTOR_BATCH_SIZE: u32 = 100;

/// Correlated events handed to the classifier as context.
const CLASSIFIER_CONTEXT_EVENTS: u32 = 10;

/// Detector failures. All are retryable: the watermark does not advance
/// past a failed event.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DetectorError {
    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Coordinator dispatch failure.
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

/// The grouping worker.
pub struct IncidentDetector {
    store: Store,
    events: EventStore,
    incidents: IncidentStore,
    recorder: Arc<DecisionRecorder>,
    coordinator: Arc<ActionCoordinator>,
    classifier: Arc<dyn Classifier>,
    fingerprinter: Arc<Fingerprinter>,
    rules: Arc<RulesTable>,
    config: Arc<FaultlineConfig>,
    clock: Arc<dyn Clock>,
    jitter: Arc<dyn Jitter>,
    wakeup: Arc<Notify>,
    shutdown: Arc<AtomicBool>,
    metrics: FaultlineMetrics,
}

impl IncidentDetector {
    /// Wires the detector.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        recorder: Arc<DecisionRecorder>,
        coordinator: Arc<ActionCoordinator>,
        classifier: Arc<dyn Classifier>,
        fingerprinter: Arc<Fingerprinter>,
        rules: Arc<RulesTable>,
        config: Arc<FaultlineConfig>,
        clock: Arc<dyn Clock>,
        jitter: Arc<dyn Jitter>,
        wakeup: Arc<Notify>,
        shutdown: Arc<AtomicBool>,
        metrics: FaultlineMetrics,
    ) -> Self {
        Self {
            events: store.events(),
            incidents: store.incidents(),
            store,
            recorder,
            coordinator,
            classifier,
            fingerprinter,
            rules,
            config,
            clock,
            jitter,
            wakeup,
            shutdown,
            metrics,
        }
    }

    /// Runs the worker until shutdown is requested.
    ///
    /// The cadence is wake-up-or-poll: the pipeline's notify arrives
    /// promptly in the happy path, the jittered poll tick is the catch-up
    /// and crash-recovery path.
    pub async fn run(&self) {
        info!(
            worker = DETECTOR_WORKER_ID,
            substitutions = %self.fingerprinter.substitution_set(),
            "incident detector started"
        );

        while !self.shutdown.load(Ordering::SeqCst) {
            match self.drain_once().await {
                Ok(processed) if processed > 0 => {
                    // keep draining while there is work
                    continue;
                },
                Ok(_) => {},
                Err(err) => {
                    warn!(error = %err, "detector drain failed; will retry from watermark");
                },
            }

            let interval = self.jittered_poll_interval();
            tokio::select! {
                () = self.wakeup.notified() => {},
                () = tokio::time::sleep(interval) => {},
            }
        }

        info!(worker = DETECTOR_WORKER_ID, "incident detector stopped");
    }

    /// Drains one batch of events past the watermark. Returns how many
    /// events were processed.
    ///
    /// # Errors
    ///
    /// Returns [`DetectorError`] on the first failing event; the
    /// watermark stays behind it so the event is retried.
    pub async fn drain_once(&self) -> Result<usize, DetectorError> {
        let watermark = self.store.load_watermark(DETECTOR_WORKER_ID)?;
        let batch = self.events.read_after(watermark, DETECTOR_BATCH_SIZE)?;
        if batch.is_empty() {
            return Ok(0);
        }

        let mut processed = 0;
        for (rowid, event) in batch {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            self.process_event(&event).await?;
            self.store
                .store_watermark(DETECTOR_WORKER_ID, rowid, self.clock.now())?;
            processed += 1;
        }

        if let Ok(open) = self.incidents.count_open() {
            self.metrics.set_incidents_open(open);
        }
        Ok(processed)
    }

    /// Processes one stored event. Returns the touched incident, if the
    /// event was a failure.
    ///
    /// # Errors
    ///
    /// Returns [`DetectorError`] on store or dispatch failure.
    pub async fn process_event(
        &self,
        event: &StoredEvent,
    ) -> Result<Option<Incident>, DetectorError> {
        let lag = (self.clock.now() - event.received_at).num_milliseconds();
        #[allow(clippy::cast_precision_loss)]
        self.metrics.observe_detection_lag(lag as f64 / 1000.0);

        if !event.is_failure() {
            return Ok(None);
        }

        let error_code = event.error_code().unwrap_or(UNKNOWN_ERROR_CODE);
        let signature =
            self.fingerprinter
                .fingerprint(&event.event_type, Some(error_code), &event.workflow_id);

        // Lookup-or-create, with the partial unique index as tiebreaker.
        // One retry suffices: a lost insert race means the row now exists.
        for _ in 0..2 {
            if let Some(existing) = self.incidents.find_open(
                &event.tenant_id,
                &event.workflow_id,
                &signature,
            )? {
                return Ok(Some(self.correlate(&existing, event).await?));
            }

            let incident = self.build_incident(event, &signature, error_code);
            match self.incidents.insert(&incident, &event.id)? {
                IncidentInsert::Created => {
                    self.mark_analyzing(&incident.id);
                    let incident = self
                        .incidents
                        .get(&incident.id)?
                        .unwrap_or(incident);
                    self.classify_and_dispatch(&incident).await?;
                    return Ok(Some(incident));
                },
                IncidentInsert::Raced => {
                    debug!(signature = %signature, "lost incident-create race, re-reading");
                },
            }
        }

        Err(DetectorError::Store(StoreError::Corrupt {
            table: "incidents",
            message: format!("lookup-or-create did not converge for {signature}"),
        }))
    }

    async fn correlate(
        &self,
        existing: &Incident,
        event: &StoredEvent,
    ) -> Result<Incident, DetectorError> {
        let updated = self
            .incidents
            .record_event(&existing.id, &event.id, event.occurred_at)?;

        if let Some(flag) = updated.due_severity_upgrade() {
            let upgraded = updated.severity.escalated();
            self.incidents
                .upgrade_severity(&updated.id, upgraded, flag)?;
            let refreshed = self.incidents.get(&updated.id)?.unwrap_or(updated);
            self.classify_and_dispatch(&refreshed).await?;
            return Ok(refreshed);
        }

        // No new decision cycle on a plain correlation update, but if an
        // action is in flight the suppression is still audited.
        if self.coordinator_has_in_flight(&updated.id)? {
            self.recorder.record_suppression(&updated.id)?;
        }
        Ok(updated)
    }

    fn coordinator_has_in_flight(&self, incident_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .store
            .actions()
            .in_flight_for(incident_id)?
            .is_some())
    }

    fn build_incident(&self, event: &StoredEvent, signature: &str, error_code: &str) -> Incident {
        let severity = self.rules.lookup(error_code).severity;
        Incident {
            id: new_incident_id(),
            tenant_id: event.tenant_id.clone(),
            workflow_id: event.workflow_id.clone(),
            signature: signature.to_string(),
            title: format!("{}: {}", event.event_type, error_code),
            status: IncidentStatus::New,
            severity,
            event_count: 1,
            first_seen_at: event.occurred_at,
            last_seen_at: event.occurred_at,
            retry_count: 0,
            metadata: json!({
                "error_code": error_code,
                "event_type": event.event_type,
                "vendor": event.vendor,
                "signature_digest": self.fingerprinter.digest(signature),
                "triggering_event_id": event.id,
                "correlation_id": event.correlation_id.as_str(),
            }),
        }
    }

    async fn classify_and_dispatch(&self, incident: &Incident) -> Result<(), DetectorError> {
        let recent = self
            .events
            .recent_for_incident(&incident.id, CLASSIFIER_CONTEXT_EVENTS)?;
        let timeout = StdDuration::from_secs(self.config.pipeline.classifier_timeout_secs);
        let classification =
            classify_or_fallback(self.classifier.as_ref(), incident, &recent, timeout).await;

        self.recorder
            .record_classification(incident, &classification)?;
        self.coordinator
            .on_decision(incident, &classification)
            .await?;
        Ok(())
    }

    fn mark_analyzing(&self, incident_id: &str) {
        match self.incidents.update_status(
            incident_id,
            IncidentStatus::New,
            IncidentStatus::Analyzing,
        ) {
            Ok(()) | Err(StoreError::StaleTransition { .. }) => {},
            Err(err) => {
                warn!(incident_id = %incident_id, error = %err, "failed to mark incident analyzing");
            },
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn jittered_poll_interval(&self) -> StdDuration {
        let base = self.config.pipeline.detector_poll_interval_ms;
        #[allow(clippy::cast_precision_loss)]
        let smeared = base as f64 * self.jitter.uniform(0.8, 1.2);
        StdDuration::from_millis(smeared.max(1.0) as u64)
    }
}

impl std::fmt::Debug for IncidentDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncidentDetector").finish_non_exhaustive()
    }
}
