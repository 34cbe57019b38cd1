//! The action coordinator.
//!
//! Turns a recorded decision into at most one remediation action per
//! incident, under the selection policy:
//!
//! | Condition | Action |
//! |-----------|--------|
//! | recommendation is retry, budgets permit, rules retryable, severity below critical | `RETRY` |
//! | budget exhausted, non-retryable, or severity critical | `ESCALATE` |
//! | recommendation is manual review | `MANUAL` |
//!
//! Single-flight is enforced twice: a pre-check against the store, and
//! the partial unique index as the authoritative arbiter for races. A
//! suppressed action is audited as a decision note, never silently
//! dropped.
//!
//! Remediation failures are never propagated to any caller; they flow
//! into the audit trail and the next selection cycle only.

use std::sync::Arc;

use chrono::Duration;
use faultline_core::action::{Action, ActionKind, ActionStatus, EscalationLevel};
use faultline_core::classifier::{Classification, Recommendation};
use faultline_core::clock::{Clock, Jitter};
use faultline_core::config::FaultlineConfig;
use faultline_core::fingerprint::UNKNOWN_ERROR_CODE;
use faultline_core::incident::{Incident, IncidentStatus};
use faultline_core::rules::RulesTable;
use faultline_core::types::{Severity, new_action_id};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::recorder::DecisionRecorder;
use crate::safety::RetryBudget;
use crate::store::{ActionInsert, ActionStore, IncidentStore, StoreError};

// =============================================================================
// Errors
// =============================================================================

/// Coordinator failures (all store-shaped; policy outcomes are values).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoordinatorError {
    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why a reversal request was refused.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReversalError {
    /// No such action.
    #[error("action not found: {action_id}")]
    NotFound {
        /// The requested action.
        action_id: String,
    },

    /// The action is not reversible (kind, flag, or status).
    #[error("action {action_id} is not reversible: {reason}")]
    NotReversible {
        /// The requested action.
        action_id: String,
        /// Which condition failed.
        reason: &'static str,
    },

    /// A reversal already exists for this action.
    #[error("action {action_id} is already reversed")]
    AlreadyReversed {
        /// The requested action.
        action_id: String,
    },

    /// A later action on the incident has progressed past `PENDING`.
    #[error("a later action on incident {incident_id} has already progressed")]
    LaterActionProgressed {
        /// The incident involved.
        incident_id: String,
    },

    /// Another action is in flight on the incident.
    #[error("an action is already in flight on incident {incident_id}")]
    InFlight {
        /// The incident involved.
        incident_id: String,
    },

    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

// =============================================================================
// Coordinator
// =============================================================================

/// Selects, creates, and follows up remediation actions.
pub struct ActionCoordinator {
    actions: ActionStore,
    incidents: IncidentStore,
    recorder: Arc<DecisionRecorder>,
    budget: Arc<RetryBudget>,
    rules: Arc<RulesTable>,
    config: Arc<FaultlineConfig>,
    clock: Arc<dyn Clock>,
    jitter: Arc<dyn Jitter>,
}

impl ActionCoordinator {
    /// Wires the coordinator.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        actions: ActionStore,
        incidents: IncidentStore,
        recorder: Arc<DecisionRecorder>,
        budget: Arc<RetryBudget>,
        rules: Arc<RulesTable>,
        config: Arc<FaultlineConfig>,
        clock: Arc<dyn Clock>,
        jitter: Arc<dyn Jitter>,
    ) -> Self {
        Self {
            actions,
            incidents,
            recorder,
            budget,
            rules,
            config,
            clock,
            jitter,
        }
    }

    /// Handles a freshly recorded decision for an incident.
    ///
    /// Returns the created action, or `None` when single-flight
    /// suppressed it (a suppression note is recorded either way).
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError`] only on store failure.
    pub async fn on_decision(
        &self,
        incident: &Incident,
        classification: &Classification,
    ) -> Result<Option<Action>, CoordinatorError> {
        if self.actions.in_flight_for(&incident.id)?.is_some() {
            debug!(incident_id = %incident.id, "action suppressed: one already in flight");
            self.recorder.record_suppression(&incident.id)?;
            return Ok(None);
        }

        let kind = self.select(incident, classification).await;
        let action = match kind {
            ActionKind::Retry => self.build_retry(incident),
            ActionKind::Escalate => self.build_escalation(incident),
            ActionKind::Manual => self.build_manual(incident, classification),
            ActionKind::Reversal => unreachable!("selection never yields a reversal"),
        };

        self.create(incident, action)
    }

    /// Follows up a terminal action outcome from the scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError`] only on store failure.
    pub async fn on_action_outcome(
        &self,
        action: &Action,
        success: bool,
    ) -> Result<(), CoordinatorError> {
        if success {
            match action.kind {
                ActionKind::Retry | ActionKind::Reversal => {
                    self.resolve_incident(&action.incident_id);
                },
                ActionKind::Escalate | ActionKind::Manual => {
                    // humans own the incident from here
                },
            }
            return Ok(());
        }

        match action.kind {
            ActionKind::Retry => self.handle_retry_failure(action).await?,
            ActionKind::Escalate => {
                // never auto-retried; the FAILED row is the record
                error!(
                    action_id = %action.id,
                    incident_id = %action.incident_id,
                    "escalation dispatch failed"
                );
            },
            ActionKind::Manual | ActionKind::Reversal => {
                warn!(
                    action_id = %action.id,
                    incident_id = %action.incident_id,
                    kind = %action.kind,
                    "action failed"
                );
            },
        }
        Ok(())
    }

    /// Requests a reversal of a previously succeeded reversible action.
    ///
    /// # Errors
    ///
    /// Returns [`ReversalError`] naming the failed precondition.
    pub async fn reverse(&self, action_id: &str) -> Result<Action, ReversalError> {
        let prior = self
            .actions
            .get(action_id)?
            .ok_or_else(|| ReversalError::NotFound {
                action_id: action_id.to_string(),
            })?;

        if prior.kind == ActionKind::Escalate {
            return Err(ReversalError::NotReversible {
                action_id: action_id.to_string(),
                reason: "escalations are never reversible",
            });
        }
        if !prior.reversible {
            return Err(ReversalError::NotReversible {
                action_id: action_id.to_string(),
                reason: "action is not flagged reversible",
            });
        }
        if prior.status != ActionStatus::Succeeded {
            return Err(ReversalError::NotReversible {
                action_id: action_id.to_string(),
                reason: "only succeeded actions can be reversed",
            });
        }
        if self.actions.reversal_exists_for(action_id)? {
            return Err(ReversalError::AlreadyReversed {
                action_id: action_id.to_string(),
            });
        }
        if self
            .actions
            .later_action_progressed(&prior.incident_id, prior.created_at)?
        {
            return Err(ReversalError::LaterActionProgressed {
                incident_id: prior.incident_id.clone(),
            });
        }

        let now = self.clock.now();
        let reversal = Action {
            id: new_action_id(),
            incident_id: prior.incident_id.clone(),
            kind: ActionKind::Reversal,
            status: ActionStatus::Pending,
            parameters: json!({ "reverses": prior.id }),
            result: None,
            reversible: false,
            reversal_of: Some(prior.id.clone()),
            scheduled_for: Some(now),
            attempt_number: 1,
            created_at: now,
            completed_at: None,
        };

        match self.actions.insert(&reversal)? {
            ActionInsert::Created => {
                self.recorder.record_note(
                    &prior.incident_id,
                    format!("reversal_requested:{}", prior.id),
                    "coordinator",
                )?;
                info!(
                    action_id = %reversal.id,
                    reverses = %prior.id,
                    incident_id = %prior.incident_id,
                    "reversal scheduled"
                );
                Ok(reversal)
            },
            ActionInsert::SingleFlightConflict => Err(ReversalError::InFlight {
                incident_id: prior.incident_id,
            }),
        }
    }

    // =========================================================================
    // Selection
    // =========================================================================

    async fn select(&self, incident: &Incident, classification: &Classification) -> ActionKind {
        if classification.recommended == Recommendation::Manual {
            return ActionKind::Manual;
        }

        let rule = self.rules.lookup(self.error_code(incident));
        let policy = self.config.retry_policy(&rule.retry_policy);

        let retry_permitted = classification.recommended == Recommendation::Retry
            && incident.severity < Severity::Critical
            && rule.retryable
            && policy.retryable
            && self.budget.permit_workflow_retry(incident)
            && self.vendor_activity_permitted(incident).await;

        if retry_permitted {
            ActionKind::Retry
        } else {
            ActionKind::Escalate
        }
    }

    async fn vendor_activity_permitted(&self, incident: &Incident) -> bool {
        match incident.metadata_str("vendor") {
            Some(vendor) => self.budget.permit_vendor_activity(vendor).await,
            None => true,
        }
    }

    fn error_code<'a>(&self, incident: &'a Incident) -> &'a str {
        incident
            .metadata_str("error_code")
            .unwrap_or(UNKNOWN_ERROR_CODE)
    }

    // =========================================================================
    // Action construction
    // =========================================================================

    fn build_retry(&self, incident: &Incident) -> Action {
        let rule = self.rules.lookup(self.error_code(incident));
        let policy = self.config.retry_policy(&rule.retry_policy);
        let attempt = incident.retry_count + 1;
        let delay = policy.backoff_for_attempt(attempt, self.jitter.as_ref());
        let now = self.clock.now();

        Action {
            id: new_action_id(),
            incident_id: incident.id.clone(),
            kind: ActionKind::Retry,
            status: ActionStatus::Pending,
            parameters: json!({
                "policy": policy.name,
                "delay_ms": delay.num_milliseconds(),
                "vendor": incident.metadata_str("vendor"),
            }),
            result: None,
            reversible: true,
            reversal_of: None,
            scheduled_for: Some(now + delay),
            attempt_number: attempt,
            created_at: now,
            completed_at: None,
        }
    }

    fn build_escalation(&self, incident: &Incident) -> Action {
        let level = EscalationLevel::for_severity(incident.severity);
        let now = self.clock.now();
        Action {
            id: new_action_id(),
            incident_id: incident.id.clone(),
            kind: ActionKind::Escalate,
            status: ActionStatus::Pending,
            parameters: json!({
                "level": level.as_number(),
                "channels": level.channels(),
            }),
            result: None,
            reversible: false,
            reversal_of: None,
            scheduled_for: Some(now),
            attempt_number: 1,
            created_at: now,
            completed_at: None,
        }
    }

    fn build_manual(&self, incident: &Incident, classification: &Classification) -> Action {
        let now = self.clock.now();
        Action {
            id: new_action_id(),
            incident_id: incident.id.clone(),
            kind: ActionKind::Manual,
            status: ActionStatus::Pending,
            parameters: json!({ "reason": classification.reasoning }),
            result: None,
            reversible: false,
            reversal_of: None,
            scheduled_for: Some(now),
            attempt_number: 1,
            created_at: now,
            completed_at: None,
        }
    }

    fn create(
        &self,
        incident: &Incident,
        action: Action,
    ) -> Result<Option<Action>, CoordinatorError> {
        match self.actions.insert(&action)? {
            ActionInsert::Created => {
                self.mark_actioned(&incident.id);
                info!(
                    action_id = %action.id,
                    incident_id = %incident.id,
                    kind = %action.kind,
                    scheduled_for = ?action.scheduled_for,
                    attempt = action.attempt_number,
                    "action created"
                );
                Ok(Some(action))
            },
            ActionInsert::SingleFlightConflict => {
                debug!(incident_id = %incident.id, "action suppressed by single-flight index");
                self.recorder.record_suppression(&incident.id)?;
                Ok(None)
            },
        }
    }

    // =========================================================================
    // Follow-up
    // =========================================================================

    async fn handle_retry_failure(&self, action: &Action) -> Result<(), CoordinatorError> {
        let charged = self.incidents.increment_retry_count(&action.incident_id)?;
        let Some(incident) = self.incidents.get(&action.incident_id)? else {
            return Ok(());
        };

        let rule = self.rules.lookup(self.error_code(&incident));
        let policy = self.config.retry_policy(&rule.retry_policy);
        let within_budget = self.budget.permit_workflow_retry(&incident)
            && self.vendor_activity_permitted(&incident).await;

        if within_budget && rule.retryable && policy.retryable {
            self.recorder.record_note(
                &incident.id,
                format!("retry_failed:attempt_{charged};rescheduling"),
                "coordinator",
            )?;
            let next = self.build_retry(&incident);
            self.create(&incident, next)?;
        } else {
            self.recorder.record_note(
                &incident.id,
                format!("retry_failed:attempt_{charged};budget_exhausted"),
                "coordinator",
            )?;
            let escalation = self.build_escalation(&incident);
            self.create(&incident, escalation)?;
        }
        Ok(())
    }

    fn resolve_incident(&self, incident_id: &str) {
        match self.incidents.update_status(
            incident_id,
            IncidentStatus::Actioned,
            IncidentStatus::Resolved,
        ) {
            Ok(()) => info!(incident_id = %incident_id, "incident resolved"),
            Err(StoreError::StaleTransition { .. }) => {
                // somebody else (operator, ignore path) moved it first
            },
            Err(err) => {
                warn!(incident_id = %incident_id, error = %err, "failed to resolve incident");
            },
        }
    }

    fn mark_actioned(&self, incident_id: &str) {
        match self.incidents.update_status(
            incident_id,
            IncidentStatus::Analyzing,
            IncidentStatus::Actioned,
        ) {
            Ok(()) | Err(StoreError::StaleTransition { .. }) => {},
            Err(err) => {
                warn!(incident_id = %incident_id, error = %err, "failed to mark incident actioned");
            },
        }
    }
}

impl std::fmt::Debug for ActionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionCoordinator").finish_non_exhaustive()
    }
}

/// The delay a retry policy would produce without jitter, exposed for
/// operator tooling that previews schedules.
#[must_use]
pub fn preview_backoff(config: &FaultlineConfig, policy_name: &str, attempt: u32) -> Duration {
    let policy = config.retry_policy(policy_name);
    policy.backoff_for_attempt(attempt, &faultline_core::clock::FixedJitter(0.0))
}
