//! The action scheduler: a background worker that drives pending actions
//! through the state machine.
//!
//! The loop polls `PENDING` actions whose `scheduled_for` has arrived
//! (bounded interval, jittered to avoid multi-instance stampedes), claims
//! each with the optimistic `PENDING -> IN_PROGRESS` transition, invokes
//! the executor, and records the terminal status. Shutdown is checked
//! between actions, never mid-action: an in-flight execution always
//! reaches a terminal state or stays claimed for crash recovery.
//!
//! Effecting an action is delegated to an [`ActionExecutor`]. The daemon
//! wires [`AckDispatchExecutor`], which hands work to external dispatch
//! and reports acknowledgment; tests script their own executors.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration as StdDuration;

use faultline_core::action::{Action, ActionKind, ActionStatus};
use faultline_core::classifier::BoxFuture;
use faultline_core::clock::{Clock, Jitter};
use faultline_core::config::FaultlineConfig;
use faultline_core::incident::Incident;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::coordinator::{ActionCoordinator, CoordinatorError};
use crate::metrics::FaultlineMetrics;
use crate::safety::{BreakerManager, RateLimiter};
use crate::store::{ActionStore, IncidentStore, StoreError};

/// Due actions claimed per tick.
pub const SCHEDULER_BATCH_SIZE: u32 = 32;

// =============================================================================
// Executor contract
// =============================================================================

/// Executor failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExecutorError {
    /// The dispatch target rejected or never acknowledged the action.
    #[error("dispatch failed: {message}")]
    Dispatch {
        /// Target-reported detail.
        message: String,
    },
}

/// Effects one action. Implementations return the result payload stored
/// on the succeeded row.
pub trait ActionExecutor: Send + Sync {
    /// Executes the action for its incident.
    fn execute<'a>(
        &'a self,
        action: &'a Action,
        incident: &'a Incident,
    ) -> BoxFuture<'a, Result<Value, ExecutorError>>;
}

/// The default executor: records dispatch intent and acknowledges.
///
/// Faultline does not own delivery channels; retries are replayed by the
/// workflow engine and escalations are delivered by the paging stack.
/// This executor is the durable handshake with those systems: the action
/// is acknowledged as handed off, and the handoff parameters are the
/// result payload.
#[derive(Debug, Default)]
pub struct AckDispatchExecutor;

impl ActionExecutor for AckDispatchExecutor {
    fn execute<'a>(
        &'a self,
        action: &'a Action,
        incident: &'a Incident,
    ) -> BoxFuture<'a, Result<Value, ExecutorError>> {
        Box::pin(async move {
            match action.kind {
                ActionKind::Retry => {
                    info!(
                        action_id = %action.id,
                        incident_id = %incident.id,
                        workflow_id = %incident.workflow_id,
                        attempt = action.attempt_number,
                        "replay handed to workflow engine"
                    );
                    Ok(json!({"replay_dispatched": true, "attempt": action.attempt_number}))
                },
                ActionKind::Escalate => {
                    let channels = action
                        .parameters
                        .get("channels")
                        .cloned()
                        .unwrap_or_else(|| json!([]));
                    info!(
                        action_id = %action.id,
                        incident_id = %incident.id,
                        channels = %channels,
                        "escalation handed to notification dispatch"
                    );
                    Ok(json!({"notified": channels}))
                },
                ActionKind::Manual => {
                    info!(
                        action_id = %action.id,
                        incident_id = %incident.id,
                        "manual review requested"
                    );
                    Ok(json!({"review_requested": true}))
                },
                ActionKind::Reversal => {
                    info!(
                        action_id = %action.id,
                        incident_id = %incident.id,
                        reverses = ?action.reversal_of,
                        "reversal handed to workflow engine"
                    );
                    Ok(json!({"reversal_dispatched": true, "reverses": action.reversal_of}))
                },
            }
        })
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// Scheduler failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SchedulerError {
    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Coordinator follow-up failure.
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

/// The background action scheduler.
pub struct ActionScheduler {
    actions: ActionStore,
    incidents: IncidentStore,
    coordinator: Arc<ActionCoordinator>,
    executor: Arc<dyn ActionExecutor>,
    breaker: Arc<BreakerManager>,
    ratelimit: Arc<RateLimiter>,
    config: Arc<FaultlineConfig>,
    clock: Arc<dyn Clock>,
    jitter: Arc<dyn Jitter>,
    shutdown: Arc<AtomicBool>,
    metrics: FaultlineMetrics,
}

impl ActionScheduler {
    /// Wires the scheduler.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        actions: ActionStore,
        incidents: IncidentStore,
        coordinator: Arc<ActionCoordinator>,
        executor: Arc<dyn ActionExecutor>,
        breaker: Arc<BreakerManager>,
        ratelimit: Arc<RateLimiter>,
        config: Arc<FaultlineConfig>,
        clock: Arc<dyn Clock>,
        jitter: Arc<dyn Jitter>,
        shutdown: Arc<AtomicBool>,
        metrics: FaultlineMetrics,
    ) -> Self {
        Self {
            actions,
            incidents,
            coordinator,
            executor,
            breaker,
            ratelimit,
            config,
            clock,
            jitter,
            shutdown,
            metrics,
        }
    }

    /// Runs the scheduler until shutdown is requested.
    pub async fn run(&self) {
        info!("action scheduler started");
        while !self.shutdown.load(Ordering::SeqCst) {
            if let Err(err) = self.tick_once().await {
                warn!(error = %err, "scheduler tick failed");
            }
            tokio::time::sleep(self.jittered_poll_interval()).await;
        }
        info!("action scheduler stopped");
    }

    /// Processes one batch of due actions. Returns how many reached a
    /// terminal status.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError`] on store failure while listing; per-
    /// action failures are recorded on the action itself.
    pub async fn tick_once(&self) -> Result<usize, SchedulerError> {
        let due = self
            .actions
            .due_pending(self.clock.now(), SCHEDULER_BATCH_SIZE)?;
        let mut completed = 0;
        for action in due {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            if self.execute_one(action).await? {
                completed += 1;
            }
        }
        Ok(completed)
    }

    /// Claims and executes one action. Returns `false` when the action
    /// was skipped (claimed elsewhere, or deferred by a gate).
    async fn execute_one(&self, action: Action) -> Result<bool, SchedulerError> {
        let Some(incident) = self.incidents.get(&action.incident_id)? else {
            warn!(
                action_id = %action.id,
                incident_id = %action.incident_id,
                "action references a missing incident"
            );
            return Ok(false);
        };

        // Replays consume workflow rate budget; an exhausted window just
        // defers the action to a later tick (it stays PENDING).
        if action.kind == ActionKind::Retry {
            let outcome = self.ratelimit.admit_workflow(&incident.workflow_id).await;
            if outcome.degraded {
                self.metrics.degraded("rate_limiter");
            }
            if !outcome.decision.allowed {
                debug!(
                    action_id = %action.id,
                    workflow_id = %incident.workflow_id,
                    "replay deferred by workflow rate limit"
                );
                return Ok(false);
            }
        }

        let claimed = match self.actions.transition(
            &action.id,
            ActionStatus::Pending,
            ActionStatus::InProgress,
            None,
            None,
        ) {
            Ok(claimed) => claimed,
            Err(StoreError::StaleTransition { .. }) => {
                // another instance claimed it first
                return Ok(false);
            },
            Err(err) => return Err(err.into()),
        };

        let outcome = self.executor.execute(&claimed, &incident).await;
        let vendor = claimed
            .parameters
            .get("vendor")
            .and_then(Value::as_str)
            .map(str::to_string);

        match outcome {
            Ok(result) => {
                let done = self.actions.transition(
                    &claimed.id,
                    ActionStatus::InProgress,
                    ActionStatus::Succeeded,
                    Some(&result),
                    Some(self.clock.now()),
                )?;
                self.metrics
                    .action_completed(done.kind.as_str(), done.status.as_str());
                if let Some(vendor) = vendor.as_deref() {
                    self.breaker.record_success(vendor).await;
                }
                self.coordinator.on_action_outcome(&done, true).await?;
            },
            Err(err) => {
                let failed = self.actions.transition(
                    &claimed.id,
                    ActionStatus::InProgress,
                    ActionStatus::Failed,
                    Some(&json!({"error": err.to_string()})),
                    Some(self.clock.now()),
                )?;
                self.metrics
                    .action_completed(failed.kind.as_str(), failed.status.as_str());
                if let Some(vendor) = vendor.as_deref() {
                    self.breaker.record_failure(vendor).await;
                }
                self.coordinator.on_action_outcome(&failed, false).await?;
            },
        }
        Ok(true)
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn jittered_poll_interval(&self) -> StdDuration {
        let base = self.config.pipeline.scheduler_poll_interval_ms;
        #[allow(clippy::cast_precision_loss)]
        let smeared = base as f64 * self.jitter.uniform(0.8, 1.2);
        StdDuration::from_millis(smeared.max(1.0) as u64)
    }
}

impl std::fmt::Debug for ActionScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionScheduler").finish_non_exhaustive()
    }
}
