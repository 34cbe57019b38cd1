//! Remediation actions and their state machine.
//!
//! Exactly one action per incident may be in flight (`PENDING` or
//! `IN_PROGRESS`) at a time; the daemon enforces that single-flight
//! invariant at the store. This module owns the per-action lifecycle:
//!
//! ```text
//! PENDING -> IN_PROGRESS -> SUCCEEDED | FAILED
//! ```
//!
//! No other transition is legal. A `FAILED` action is terminal; follow-up
//! work is a *new* action, never a resurrection of the failed one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::Severity;

/// Kinds of remediation actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    /// Replay the failed work after a backoff delay.
    Retry,
    /// Notify humans through an escalation channel set.
    Escalate,
    /// Request human review without an escalation page.
    Manual,
    /// Semantically undo a prior succeeded reversible action.
    Reversal,
}

impl ActionKind {
    /// Storage identifier for the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Retry => "RETRY",
            Self::Escalate => "ESCALATE",
            Self::Manual => "MANUAL",
            Self::Reversal => "REVERSAL",
        }
    }

    /// Parses a storage identifier.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "RETRY" => Some(Self::Retry),
            "ESCALATE" => Some(Self::Escalate),
            "MANUAL" => Some(Self::Manual),
            "REVERSAL" => Some(Self::Reversal),
            _ => None,
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action execution states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    /// Created, waiting for its `scheduled_for` instant.
    Pending,
    /// Picked up by the scheduler; execution in progress.
    InProgress,
    /// Execution completed successfully; terminal.
    Succeeded,
    /// Execution failed; terminal.
    Failed,
}

impl ActionStatus {
    /// Storage identifier for the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }

    /// Parses a storage identifier.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(Self::Pending),
            "IN_PROGRESS" => Some(Self::InProgress),
            "SUCCEEDED" => Some(Self::Succeeded),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Returns `true` for terminal states.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Returns `true` for in-flight states (the single-flight set).
    #[must_use]
    pub const fn is_in_flight(self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }

    /// Returns `true` if `self -> to` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::InProgress)
                | (Self::InProgress, Self::Succeeded | Self::Failed)
        )
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An illegal action transition was attempted.
///
/// This is an invariant violation: the offending action is flagged for
/// operator review and the process keeps serving other work.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal action transition {from} -> {to}")]
pub struct IllegalActionTransition {
    /// Current status.
    pub from: ActionStatus,
    /// Requested status.
    pub to: ActionStatus,
}

/// Escalation levels and their notification channel sets.
///
/// The coordinator records the intended channels in the action's
/// parameters; effecting them is an external dispatcher's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EscalationLevel {
    /// Level 1: team notification.
    Team,
    /// Level 2: on-call page.
    OnCall,
    /// Level 3: management escalation.
    Management,
}

impl EscalationLevel {
    /// Picks the escalation level for a severity.
    #[must_use]
    pub const fn for_severity(severity: Severity) -> Self {
        match severity {
            Severity::Low | Severity::Medium => Self::Team,
            Severity::High => Self::OnCall,
            Severity::Critical => Self::Management,
        }
    }

    /// Numeric level (1-3).
    #[must_use]
    pub const fn as_number(self) -> u8 {
        match self {
            Self::Team => 1,
            Self::OnCall => 2,
            Self::Management => 3,
        }
    }

    /// Channel set for the level. Higher levels include the lower ones.
    #[must_use]
    pub const fn channels(self) -> &'static [&'static str] {
        match self {
            Self::Team => &["team_notification"],
            Self::OnCall => &["team_notification", "oncall_page"],
            Self::Management => &["team_notification", "oncall_page", "management_escalation"],
        }
    }
}

/// A remediation action row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Opaque action identifier (`ACT-...`).
    pub id: String,
    /// Incident the action remediates.
    pub incident_id: String,
    /// What the action does.
    pub kind: ActionKind,
    /// Execution status.
    pub status: ActionStatus,
    /// Kind-specific parameters (policy, delay, channels, ...).
    pub parameters: Value,
    /// Execution result, set on completion.
    pub result: Option<Value>,
    /// Whether the action can be reversed after success.
    pub reversible: bool,
    /// For `Reversal` actions: the action being undone.
    pub reversal_of: Option<String>,
    /// When the scheduler should pick the action up.
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Which attempt this is (1-indexed; retries count up).
    pub attempt_number: u32,
    /// When the action row was created.
    pub created_at: DateTime<Utc>,
    /// When the action reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Action {
    /// Validates and applies a status transition.
    ///
    /// # Errors
    ///
    /// Returns [`IllegalActionTransition`] when the pair is not legal;
    /// the action is left unchanged.
    pub fn transition_to(&mut self, to: ActionStatus) -> Result<(), IllegalActionTransition> {
        if !self.status.can_transition_to(to) {
            return Err(IllegalActionTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Returns `true` if this action could still be reversed, judged only
    /// by its own fields (kind, flag, status). The coordinator additionally
    /// checks that no later action has progressed.
    #[must_use]
    pub fn self_reversible(&self) -> bool {
        self.reversible
            && self.kind != ActionKind::Escalate
            && self.status == ActionStatus::Succeeded
    }
}
