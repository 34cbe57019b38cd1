//! Action repository.
//!
//! Two constraints do the heavy lifting here:
//!
//! - the partial unique index over in-flight rows enforces single-flight
//!   per incident at the storage layer, and
//! - status transitions are optimistic (`UPDATE ... WHERE status = from`),
//!   so a racing transition loses cleanly instead of corrupting state.
//!
//! An illegal transition request never touches the row's status; the row
//! is flagged `invariant_violation` for operator review and the process
//! keeps serving other work.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use faultline_core::action::{Action, ActionKind, ActionStatus};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, error, info};

use super::{StoreError, is_unique_violation, lock, parse_ts, to_ts};

/// Outcome of an action insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionInsert {
    /// The action row was created.
    Created,
    /// An in-flight action already exists for the incident.
    SingleFlightConflict,
}

/// Action repository.
#[derive(Debug)]
pub struct ActionStore {
    conn: Arc<Mutex<Connection>>,
}

impl ActionStore {
    /// Creates a repository over the shared connection.
    #[must_use]
    pub const fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Inserts a new action. The single-flight index is the arbiter: a
    /// second in-flight action for the same incident maps to
    /// [`ActionInsert::SingleFlightConflict`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on any other database failure.
    pub fn insert(&self, action: &Action) -> Result<ActionInsert, StoreError> {
        let conn = lock(&self.conn)?;
        let result = conn.execute(
            "INSERT INTO actions (id, incident_id, kind, status, parameters, result,
                                  reversible, reversal_of, scheduled_for, attempt_number,
                                  created_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                action.id,
                action.incident_id,
                action.kind.as_str(),
                action.status.as_str(),
                action.parameters.to_string(),
                action.result.as_ref().map(ToString::to_string),
                action.reversible,
                action.reversal_of,
                action.scheduled_for.map(to_ts),
                action.attempt_number,
                to_ts(action.created_at),
                action.completed_at.map(to_ts),
            ],
        );

        match result {
            Ok(_) => {
                debug!(
                    action_id = %action.id,
                    incident_id = %action.incident_id,
                    kind = %action.kind,
                    "created action"
                );
                Ok(ActionInsert::Created)
            },
            Err(err) if is_unique_violation(&err) => Ok(ActionInsert::SingleFlightConflict),
            Err(err) => Err(err.into()),
        }
    }

    /// Fetches one action by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query or decode failure.
    pub fn get(&self, action_id: &str) -> Result<Option<Action>, StoreError> {
        let conn = lock(&self.conn)?;
        let raw = conn
            .query_row(
                &format!("{SELECT_SQL} WHERE id = ?1"),
                params![action_id],
                row_to_raw,
            )
            .optional()?;
        raw.map(decode_action).transpose()
    }

    /// Returns the in-flight (`PENDING` or `IN_PROGRESS`) action for an
    /// incident, if one exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query or decode failure.
    pub fn in_flight_for(&self, incident_id: &str) -> Result<Option<Action>, StoreError> {
        let conn = lock(&self.conn)?;
        let raw = conn
            .query_row(
                &format!(
                    "{SELECT_SQL} WHERE incident_id = ?1 AND status IN ('PENDING', 'IN_PROGRESS')"
                ),
                params![incident_id],
                row_to_raw,
            )
            .optional()?;
        raw.map(decode_action).transpose()
    }

    /// Pending actions whose `scheduled_for` has arrived, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query or decode failure.
    pub fn due_pending(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Action>, StoreError> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(&format!(
            "{SELECT_SQL} WHERE status = 'PENDING'
               AND (scheduled_for IS NULL OR scheduled_for <= ?1)
             ORDER BY scheduled_for ASC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![to_ts(now), limit], row_to_raw)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(decode_action(row?)?);
        }
        Ok(out)
    }

    /// Applies a validated, optimistic status transition.
    ///
    /// The legal-transition check runs first; an illegal pair flags the
    /// row as an invariant violation and returns the transition error
    /// without touching the status. A legal pair that loses the optimistic
    /// race returns [`StoreError::StaleTransition`].
    ///
    /// # Errors
    ///
    /// See above; plus database failures.
    pub fn transition(
        &self,
        action_id: &str,
        from: ActionStatus,
        to: ActionStatus,
        result: Option<&serde_json::Value>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<Action, StoreError> {
        if !from.can_transition_to(to) {
            error!(
                action_id = %action_id,
                from = %from,
                to = %to,
                "illegal action transition requested"
            );
            self.flag_invariant_violation(action_id, &format!("illegal transition {from} -> {to}"))?;
            return Err(StoreError::StaleTransition {
                entity: "action",
                id: action_id.to_string(),
                expected: format!("legal transition from {from}"),
            });
        }

        let conn = lock(&self.conn)?;
        let changed = conn.execute(
            "UPDATE actions SET status = ?3, result = COALESCE(?4, result),
                                completed_at = COALESCE(?5, completed_at)
             WHERE id = ?1 AND status = ?2",
            params![
                action_id,
                from.as_str(),
                to.as_str(),
                result.map(ToString::to_string),
                completed_at.map(to_ts),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::StaleTransition {
                entity: "action",
                id: action_id.to_string(),
                expected: from.as_str().to_string(),
            });
        }

        let raw = conn
            .query_row(
                &format!("{SELECT_SQL} WHERE id = ?1"),
                params![action_id],
                row_to_raw,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound {
                entity: "action",
                id: action_id.to_string(),
            })?;

        info!(action_id = %action_id, from = %from, to = %to, "action transitioned");
        decode_action(raw)
    }

    /// Flags an action for operator review after an invariant violation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on write failure.
    pub fn flag_invariant_violation(
        &self,
        action_id: &str,
        note: &str,
    ) -> Result<(), StoreError> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "UPDATE actions SET invariant_violation = 1,
                                result = json_patch(COALESCE(result, '{}'),
                                                    json_object('invariant_note', ?2))
             WHERE id = ?1",
            params![action_id, note],
        )?;
        Ok(())
    }

    /// Returns `true` if a reversal action referencing `action_id` exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure.
    pub fn reversal_exists_for(&self, action_id: &str) -> Result<bool, StoreError> {
        let conn = lock(&self.conn)?;
        let found: Option<String> = conn
            .query_row(
                "SELECT id FROM actions WHERE reversal_of = ?1 LIMIT 1",
                params![action_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Returns `true` if any action on the incident created after
    /// `created_at` has reached `IN_PROGRESS` or beyond.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure.
    pub fn later_action_progressed(
        &self,
        incident_id: &str,
        created_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = lock(&self.conn)?;
        let found: Option<String> = conn
            .query_row(
                "SELECT id FROM actions
                 WHERE incident_id = ?1 AND created_at > ?2
                   AND status IN ('IN_PROGRESS', 'SUCCEEDED', 'FAILED')
                 LIMIT 1",
                params![incident_id, to_ts(created_at)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// All actions for an incident, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query or decode failure.
    pub fn list_for_incident(&self, incident_id: &str) -> Result<Vec<Action>, StoreError> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(&format!(
            "{SELECT_SQL} WHERE incident_id = ?1 ORDER BY created_at ASC, id ASC"
        ))?;
        let rows = stmt.query_map(params![incident_id], row_to_raw)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(decode_action(row?)?);
        }
        Ok(out)
    }
}

// =============================================================================
// Row decoding
// =============================================================================

const SELECT_SQL: &str = "SELECT id, incident_id, kind, status, parameters, result, reversible,
        reversal_of, scheduled_for, attempt_number, created_at, completed_at
 FROM actions";

struct RawAction {
    id: String,
    incident_id: String,
    kind: String,
    status: String,
    parameters: String,
    result: Option<String>,
    reversible: bool,
    reversal_of: Option<String>,
    scheduled_for: Option<String>,
    attempt_number: u32,
    created_at: String,
    completed_at: Option<String>,
}

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawAction> {
    Ok(RawAction {
        id: row.get(0)?,
        incident_id: row.get(1)?,
        kind: row.get(2)?,
        status: row.get(3)?,
        parameters: row.get(4)?,
        result: row.get(5)?,
        reversible: row.get(6)?,
        reversal_of: row.get(7)?,
        scheduled_for: row.get(8)?,
        attempt_number: row.get(9)?,
        created_at: row.get(10)?,
        completed_at: row.get(11)?,
    })
}

fn decode_action(raw: RawAction) -> Result<Action, StoreError> {
    let kind = ActionKind::parse(&raw.kind).ok_or_else(|| StoreError::Corrupt {
        table: "actions",
        message: format!("bad kind {:?}", raw.kind),
    })?;
    let status = ActionStatus::parse(&raw.status).ok_or_else(|| StoreError::Corrupt {
        table: "actions",
        message: format!("bad status {:?}", raw.status),
    })?;
    let parameters = serde_json::from_str(&raw.parameters).map_err(|e| StoreError::Corrupt {
        table: "actions",
        message: format!("bad parameters json: {e}"),
    })?;
    let result = raw
        .result
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| StoreError::Corrupt {
            table: "actions",
            message: format!("bad result json: {e}"),
        })?;
    Ok(Action {
        id: raw.id,
        incident_id: raw.incident_id,
        kind,
        status,
        parameters,
        result,
        reversible: raw.reversible,
        reversal_of: raw.reversal_of,
        scheduled_for: raw
            .scheduled_for
            .as_deref()
            .map(|s| parse_ts("actions", s))
            .transpose()?,
        attempt_number: raw.attempt_number,
        created_at: parse_ts("actions", &raw.created_at)?,
        completed_at: raw
            .completed_at
            .as_deref()
            .map(|s| parse_ts("actions", s))
            .transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    use super::*;
    use crate::store::Store;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn action(id: &str, incident_id: &str, status: ActionStatus) -> Action {
        Action {
            id: id.to_string(),
            incident_id: incident_id.to_string(),
            kind: ActionKind::Retry,
            status,
            parameters: json!({"policy": "default"}),
            result: None,
            reversible: true,
            reversal_of: None,
            scheduled_for: Some(t0()),
            attempt_number: 1,
            created_at: t0(),
            completed_at: None,
        }
    }

    #[test]
    fn insert_and_get_round_trips() {
        let store = Store::open_in_memory().unwrap();
        let actions = store.actions();
        let act = action("ACT-1", "INC-1", ActionStatus::Pending);

        assert_eq!(actions.insert(&act).unwrap(), ActionInsert::Created);
        assert_eq!(actions.get("ACT-1").unwrap().unwrap(), act);
    }

    #[test]
    fn single_flight_index_rejects_second_in_flight_action() {
        let store = Store::open_in_memory().unwrap();
        let actions = store.actions();

        actions
            .insert(&action("ACT-1", "INC-1", ActionStatus::Pending))
            .unwrap();
        let outcome = actions
            .insert(&action("ACT-2", "INC-1", ActionStatus::Pending))
            .unwrap();
        assert_eq!(outcome, ActionInsert::SingleFlightConflict);

        // a different incident is unaffected
        assert_eq!(
            actions
                .insert(&action("ACT-3", "INC-2", ActionStatus::Pending))
                .unwrap(),
            ActionInsert::Created
        );
    }

    #[test]
    fn terminal_action_frees_the_incident_for_a_new_one() {
        let store = Store::open_in_memory().unwrap();
        let actions = store.actions();

        actions
            .insert(&action("ACT-1", "INC-1", ActionStatus::Pending))
            .unwrap();
        actions
            .transition("ACT-1", ActionStatus::Pending, ActionStatus::InProgress, None, None)
            .unwrap();
        actions
            .transition(
                "ACT-1",
                ActionStatus::InProgress,
                ActionStatus::Failed,
                Some(&json!({"error": "still broken"})),
                Some(t0()),
            )
            .unwrap();

        assert_eq!(
            actions
                .insert(&action("ACT-2", "INC-1", ActionStatus::Pending))
                .unwrap(),
            ActionInsert::Created
        );
    }

    #[test]
    fn illegal_transition_flags_the_row_and_keeps_status() {
        let store = Store::open_in_memory().unwrap();
        let actions = store.actions();
        actions
            .insert(&action("ACT-1", "INC-1", ActionStatus::Pending))
            .unwrap();

        let err = actions
            .transition("ACT-1", ActionStatus::Pending, ActionStatus::Succeeded, None, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::StaleTransition { .. }));

        let loaded = actions.get("ACT-1").unwrap().unwrap();
        assert_eq!(loaded.status, ActionStatus::Pending);
        assert_eq!(
            loaded
                .result
                .as_ref()
                .and_then(|r| r.get("invariant_note"))
                .and_then(|v| v.as_str()),
            Some("illegal transition PENDING -> SUCCEEDED")
        );
    }

    #[test]
    fn optimistic_transition_detects_staleness() {
        let store = Store::open_in_memory().unwrap();
        let actions = store.actions();
        actions
            .insert(&action("ACT-1", "INC-1", ActionStatus::Pending))
            .unwrap();
        actions
            .transition("ACT-1", ActionStatus::Pending, ActionStatus::InProgress, None, None)
            .unwrap();

        // a second Pending->InProgress attempt finds the row moved on
        let err = actions
            .transition("ACT-1", ActionStatus::Pending, ActionStatus::InProgress, None, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::StaleTransition { .. }));
    }

    #[test]
    fn due_pending_respects_schedule() {
        let store = Store::open_in_memory().unwrap();
        let actions = store.actions();

        let mut due = action("ACT-due", "INC-1", ActionStatus::Pending);
        due.scheduled_for = Some(t0());
        actions.insert(&due).unwrap();

        let mut future = action("ACT-future", "INC-2", ActionStatus::Pending);
        future.scheduled_for = Some(t0() + Duration::minutes(10));
        actions.insert(&future).unwrap();

        let picked = actions.due_pending(t0() + Duration::seconds(1), 10).unwrap();
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].id, "ACT-due");

        let picked = actions.due_pending(t0() + Duration::minutes(11), 10).unwrap();
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn reversal_lookup_helpers() {
        let store = Store::open_in_memory().unwrap();
        let actions = store.actions();

        let mut done = action("ACT-1", "INC-1", ActionStatus::Succeeded);
        done.completed_at = Some(t0());
        actions.insert(&done).unwrap();
        assert!(!actions.reversal_exists_for("ACT-1").unwrap());

        let mut reversal = action("ACT-2", "INC-1", ActionStatus::Pending);
        reversal.kind = ActionKind::Reversal;
        reversal.reversal_of = Some("ACT-1".to_string());
        reversal.created_at = t0() + Duration::seconds(5);
        actions.insert(&reversal).unwrap();

        assert!(actions.reversal_exists_for("ACT-1").unwrap());
        // the reversal is still pending, so nothing later has progressed
        assert!(!actions.later_action_progressed("INC-1", t0()).unwrap());

        actions
            .transition("ACT-2", ActionStatus::Pending, ActionStatus::InProgress, None, None)
            .unwrap();
        assert!(actions.later_action_progressed("INC-1", t0()).unwrap());
    }
}
