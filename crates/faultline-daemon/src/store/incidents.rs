//! Incident repository.
//!
//! The partial unique index over open rows is what makes lookup-or-create
//! race-free: two concurrent creators for the same `(tenant, workflow,
//! signature)` cannot both insert, and the loser re-reads the winner.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use faultline_core::incident::{Incident, IncidentStatus};
use faultline_core::types::Severity;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};

use super::{StoreError, is_unique_violation, lock, parse_ts, to_ts};

/// Outcome of an incident insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncidentInsert {
    /// The incident row was created.
    Created,
    /// The open-incident unique index fired: another creator won the race.
    /// The caller should re-run its lookup and take the update path.
    Raced,
}

/// Incident repository.
#[derive(Debug)]
pub struct IncidentStore {
    conn: Arc<Mutex<Connection>>,
}

impl IncidentStore {
    /// Creates a repository over the shared connection.
    #[must_use]
    pub const fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Finds the open (non-terminal) incident for a signature.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query or decode failure.
    pub fn find_open(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        signature: &str,
    ) -> Result<Option<Incident>, StoreError> {
        let conn = lock(&self.conn)?;
        let raw = conn
            .query_row(
                &format!("{SELECT_SQL} WHERE tenant_id = ?1 AND workflow_id = ?2 AND signature = ?3 AND status NOT IN ('RESOLVED', 'IGNORED')"),
                params![tenant_id, workflow_id, signature],
                row_to_raw,
            )
            .optional()?;
        raw.map(decode_incident).transpose()
    }

    /// Fetches one incident by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query or decode failure.
    pub fn get(&self, incident_id: &str) -> Result<Option<Incident>, StoreError> {
        let conn = lock(&self.conn)?;
        let raw = conn
            .query_row(
                &format!("{SELECT_SQL} WHERE id = ?1"),
                params![incident_id],
                row_to_raw,
            )
            .optional()?;
        raw.map(decode_incident).transpose()
    }

    /// Inserts a new incident together with its first correlated event.
    ///
    /// Both writes commit atomically. A partial-unique violation is mapped
    /// to [`IncidentInsert::Raced`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on any other failure; nothing partial is
    /// left behind.
    pub fn insert(
        &self,
        incident: &Incident,
        first_event_id: &str,
    ) -> Result<IncidentInsert, StoreError> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            "INSERT INTO incidents (id, tenant_id, workflow_id, signature, title, status,
                                    severity, event_count, first_seen_at, last_seen_at,
                                    retry_count, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                incident.id,
                incident.tenant_id,
                incident.workflow_id,
                incident.signature,
                incident.title,
                incident.status.as_str(),
                incident.severity.as_str(),
                i64::try_from(incident.event_count).unwrap_or(i64::MAX),
                to_ts(incident.first_seen_at),
                to_ts(incident.last_seen_at),
                incident.retry_count,
                incident.metadata.to_string(),
            ],
        );

        match inserted {
            Ok(_) => {},
            Err(err) if is_unique_violation(&err) => return Ok(IncidentInsert::Raced),
            Err(err) => return Err(err.into()),
        }

        tx.execute(
            "INSERT OR IGNORE INTO incident_events (incident_id, event_id, occurred_at)
             VALUES (?1, ?2, ?3)",
            params![incident.id, first_event_id, to_ts(incident.first_seen_at)],
        )?;
        tx.commit()?;

        info!(
            incident_id = %incident.id,
            signature = %incident.signature,
            severity = %incident.severity,
            "created incident"
        );
        Ok(IncidentInsert::Created)
    }

    /// Correlates one more event into an incident: bumps `event_count`,
    /// advances `last_seen_at`, appends to the correlation set. Atomic.
    ///
    /// Returns the updated incident.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the incident is gone, or a
    /// database error.
    pub fn record_event(
        &self,
        incident_id: &str,
        event_id: &str,
        occurred_at: DateTime<Utc>,
    ) -> Result<Incident, StoreError> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction()?;

        let raw = tx
            .query_row(
                &format!("{SELECT_SQL} WHERE id = ?1"),
                params![incident_id],
                row_to_raw,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound {
                entity: "incident",
                id: incident_id.to_string(),
            })?;
        let mut incident = decode_incident(raw)?;

        incident.event_count = incident.event_count.saturating_add(1);
        if occurred_at > incident.last_seen_at {
            incident.last_seen_at = occurred_at;
        }

        tx.execute(
            "UPDATE incidents SET event_count = ?2, last_seen_at = ?3 WHERE id = ?1",
            params![
                incident_id,
                i64::try_from(incident.event_count).unwrap_or(i64::MAX),
                to_ts(incident.last_seen_at),
            ],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO incident_events (incident_id, event_id, occurred_at)
             VALUES (?1, ?2, ?3)",
            params![incident_id, event_id, to_ts(occurred_at)],
        )?;
        tx.commit()?;

        debug!(
            incident_id = %incident_id,
            event_count = incident.event_count,
            "correlated event into incident"
        );
        Ok(incident)
    }

    /// Applies an optimistic status transition: the row must still be in
    /// `from`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::StaleTransition`] when the row is no longer
    /// in `from`, [`StoreError::NotFound`] when it does not exist.
    pub fn update_status(
        &self,
        incident_id: &str,
        from: IncidentStatus,
        to: IncidentStatus,
    ) -> Result<(), StoreError> {
        let conn = lock(&self.conn)?;
        let changed = conn.execute(
            "UPDATE incidents SET status = ?3 WHERE id = ?1 AND status = ?2",
            params![incident_id, from.as_str(), to.as_str()],
        )?;
        if changed == 0 {
            let exists: Option<String> = conn
                .query_row(
                    "SELECT id FROM incidents WHERE id = ?1",
                    params![incident_id],
                    |row| row.get(0),
                )
                .optional()?;
            return Err(exists.map_or(
                StoreError::NotFound {
                    entity: "incident",
                    id: incident_id.to_string(),
                },
                |_| StoreError::StaleTransition {
                    entity: "incident",
                    id: incident_id.to_string(),
                    expected: from.as_str().to_string(),
                },
            ));
        }
        info!(incident_id = %incident_id, from = %from, to = %to, "incident status updated");
        Ok(())
    }

    /// Upgrades severity and records the upgrade flag in metadata. Atomic.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on failure.
    pub fn upgrade_severity(
        &self,
        incident_id: &str,
        new_severity: Severity,
        flag_key: &str,
    ) -> Result<(), StoreError> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction()?;

        let metadata: String = tx
            .query_row(
                "SELECT metadata FROM incidents WHERE id = ?1",
                params![incident_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound {
                entity: "incident",
                id: incident_id.to_string(),
            })?;

        let mut metadata: serde_json::Value =
            serde_json::from_str(&metadata).unwrap_or_else(|_| serde_json::json!({}));
        metadata[flag_key] = serde_json::Value::Bool(true);

        tx.execute(
            "UPDATE incidents SET severity = ?2, metadata = ?3 WHERE id = ?1",
            params![incident_id, new_severity.as_str(), metadata.to_string()],
        )?;
        tx.commit()?;

        info!(
            incident_id = %incident_id,
            severity = %new_severity,
            trigger = %flag_key,
            "incident severity upgraded"
        );
        Ok(())
    }

    /// Increments the remediation retry counter; returns the new value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on failure.
    pub fn increment_retry_count(&self, incident_id: &str) -> Result<u32, StoreError> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE incidents SET retry_count = retry_count + 1 WHERE id = ?1",
            params![incident_id],
        )?;
        let count: u32 = tx
            .query_row(
                "SELECT retry_count FROM incidents WHERE id = ?1",
                params![incident_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound {
                entity: "incident",
                id: incident_id.to_string(),
            })?;
        tx.commit()?;
        Ok(count)
    }

    /// The correlation set for presentation: event ids ordered by
    /// `occurred_at`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure.
    pub fn correlated_event_ids(&self, incident_id: &str) -> Result<Vec<String>, StoreError> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT event_id FROM incident_events
             WHERE incident_id = ?1 ORDER BY occurred_at ASC, event_id ASC",
        )?;
        let rows = stmt.query_map(params![incident_id], |row| row.get(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Counts incidents that are not terminal.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure.
    pub fn count_open(&self) -> Result<u64, StoreError> {
        let conn = lock(&self.conn)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM incidents WHERE status NOT IN ('RESOLVED', 'IGNORED')",
            [],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

// =============================================================================
// Row decoding
// =============================================================================

const SELECT_SQL: &str = "SELECT id, tenant_id, workflow_id, signature, title, status, severity,
        event_count, first_seen_at, last_seen_at, retry_count, metadata
 FROM incidents";

struct RawIncident {
    id: String,
    tenant_id: String,
    workflow_id: String,
    signature: String,
    title: String,
    status: String,
    severity: String,
    event_count: i64,
    first_seen_at: String,
    last_seen_at: String,
    retry_count: u32,
    metadata: String,
}

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawIncident> {
    Ok(RawIncident {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        workflow_id: row.get(2)?,
        signature: row.get(3)?,
        title: row.get(4)?,
        status: row.get(5)?,
        severity: row.get(6)?,
        event_count: row.get(7)?,
        first_seen_at: row.get(8)?,
        last_seen_at: row.get(9)?,
        retry_count: row.get(10)?,
        metadata: row.get(11)?,
    })
}

fn decode_incident(raw: RawIncident) -> Result<Incident, StoreError> {
    let status = IncidentStatus::parse(&raw.status).ok_or_else(|| StoreError::Corrupt {
        table: "incidents",
        message: format!("bad status {:?}", raw.status),
    })?;
    let severity = Severity::parse(&raw.severity).ok_or_else(|| StoreError::Corrupt {
        table: "incidents",
        message: format!("bad severity {:?}", raw.severity),
    })?;
    let metadata = serde_json::from_str(&raw.metadata).map_err(|e| StoreError::Corrupt {
        table: "incidents",
        message: format!("bad metadata json: {e}"),
    })?;
    Ok(Incident {
        id: raw.id,
        tenant_id: raw.tenant_id,
        workflow_id: raw.workflow_id,
        signature: raw.signature,
        title: raw.title,
        status,
        severity,
        event_count: u64::try_from(raw.event_count).unwrap_or(0),
        first_seen_at: parse_ts("incidents", &raw.first_seen_at)?,
        last_seen_at: parse_ts("incidents", &raw.last_seen_at)?,
        retry_count: raw.retry_count,
        metadata,
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

    fn incident(id: &str, signature: &str) -> Incident {
        Incident {
            id: id.to_string(),
            tenant_id: "t1".to_string(),
            workflow_id: "w1".to_string(),
            signature: signature.to_string(),
            title: "payment failures".to_string(),
            status: IncidentStatus::New,
            severity: Severity::Medium,
            event_count: 1,
            first_seen_at: t0(),
            last_seen_at: t0(),
            retry_count: 0,
            metadata: json!({"error_code": "timeout"}),
        }
    }

    #[test]
    fn insert_and_find_open() {
        let store = Store::open_in_memory().unwrap();
        let incidents = store.incidents();

        let inc = incident("INC-1", "sig-a");
        assert_eq!(
            incidents.insert(&inc, "EVT-1").unwrap(),
            IncidentInsert::Created
        );

        let found = incidents.find_open("t1", "w1", "sig-a").unwrap().unwrap();
        assert_eq!(found.id, "INC-1");
        assert_eq!(found.event_count, 1);
    }

    #[test]
    fn second_open_incident_for_same_signature_races() {
        let store = Store::open_in_memory().unwrap();
        let incidents = store.incidents();

        incidents.insert(&incident("INC-1", "sig-a"), "EVT-1").unwrap();
        let outcome = incidents.insert(&incident("INC-2", "sig-a"), "EVT-2").unwrap();
        assert_eq!(outcome, IncidentInsert::Raced);

        // the loser's correlation row was rolled back with it
        assert!(incidents.correlated_event_ids("INC-2").unwrap().is_empty());
    }

    #[test]
    fn resolved_incident_frees_the_signature() {
        let store = Store::open_in_memory().unwrap();
        let incidents = store.incidents();

        incidents.insert(&incident("INC-1", "sig-a"), "EVT-1").unwrap();
        incidents
            .update_status("INC-1", IncidentStatus::New, IncidentStatus::Analyzing)
            .unwrap();
        incidents
            .update_status("INC-1", IncidentStatus::Analyzing, IncidentStatus::Actioned)
            .unwrap();
        incidents
            .update_status("INC-1", IncidentStatus::Actioned, IncidentStatus::Resolved)
            .unwrap();

        assert!(incidents.find_open("t1", "w1", "sig-a").unwrap().is_none());
        assert_eq!(
            incidents.insert(&incident("INC-3", "sig-a"), "EVT-3").unwrap(),
            IncidentInsert::Created
        );
    }

    #[test]
    fn record_event_bumps_count_and_last_seen() {
        let store = Store::open_in_memory().unwrap();
        let incidents = store.incidents();
        incidents.insert(&incident("INC-1", "sig-a"), "EVT-1").unwrap();

        let later = t0() + Duration::minutes(5);
        let updated = incidents.record_event("INC-1", "EVT-2", later).unwrap();
        assert_eq!(updated.event_count, 2);
        assert_eq!(updated.last_seen_at, later);

        // out-of-order arrival never walks last_seen_at backwards
        let earlier = t0() - Duration::minutes(5);
        let updated = incidents.record_event("INC-1", "EVT-3", earlier).unwrap();
        assert_eq!(updated.event_count, 3);
        assert_eq!(updated.last_seen_at, later);
    }

    #[test]
    fn correlation_set_is_presented_in_occurred_order() {
        let store = Store::open_in_memory().unwrap();
        let incidents = store.incidents();
        incidents.insert(&incident("INC-1", "sig-a"), "EVT-1").unwrap();

        // arrive out of occurred order
        incidents
            .record_event("INC-1", "EVT-3", t0() + Duration::minutes(10))
            .unwrap();
        incidents
            .record_event("INC-1", "EVT-2", t0() + Duration::minutes(5))
            .unwrap();

        assert_eq!(
            incidents.correlated_event_ids("INC-1").unwrap(),
            vec!["EVT-1", "EVT-2", "EVT-3"]
        );
    }

    #[test]
    fn stale_status_transition_is_reported() {
        let store = Store::open_in_memory().unwrap();
        let incidents = store.incidents();
        incidents.insert(&incident("INC-1", "sig-a"), "EVT-1").unwrap();

        let err = incidents
            .update_status("INC-1", IncidentStatus::Analyzing, IncidentStatus::Actioned)
            .unwrap_err();
        assert!(matches!(err, StoreError::StaleTransition { .. }));

        let err = incidents
            .update_status("INC-missing", IncidentStatus::New, IncidentStatus::Analyzing)
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn severity_upgrade_sets_flag_in_metadata() {
        let store = Store::open_in_memory().unwrap();
        let incidents = store.incidents();
        incidents.insert(&incident("INC-1", "sig-a"), "EVT-1").unwrap();

        incidents
            .upgrade_severity(
                "INC-1",
                Severity::High,
                faultline_core::incident::META_COUNT_UPGRADED,
            )
            .unwrap();

        let loaded = incidents.get("INC-1").unwrap().unwrap();
        assert_eq!(loaded.severity, Severity::High);
        assert!(loaded.metadata_flag(faultline_core::incident::META_COUNT_UPGRADED));
        // pre-existing metadata is preserved
        assert_eq!(loaded.metadata_str("error_code"), Some("timeout"));
    }

    #[test]
    fn retry_count_increments_transactionally() {
        let store = Store::open_in_memory().unwrap();
        let incidents = store.incidents();
        incidents.insert(&incident("INC-1", "sig-a"), "EVT-1").unwrap();

        assert_eq!(incidents.increment_retry_count("INC-1").unwrap(), 1);
        assert_eq!(incidents.increment_retry_count("INC-1").unwrap(), 2);
    }

    #[test]
    fn count_open_excludes_terminal_rows() {
        let store = Store::open_in_memory().unwrap();
        let incidents = store.incidents();
        incidents.insert(&incident("INC-1", "sig-a"), "EVT-1").unwrap();
        incidents.insert(&incident("INC-2", "sig-b"), "EVT-2").unwrap();
        assert_eq!(incidents.count_open().unwrap(), 2);

        incidents
            .update_status("INC-2", IncidentStatus::New, IncidentStatus::Ignored)
            .unwrap();
        assert_eq!(incidents.count_open().unwrap(), 1);
    }
}
