//! Event repository: append-only, idempotency-guarded.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use faultline_core::event::StoredEvent;
use faultline_core::types::CorrelationId;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use super::{StoreError, is_unique_violation, lock, parse_ts, to_ts};

/// Outcome of an event insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventInsert {
    /// The row was written.
    Inserted,
    /// The unique index on `(tenant_id, idempotency_key)` fired; the
    /// pre-existing event id is returned. Callers treat this exactly like
    /// the check-first duplicate path.
    Duplicate {
        /// Identifier of the already-persisted event.
        existing_id: String,
    },
}

/// Append-only event repository.
#[derive(Debug)]
pub struct EventStore {
    conn: Arc<Mutex<Connection>>,
}

impl EventStore {
    /// Creates a repository over the shared connection.
    #[must_use]
    pub const fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Looks up the event id stored under `(tenant_id, idempotency_key)`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure.
    pub fn find_by_idempotency_key(
        &self,
        tenant_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<String>, StoreError> {
        let conn = lock(&self.conn)?;
        let id = conn
            .query_row(
                "SELECT id FROM events WHERE tenant_id = ?1 AND idempotency_key = ?2",
                params![tenant_id, idempotency_key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Inserts an event row.
    ///
    /// A uniqueness violation on `(tenant_id, idempotency_key)` is mapped
    /// back to the positive duplicate outcome rather than surfaced as an
    /// error: the constraint is the tiebreaker for racing submissions.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on any other database failure; no partial
    /// row is left behind.
    pub fn insert(&self, event: &StoredEvent) -> Result<EventInsert, StoreError> {
        let payload = event.payload.to_string();
        let conn = lock(&self.conn)?;

        let result = conn.execute(
            "INSERT INTO events (id, tenant_id, workflow_id, event_type, payload,
                                 idempotency_key, occurred_at, received_at,
                                 correlation_id, vendor, schema_version, clock_skew_secs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                event.id,
                event.tenant_id,
                event.workflow_id,
                event.event_type,
                payload,
                event.idempotency_key,
                to_ts(event.occurred_at),
                to_ts(event.received_at),
                event.correlation_id.as_str(),
                event.vendor,
                event.schema_version,
                event.clock_skew_secs(),
            ],
        );

        match result {
            Ok(_) => {
                debug!(event_id = %event.id, tenant_id = %event.tenant_id, "persisted event");
                Ok(EventInsert::Inserted)
            },
            Err(err) if is_unique_violation(&err) => {
                drop(conn);
                let existing_id = self
                    .find_by_idempotency_key(&event.tenant_id, &event.idempotency_key)?
                    .ok_or_else(|| StoreError::Corrupt {
                        table: "events",
                        message: "unique violation without a matching row".to_string(),
                    })?;
                Ok(EventInsert::Duplicate { existing_id })
            },
            Err(err) => Err(err.into()),
        }
    }

    /// Fetches one event by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query or decode failure.
    pub fn get(&self, event_id: &str) -> Result<Option<StoredEvent>, StoreError> {
        let conn = lock(&self.conn)?;
        let row = conn
            .query_row(
                "SELECT id, tenant_id, workflow_id, event_type, payload, idempotency_key,
                        occurred_at, received_at, correlation_id, vendor, schema_version
                 FROM events WHERE id = ?1",
                params![event_id],
                row_to_raw,
            )
            .optional()?;
        row.map(decode_event).transpose()
    }

    /// Reads events past a rowid cursor, in commit order.
    ///
    /// The detector's catch-up path: everything the watermark has not seen
    /// yet, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query or decode failure.
    pub fn read_after(
        &self,
        rowid: i64,
        limit: u32,
    ) -> Result<Vec<(i64, StoredEvent)>, StoreError> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT rowid, id, tenant_id, workflow_id, event_type, payload, idempotency_key,
                    occurred_at, received_at, correlation_id, vendor, schema_version
             FROM events WHERE rowid > ?1 ORDER BY rowid ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![rowid, limit], |row| {
            let cursor: i64 = row.get(0)?;
            let raw = raw_from_offset(row, 1)?;
            Ok((cursor, raw))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (cursor, raw) = row?;
            out.push((cursor, decode_event(raw)?));
        }
        Ok(out)
    }

    /// Recent events correlated to an incident, oldest first by
    /// `occurred_at` (the presentation order).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query or decode failure.
    pub fn recent_for_incident(
        &self,
        incident_id: &str,
        limit: u32,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT e.id, e.tenant_id, e.workflow_id, e.event_type, e.payload,
                    e.idempotency_key, e.occurred_at, e.received_at, e.correlation_id,
                    e.vendor, e.schema_version
             FROM incident_events ie
             JOIN events e ON e.id = ie.event_id
             WHERE ie.incident_id = ?1
             ORDER BY e.occurred_at ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![incident_id, limit], row_to_raw)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(decode_event(row?)?);
        }
        Ok(out)
    }

    /// Deletes events older than the retention cutoff. Returns the number
    /// of rows removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on write failure.
    pub fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = lock(&self.conn)?;
        let removed = conn.execute(
            "DELETE FROM events WHERE received_at < ?1",
            params![to_ts(cutoff)],
        )?;
        Ok(removed)
    }
}

// =============================================================================
// Row decoding
// =============================================================================

struct RawEvent {
    id: String,
    tenant_id: String,
    workflow_id: String,
    event_type: String,
    payload: String,
    idempotency_key: String,
    occurred_at: String,
    received_at: String,
    correlation_id: String,
    vendor: Option<String>,
    schema_version: String,
}

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEvent> {
    raw_from_offset(row, 0)
}

fn raw_from_offset(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<RawEvent> {
    Ok(RawEvent {
        id: row.get(offset)?,
        tenant_id: row.get(offset + 1)?,
        workflow_id: row.get(offset + 2)?,
        event_type: row.get(offset + 3)?,
        payload: row.get(offset + 4)?,
        idempotency_key: row.get(offset + 5)?,
        occurred_at: row.get(offset + 6)?,
        received_at: row.get(offset + 7)?,
        correlation_id: row.get(offset + 8)?,
        vendor: row.get(offset + 9)?,
        schema_version: row.get(offset + 10)?,
    })
}

fn decode_event(raw: RawEvent) -> Result<StoredEvent, StoreError> {
    let payload = serde_json::from_str(&raw.payload).map_err(|e| StoreError::Corrupt {
        table: "events",
        message: format!("bad payload json: {e}"),
    })?;
    Ok(StoredEvent {
        id: raw.id,
        tenant_id: raw.tenant_id,
        workflow_id: raw.workflow_id,
        event_type: raw.event_type,
        payload,
        idempotency_key: raw.idempotency_key,
        occurred_at: parse_ts("events", &raw.occurred_at)?,
        received_at: parse_ts("events", &raw.received_at)?,
        correlation_id: CorrelationId::from_stored(raw.correlation_id),
        vendor: raw.vendor,
        schema_version: raw.schema_version,
    })
}
