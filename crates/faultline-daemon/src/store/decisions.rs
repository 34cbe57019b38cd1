//! Decision repository. Append-only: there is deliberately no UPDATE or
//! DELETE path in this module.

use std::sync::{Arc, Mutex};

use faultline_core::decision::{Decision, DecisionKind};
use rusqlite::{Connection, params};
use tracing::debug;

use super::{StoreError, lock, parse_ts, to_ts};

/// Append-only decision repository.
#[derive(Debug)]
pub struct DecisionStore {
    conn: Arc<Mutex<Connection>>,
}

impl DecisionStore {
    /// Creates a repository over the shared connection.
    #[must_use]
    pub const fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Inserts a decision row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on write failure.
    pub fn insert(&self, decision: &Decision) -> Result<(), StoreError> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO decisions (id, incident_id, kind, reasoning, confidence,
                                    model_tag, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                decision.id,
                decision.incident_id,
                decision.kind.as_str(),
                decision.reasoning,
                decision.confidence,
                decision.model_tag,
                to_ts(decision.created_at),
            ],
        )?;
        debug!(
            decision_id = %decision.id,
            incident_id = %decision.incident_id,
            kind = %decision.kind,
            "recorded decision"
        );
        Ok(())
    }

    /// Decisions for an incident, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query or decode failure.
    pub fn list_for_incident(&self, incident_id: &str) -> Result<Vec<Decision>, StoreError> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT id, incident_id, kind, reasoning, confidence, model_tag, created_at
             FROM decisions WHERE incident_id = ?1 ORDER BY rowid ASC",
        )?;
        let rows = stmt.query_map(params![incident_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, incident_id, kind, reasoning, confidence, model_tag, created_at) = row?;
            let kind = DecisionKind::parse(&kind).ok_or_else(|| StoreError::Corrupt {
                table: "decisions",
                message: format!("bad kind {kind:?}"),
            })?;
            out.push(Decision {
                id,
                incident_id,
                kind,
                reasoning,
                confidence,
                model_tag,
                created_at: parse_ts("decisions", &created_at)?,
            });
        }
        Ok(out)
    }
}
