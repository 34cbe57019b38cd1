//! Persistent store implementation using `SQLite`.
//!
//! One shared connection (`Arc<Mutex<Connection>>`) backs a family of
//! repository handles, one per entity. Schema initialization is idempotent
//! and constraint-first: uniqueness guarantees that matter for correctness
//! (idempotent ingest, one open incident per signature, single-flight
//! actions) live in the database, not only in application checks.
//!
//! # Schema
//!
//! - `tenants`, `workflows`, `kill_switches`, `vendors`: admin tables; the
//!   vendor row mirrors durable breaker state for restart recovery
//! - `events`: append-only; UNIQUE `(tenant_id, idempotency_key)` is the
//!   final duplicate guard
//! - `incidents`: partial UNIQUE on `(tenant_id, workflow_id, signature)`
//!   over open rows serializes lookup-or-create
//! - `incident_events`: the correlation set, insertion-ordered
//! - `decisions`: append-only; no UPDATE path exists
//! - `actions`: partial UNIQUE on `incident_id` over in-flight rows
//!   enforces single-flight
//! - `worker_watermarks`: durable cursors for catch-up workers

mod actions;
mod admin;
mod decisions;
mod events;
mod incidents;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use thiserror::Error;

pub use actions::{ActionInsert, ActionStore};
pub use admin::{AdminStore, kill_switch};
pub use decisions::DecisionStore;
pub use events::{EventInsert, EventStore};
pub use incidents::{IncidentInsert, IncidentStore};

// =============================================================================
// Errors
// =============================================================================

/// Errors surfaced by the store layer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Underlying database failure (transient or otherwise).
    #[error("database error: {0}")]
    Database(String),

    /// The connection mutex was poisoned.
    #[error("connection lock poisoned")]
    LockPoisoned,

    /// A requested row does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind.
        entity: &'static str,
        /// Identifier looked up.
        id: String,
    },

    /// A persisted row could not be decoded back into its domain type.
    #[error("corrupt row in {table}: {message}")]
    Corrupt {
        /// Table the row came from.
        table: &'static str,
        /// What failed to decode.
        message: String,
    },

    /// An optimistic status transition found the row in a different state.
    #[error("stale transition on {entity} {id}: expected {expected}")]
    StaleTransition {
        /// Entity kind.
        entity: &'static str,
        /// Row identifier.
        id: String,
        /// Status the caller expected.
        expected: String,
    },
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

/// Returns `true` if the error is a uniqueness-constraint violation.
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

// =============================================================================
// Timestamp codec
// =============================================================================

/// Serializes a timestamp in fixed-width RFC3339 (microseconds, `Z`).
pub(crate) fn to_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parses a stored RFC3339 timestamp.
pub(crate) fn parse_ts(table: &'static str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            table,
            message: format!("bad timestamp {raw:?}: {e}"),
        })
}

// =============================================================================
// Store
// =============================================================================

const SCHEMA_SQL: &str = r"
    CREATE TABLE IF NOT EXISTS tenants (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        active INTEGER NOT NULL DEFAULT 1
    );

    CREATE TABLE IF NOT EXISTS workflows (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        name TEXT NOT NULL,
        active INTEGER NOT NULL DEFAULT 1
    );
    CREATE INDEX IF NOT EXISTS idx_workflows_tenant ON workflows(tenant_id);

    CREATE TABLE IF NOT EXISTS kill_switches (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id TEXT NOT NULL,
        workflow_id TEXT,
        active INTEGER NOT NULL DEFAULT 1,
        reason TEXT NOT NULL,
        activated_by TEXT NOT NULL,
        activated_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_kill_switches_tenant ON kill_switches(tenant_id);

    CREATE TABLE IF NOT EXISTS vendors (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        breaker_state TEXT NOT NULL DEFAULT 'CLOSED',
        breaker_failure_count INTEGER NOT NULL DEFAULT 0,
        breaker_opened_at TEXT,
        rate_limit_per_minute INTEGER NOT NULL DEFAULT 100
    );

    CREATE TABLE IF NOT EXISTS events (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        workflow_id TEXT NOT NULL,
        event_type TEXT NOT NULL,
        payload TEXT NOT NULL,
        idempotency_key TEXT NOT NULL,
        occurred_at TEXT NOT NULL,
        received_at TEXT NOT NULL,
        correlation_id TEXT NOT NULL,
        vendor TEXT,
        schema_version TEXT NOT NULL,
        clock_skew_secs INTEGER NOT NULL DEFAULT 0
    );
    CREATE UNIQUE INDEX IF NOT EXISTS idx_events_idempotency
        ON events(tenant_id, idempotency_key);
    CREATE INDEX IF NOT EXISTS idx_events_workflow ON events(workflow_id);

    CREATE TABLE IF NOT EXISTS incidents (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        workflow_id TEXT NOT NULL,
        signature TEXT NOT NULL,
        title TEXT NOT NULL,
        status TEXT NOT NULL,
        severity TEXT NOT NULL,
        event_count INTEGER NOT NULL,
        first_seen_at TEXT NOT NULL,
        last_seen_at TEXT NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0,
        metadata TEXT NOT NULL DEFAULT '{}'
    );
    CREATE UNIQUE INDEX IF NOT EXISTS idx_incidents_open
        ON incidents(tenant_id, workflow_id, signature)
        WHERE status NOT IN ('RESOLVED', 'IGNORED');
    CREATE INDEX IF NOT EXISTS idx_incidents_status ON incidents(status);

    CREATE TABLE IF NOT EXISTS incident_events (
        incident_id TEXT NOT NULL,
        event_id TEXT NOT NULL,
        occurred_at TEXT NOT NULL,
        PRIMARY KEY (incident_id, event_id)
    );

    CREATE TABLE IF NOT EXISTS decisions (
        id TEXT PRIMARY KEY,
        incident_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        reasoning TEXT NOT NULL,
        confidence REAL NOT NULL,
        model_tag TEXT NOT NULL,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_decisions_incident ON decisions(incident_id);

    CREATE TABLE IF NOT EXISTS actions (
        id TEXT PRIMARY KEY,
        incident_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        status TEXT NOT NULL,
        parameters TEXT NOT NULL DEFAULT '{}',
        result TEXT,
        reversible INTEGER NOT NULL DEFAULT 0,
        reversal_of TEXT,
        scheduled_for TEXT,
        attempt_number INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        completed_at TEXT,
        invariant_violation INTEGER NOT NULL DEFAULT 0
    );
    CREATE UNIQUE INDEX IF NOT EXISTS idx_actions_single_flight
        ON actions(incident_id)
        WHERE status IN ('PENDING', 'IN_PROGRESS');
    CREATE INDEX IF NOT EXISTS idx_actions_due
        ON actions(status, scheduled_for);

    CREATE TABLE IF NOT EXISTS worker_watermarks (
        worker_id TEXT PRIMARY KEY,
        last_rowid INTEGER NOT NULL,
        updated_at TEXT NOT NULL
    );
";

/// Handle to the shared `SQLite` database.
#[derive(Debug, Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Opens (creating if needed) the database at `path` and initializes
    /// the schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the file cannot be opened or
    /// the schema cannot be applied.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Self::from_connection(conn)
    }

    /// Opens an in-memory database (tests and ephemeral runs).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if schema initialization fails.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Applies the schema. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns the underlying `rusqlite` error on failure.
    pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(SCHEMA_SQL)
    }

    /// Repository handle for events.
    #[must_use]
    pub fn events(&self) -> EventStore {
        EventStore::new(Arc::clone(&self.conn))
    }

    /// Repository handle for incidents.
    #[must_use]
    pub fn incidents(&self) -> IncidentStore {
        IncidentStore::new(Arc::clone(&self.conn))
    }

    /// Repository handle for actions.
    #[must_use]
    pub fn actions(&self) -> ActionStore {
        ActionStore::new(Arc::clone(&self.conn))
    }

    /// Repository handle for decisions.
    #[must_use]
    pub fn decisions(&self) -> DecisionStore {
        DecisionStore::new(Arc::clone(&self.conn))
    }

    /// Repository handle for tenants, workflows, kill switches, vendors.
    #[must_use]
    pub fn admin(&self) -> AdminStore {
        AdminStore::new(Arc::clone(&self.conn))
    }

    /// Loads a worker's durable watermark (0 when none is stored).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure.
    pub fn load_watermark(&self, worker_id: &str) -> Result<i64, StoreError> {
        use rusqlite::OptionalExtension;

        let conn = lock(&self.conn)?;
        let value: Option<i64> = conn
            .query_row(
                "SELECT last_rowid FROM worker_watermarks WHERE worker_id = ?1",
                rusqlite::params![worker_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.unwrap_or(0))
    }

    /// Stores a worker's watermark.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on write failure.
    pub fn store_watermark(
        &self,
        worker_id: &str,
        last_rowid: i64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO worker_watermarks (worker_id, last_rowid, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(worker_id) DO UPDATE SET
                 last_rowid = excluded.last_rowid,
                 updated_at = excluded.updated_at",
            rusqlite::params![worker_id, last_rowid, to_ts(now)],
        )?;
        Ok(())
    }
}

/// Acquires the connection lock, translating poisoning.
pub(crate) fn lock(
    conn: &Arc<Mutex<Connection>>,
) -> Result<MutexGuard<'_, Connection>, StoreError> {
    conn.lock().map_err(|_| StoreError::LockPoisoned)
}
