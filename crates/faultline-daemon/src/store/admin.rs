//! Admin repository: tenants, workflows, kill switches, vendors.
//!
//! Vendor rows also mirror the durable part of breaker state so a
//! restarted instance does not forget that a vendor was tripped.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use faultline_core::breaker::{BreakerSnapshot, BreakerState};
use faultline_core::types::{KillSwitch, Tenant, Vendor, Workflow};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::info;

use super::{StoreError, lock, parse_ts, to_ts};

/// Repository for operator-managed records.
#[derive(Debug)]
pub struct AdminStore {
    conn: Arc<Mutex<Connection>>,
}

impl AdminStore {
    /// Creates a repository over the shared connection.
    #[must_use]
    pub const fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    // =========================================================================
    // Tenants
    // =========================================================================

    /// Creates or replaces a tenant.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on write failure.
    pub fn upsert_tenant(&self, tenant: &Tenant) -> Result<(), StoreError> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO tenants (id, name, active) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, active = excluded.active",
            params![tenant.id, tenant.name, tenant.active],
        )?;
        Ok(())
    }

    /// Fetches a tenant.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure.
    pub fn get_tenant(&self, tenant_id: &str) -> Result<Option<Tenant>, StoreError> {
        let conn = lock(&self.conn)?;
        let tenant = conn
            .query_row(
                "SELECT id, name, active FROM tenants WHERE id = ?1",
                params![tenant_id],
                |row| {
                    Ok(Tenant {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        active: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(tenant)
    }

    // =========================================================================
    // Workflows
    // =========================================================================

    /// Creates or replaces a workflow.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on write failure.
    pub fn upsert_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO workflows (id, tenant_id, name, active) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                 tenant_id = excluded.tenant_id,
                 name = excluded.name,
                 active = excluded.active",
            params![
                workflow.id,
                workflow.tenant_id,
                workflow.name,
                workflow.active
            ],
        )?;
        Ok(())
    }

    /// Fetches a workflow.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure.
    pub fn get_workflow(&self, workflow_id: &str) -> Result<Option<Workflow>, StoreError> {
        let conn = lock(&self.conn)?;
        let workflow = conn
            .query_row(
                "SELECT id, tenant_id, name, active FROM workflows WHERE id = ?1",
                params![workflow_id],
                |row| {
                    Ok(Workflow {
                        id: row.get(0)?,
                        tenant_id: row.get(1)?,
                        name: row.get(2)?,
                        active: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(workflow)
    }

    // =========================================================================
    // Kill switches
    // =========================================================================

    /// Engages a kill switch. `workflow_id = None` applies tenant-wide.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on write failure.
    pub fn activate_kill_switch(&self, switch: &KillSwitch) -> Result<(), StoreError> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO kill_switches (tenant_id, workflow_id, active, reason,
                                        activated_by, activated_at)
             VALUES (?1, ?2, 1, ?3, ?4, ?5)",
            params![
                switch.tenant_id,
                switch.workflow_id,
                switch.reason,
                switch.activated_by,
                to_ts(switch.activated_at),
            ],
        )?;
        info!(
            tenant_id = %switch.tenant_id,
            workflow_id = ?switch.workflow_id,
            activated_by = %switch.activated_by,
            "kill switch engaged"
        );
        Ok(())
    }

    /// Disengages every active switch matching the scope.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on write failure.
    pub fn deactivate_kill_switch(
        &self,
        tenant_id: &str,
        workflow_id: Option<&str>,
    ) -> Result<usize, StoreError> {
        let conn = lock(&self.conn)?;
        let changed = match workflow_id {
            Some(wf) => conn.execute(
                "UPDATE kill_switches SET active = 0
                 WHERE tenant_id = ?1 AND workflow_id = ?2 AND active = 1",
                params![tenant_id, wf],
            )?,
            None => conn.execute(
                "UPDATE kill_switches SET active = 0
                 WHERE tenant_id = ?1 AND workflow_id IS NULL AND active = 1",
                params![tenant_id],
            )?,
        };
        Ok(changed)
    }

    /// Returns the active kill switch covering a workflow, if any:
    /// a tenant-wide switch or one scoped to this workflow.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure.
    pub fn active_kill_switch(
        &self,
        tenant_id: &str,
        workflow_id: &str,
    ) -> Result<Option<KillSwitch>, StoreError> {
        let conn = lock(&self.conn)?;
        let row = conn
            .query_row(
                "SELECT tenant_id, workflow_id, active, reason, activated_by, activated_at
                 FROM kill_switches
                 WHERE tenant_id = ?1 AND active = 1
                   AND (workflow_id IS NULL OR workflow_id = ?2)
                 ORDER BY workflow_id IS NOT NULL
                 LIMIT 1",
                params![tenant_id, workflow_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(tenant_id, workflow_id, active, reason, activated_by, activated_at)| {
            Ok(KillSwitch {
                tenant_id,
                workflow_id,
                active,
                reason,
                activated_by,
                activated_at: parse_ts("kill_switches", &activated_at)?,
            })
        })
        .transpose()
    }

    // =========================================================================
    // Vendors
    // =========================================================================

    /// Creates or replaces a vendor record (breaker state untouched).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on write failure.
    pub fn upsert_vendor(&self, vendor: &Vendor) -> Result<(), StoreError> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO vendors (id, name, rate_limit_per_minute) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 rate_limit_per_minute = excluded.rate_limit_per_minute",
            params![vendor.id, vendor.name, vendor.rate_limit_per_minute],
        )?;
        Ok(())
    }

    /// Fetches a vendor by name (the form payloads carry).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure.
    pub fn get_vendor_by_name(&self, name: &str) -> Result<Option<Vendor>, StoreError> {
        let conn = lock(&self.conn)?;
        let vendor = conn
            .query_row(
                "SELECT id, name, rate_limit_per_minute FROM vendors WHERE name = ?1",
                params![name],
                |row| {
                    Ok(Vendor {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        rate_limit_per_minute: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(vendor)
    }

    /// Loads the durable breaker mirror for a vendor. Returns a fresh
    /// closed snapshot when the vendor has none recorded.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query or decode failure.
    pub fn load_breaker_mirror(&self, vendor_name: &str) -> Result<BreakerSnapshot, StoreError> {
        let conn = lock(&self.conn)?;
        let row = conn
            .query_row(
                "SELECT breaker_state, breaker_failure_count, breaker_opened_at
                 FROM vendors WHERE name = ?1",
                params![vendor_name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((state, failure_count, opened_at)) = row else {
            return Ok(BreakerSnapshot::new());
        };
        let state = BreakerState::parse(&state).ok_or_else(|| StoreError::Corrupt {
            table: "vendors",
            message: format!("bad breaker state {state:?}"),
        })?;
        Ok(BreakerSnapshot {
            state,
            failure_count,
            opened_at: opened_at
                .as_deref()
                .map(|s| parse_ts("vendors", s))
                .transpose()?,
            last_failure_at: None,
            probes_in_flight: 0,
        })
    }

    /// Writes the durable breaker mirror for a vendor.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on write failure.
    pub fn save_breaker_mirror(
        &self,
        vendor_name: &str,
        snapshot: &BreakerSnapshot,
    ) -> Result<(), StoreError> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "UPDATE vendors SET breaker_state = ?2, breaker_failure_count = ?3,
                                breaker_opened_at = ?4
             WHERE name = ?1",
            params![
                vendor_name,
                snapshot.state.as_str(),
                snapshot.failure_count,
                snapshot.opened_at.map(to_ts),
            ],
        )?;
        Ok(())
    }
}

/// Convenience: builds a timestamped kill switch record.
#[must_use]
pub fn kill_switch(
    tenant_id: &str,
    workflow_id: Option<&str>,
    reason: &str,
    activated_by: &str,
    activated_at: DateTime<Utc>,
) -> KillSwitch {
    KillSwitch {
        tenant_id: tenant_id.to_string(),
        workflow_id: workflow_id.map(str::to_string),
        active: true,
        reason: reason.to_string(),
        activated_by: activated_by.to_string(),
        activated_at,
    }
}
