//! # Audit Trail
//!
//! Thin coordinator-side wrapper over the audit repository. Two write
//! paths:
//!
//! - [`AuditTrail::record`] for standalone entries (rejections, advisory
//!   warnings) that must land even when no mutation happened.
//! - [`AuditTrail::record_tx`] for entries that belong to a mutation and
//!   must commit or roll back with it.

use sqlx::SqliteConnection;

use crate::error::CoordResult;
use fleet_core::AuditEntry;
use fleet_db::{AuditFilter, AuditRepository, Database};

/// Coordinator-facing audit writer/reader.
#[derive(Debug, Clone)]
pub struct AuditTrail {
    repo: AuditRepository,
}

impl AuditTrail {
    /// Creates an audit trail over the given database.
    pub fn new(db: &Database) -> Self {
        AuditTrail { repo: db.audit() }
    }

    /// Writes a standalone entry.
    pub async fn record(&self, entry: AuditEntry) -> CoordResult<()> {
        self.repo.record(&entry).await?;
        Ok(())
    }

    /// Writes an entry inside a caller-owned transaction.
    pub async fn record_tx(
        &self,
        conn: &mut SqliteConnection,
        entry: AuditEntry,
    ) -> CoordResult<()> {
        self.repo.append(conn, &entry).await?;
        Ok(())
    }

    /// Counts a device's entries since a cutoff (rate limiting).
    pub async fn count_for_device_since(
        &self,
        device_id: &str,
        since: chrono::DateTime<chrono::Utc>,
    ) -> CoordResult<i64> {
        Ok(self.repo.count_for_device_since(device_id, since).await?)
    }

    /// Reads entries matching a filter, newest first.
    pub async fn query(&self, filter: &AuditFilter) -> CoordResult<Vec<AuditEntry>> {
        Ok(self.repo.list_filtered(filter).await?)
    }
}
