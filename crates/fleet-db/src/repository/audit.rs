//! # Audit Log Repository
//!
//! Append-only operational trail. Every coordination decision lands
//! here: sync broadcasts, conflict resolutions, role changes, split-brain
//! detections, degraded-mode entries, rejected operations.
//!
//! The per-device row count over a sliding window also backs the
//! rate limiter, so writes must never be skipped for "uninteresting"
//! operations.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::DbResult;
use fleet_core::AuditEntry;

/// Query filter for audit reads. All fields optional, ANDed together.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    /// Restrict to entries for this device.
    pub device_id: Option<String>,

    /// Restrict to this event type.
    pub event_type: Option<String>,

    /// Entries at or after this time.
    pub since: Option<DateTime<Utc>>,

    /// Entries strictly before this time.
    pub until: Option<DateTime<Utc>>,

    /// Maximum rows returned (newest first). Defaults to 100.
    pub limit: Option<i64>,
}

/// Repository for audit log rows.
#[derive(Debug, Clone)]
pub struct AuditRepository {
    pool: SqlitePool,
}

impl AuditRepository {
    /// Creates a new AuditRepository.
    pub fn new(pool: SqlitePool) -> Self {
        AuditRepository { pool }
    }

    /// Appends an entry inside a caller-owned transaction.
    pub async fn append(
        &self,
        conn: &mut SqliteConnection,
        entry: &AuditEntry,
    ) -> DbResult<()> {
        debug!(
            event_type = %entry.event_type,
            operation = %entry.operation,
            status = ?entry.status,
            device_id = ?entry.device_id,
            "Writing audit entry"
        );

        sqlx::query(
            r#"
            INSERT INTO audit_log
                (id, event_type, operation, status, device_id, user_id, details, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.event_type)
        .bind(&entry.operation)
        .bind(entry.status)
        .bind(&entry.device_id)
        .bind(&entry.user_id)
        .bind(&entry.details)
        .bind(entry.created_at)
        .execute(conn)
        .await?;

        Ok(())
    }

    /// Appends a standalone entry straight on the pool.
    pub async fn record(&self, entry: &AuditEntry) -> DbResult<()> {
        let mut conn = self.pool.acquire().await?;
        self.append(&mut conn, entry).await
    }

    /// Counts a device's entries since a cutoff. Backs the rate limiter.
    pub async fn count_for_device_since(
        &self,
        device_id: &str,
        since: DateTime<Utc>,
    ) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM audit_log WHERE device_id = ?1 AND created_at >= ?2",
        )
        .bind(device_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// Returns entries matching the filter, newest first.
    pub async fn list_filtered(&self, filter: &AuditFilter) -> DbResult<Vec<AuditEntry>> {
        let limit = filter.limit.unwrap_or(100);

        let mut sql = String::from("SELECT * FROM audit_log WHERE 1 = 1");
        if filter.device_id.is_some() {
            sql.push_str(" AND device_id = ?");
        }
        if filter.event_type.is_some() {
            sql.push_str(" AND event_type = ?");
        }
        if filter.since.is_some() {
            sql.push_str(" AND created_at >= ?");
        }
        if filter.until.is_some() {
            sql.push_str(" AND created_at < ?");
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?");

        let mut query = sqlx::query_as::<_, AuditEntry>(&sql);
        if let Some(device_id) = &filter.device_id {
            query = query.bind(device_id);
        }
        if let Some(event_type) = &filter.event_type {
            query = query.bind(event_type);
        }
        if let Some(since) = filter.since {
            query = query.bind(since);
        }
        if let Some(until) = filter.until {
            query = query.bind(until);
        }
        query = query.bind(limit);

        let entries = query.fetch_all(&self.pool).await?;
        Ok(entries)
    }
}
