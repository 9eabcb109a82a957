//! # Sync Event Repository
//!
//! Persistence for the sync-event lifecycle.
//!
//! ## Dispatch Queue Shape
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Sync Event Queue                                     │
//! │                                                                         │
//! │  ingest ──► INSERT status='pending'                                    │
//! │                                                                         │
//! │  periodic scan ──► SELECT WHERE status IN                              │
//! │                      ('pending','queued','dispatched')                 │
//! │                    ORDER BY created_at ASC                             │
//! │                    ('queued' and 'dispatched' rows are events          │
//! │                     stranded by a crash between persist/broadcast      │
//! │                     and the accounting commit)                         │
//! │                                                                         │
//! │  success ──► status = 'synced'                                         │
//! │  failure ──► attempts += 1; 'failed' once attempts reach the cap       │
//! │                                                                         │
//! │  Events are retained indefinitely (audit / history / replay).          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use fleet_core::{SyncEvent, SyncEventStatus};

/// Per-device event counters, for queue-status queries.
#[derive(Debug, Clone, Default, sqlx::FromRow)]
pub struct EventStatusSummary {
    pub total: i64,
    pub pending: i64,
    pub synced: i64,
    pub failed: i64,
}

/// Repository for sync event rows.
#[derive(Debug, Clone)]
pub struct EventRepository {
    pool: SqlitePool,
}

impl EventRepository {
    /// Creates a new EventRepository.
    pub fn new(pool: SqlitePool) -> Self {
        EventRepository { pool }
    }

    // =========================================================================
    // Mutations (transaction-composable)
    // =========================================================================

    /// Persists a new event.
    pub async fn insert(&self, conn: &mut SqliteConnection, event: &SyncEvent) -> DbResult<()> {
        debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            record_key = ?event.record_key,
            "Persisting sync event"
        );

        sqlx::query(
            r#"
            INSERT INTO sync_events (
                id, event_type, payload, record_key, origin_device,
                origin_user, status, attempts, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&event.id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(&event.record_key)
        .bind(&event.origin_device)
        .bind(&event.origin_user)
        .bind(event.status)
        .bind(event.attempts)
        .bind(event.created_at)
        .execute(conn)
        .await?;

        Ok(())
    }

    /// Sets an event's lifecycle status.
    pub async fn set_status(
        &self,
        conn: &mut SqliteConnection,
        event_id: &str,
        status: SyncEventStatus,
    ) -> DbResult<()> {
        let result = sqlx::query("UPDATE sync_events SET status = ?2 WHERE id = ?1")
            .bind(event_id)
            .bind(status)
            .execute(conn)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("SyncEvent", event_id));
        }
        Ok(())
    }

    /// Records a retryable dispatch failure.
    ///
    /// Increments the attempt counter; once it reaches `max_attempts` the
    /// event is marked `failed` (terminal), otherwise it returns to
    /// `pending` for the next periodic run. Returns the resulting status.
    pub async fn record_dispatch_failure(
        &self,
        conn: &mut SqliteConnection,
        event_id: &str,
        max_attempts: i64,
    ) -> DbResult<SyncEventStatus> {
        sqlx::query(
            r#"
            UPDATE sync_events SET
                attempts = attempts + 1,
                status = CASE WHEN attempts + 1 >= ?2 THEN 'failed' ELSE 'pending' END
            WHERE id = ?1
            "#,
        )
        .bind(event_id)
        .bind(max_attempts)
        .execute(&mut *conn)
        .await?;

        let status: SyncEventStatus =
            sqlx::query_scalar("SELECT status FROM sync_events WHERE id = ?1")
                .bind(event_id)
                .fetch_one(&mut *conn)
                .await?;

        Ok(status)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Fetches an event by id.
    pub async fn get(&self, event_id: &str) -> DbResult<Option<SyncEvent>> {
        let event =
            sqlx::query_as::<_, SyncEvent>("SELECT * FROM sync_events WHERE id = ?1")
                .bind(event_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(event)
    }

    /// Finds the pending event currently holding a record key, if any.
    ///
    /// The ingest path keeps at most one pending event per record key, so
    /// a single row (the oldest, defensively) is enough.
    pub async fn find_pending_by_record_key(
        &self,
        record_key: &str,
    ) -> DbResult<Option<SyncEvent>> {
        let event = sqlx::query_as::<_, SyncEvent>(
            r#"
            SELECT * FROM sync_events
            WHERE record_key = ?1 AND status = 'pending'
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(record_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(event)
    }

    /// Returns events awaiting dispatch, oldest first.
    ///
    /// Includes `queued` and `dispatched` rows: both mark an event caught
    /// mid-flight by a crash before its accounting committed, and the
    /// next periodic run must pick them up again.
    pub async fn list_pending(&self, limit: i64) -> DbResult<Vec<SyncEvent>> {
        let events = sqlx::query_as::<_, SyncEvent>(
            r#"
            SELECT * FROM sync_events
            WHERE status IN ('pending', 'queued', 'dispatched')
            ORDER BY created_at ASC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    /// Returns pending events for a sync-request pull: events NOT
    /// originated by the requesting device, optionally newer than a
    /// cursor timestamp, oldest first.
    pub async fn list_since(
        &self,
        exclude_device: &str,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> DbResult<Vec<SyncEvent>> {
        let events = match since {
            Some(since) => {
                sqlx::query_as::<_, SyncEvent>(
                    r#"
                    SELECT * FROM sync_events
                    WHERE origin_device != ?1 AND status = 'pending' AND created_at > ?2
                    ORDER BY created_at ASC
                    LIMIT ?3
                    "#,
                )
                .bind(exclude_device)
                .bind(since)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, SyncEvent>(
                    r#"
                    SELECT * FROM sync_events
                    WHERE origin_device != ?1 AND status = 'pending'
                    ORDER BY created_at ASC
                    LIMIT ?2
                    "#,
                )
                .bind(exclude_device)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(events)
    }

    /// Per-device status counters.
    pub async fn status_summary(&self, device_id: &str) -> DbResult<EventStatusSummary> {
        let summary = sqlx::query_as::<_, EventStatusSummary>(
            r#"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(status = 'pending'), 0) AS pending,
                COALESCE(SUM(status = 'synced'), 0) AS synced,
                COALESCE(SUM(status = 'failed'), 0) AS failed
            FROM sync_events
            WHERE origin_device = ?1
            "#,
        )
        .bind(device_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(summary)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use serde_json::json;

    async fn test_db() -> Database {
        Database::new(DbConfig::in_memory()).await.unwrap()
    }

    fn sample_event(record_id: &str, device: &str) -> SyncEvent {
        SyncEvent::new(
            "stock_update",
            &json!({"record_id": record_id, "qty": 3}),
            device,
            None,
        )
    }

    #[tokio::test]
    async fn test_insert_and_find_pending_by_record_key() {
        let db = test_db().await;
        let repo = db.events();
        let event = sample_event("rec-1", "pos-1");

        {
            let mut conn = db.pool().acquire().await.unwrap();
            repo.insert(&mut conn, &event).await.unwrap();
        }

        let found = repo
            .find_pending_by_record_key("rec-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, event.id);
        assert_eq!(found.status, SyncEventStatus::Pending);
        assert!(repo.find_pending_by_record_key("rec-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dispatch_failure_counts_up_to_failed() {
        let db = test_db().await;
        let repo = db.events();
        let event = sample_event("rec-1", "pos-1");

        let mut conn = db.pool().acquire().await.unwrap();
        repo.insert(&mut conn, &event).await.unwrap();

        let s1 = repo
            .record_dispatch_failure(&mut conn, &event.id, 3)
            .await
            .unwrap();
        assert_eq!(s1, SyncEventStatus::Pending);

        let s2 = repo
            .record_dispatch_failure(&mut conn, &event.id, 3)
            .await
            .unwrap();
        assert_eq!(s2, SyncEventStatus::Pending);

        let s3 = repo
            .record_dispatch_failure(&mut conn, &event.id, 3)
            .await
            .unwrap();
        assert_eq!(s3, SyncEventStatus::Failed);
    }

    #[tokio::test]
    async fn test_list_pending_rescans_events_stranded_mid_flight() {
        let db = test_db().await;
        let repo = db.events();
        let stranded = sample_event("r1", "pos-1");
        let done = sample_event("r2", "pos-1");

        {
            let mut conn = db.pool().acquire().await.unwrap();
            repo.insert(&mut conn, &stranded).await.unwrap();
            repo.insert(&mut conn, &done).await.unwrap();
            // A crash after the broadcast but before the accounting
            // commit leaves the row in 'dispatched'.
            repo.set_status(&mut conn, &stranded.id, SyncEventStatus::Dispatched)
                .await
                .unwrap();
            repo.set_status(&mut conn, &done.id, SyncEventStatus::Synced)
                .await
                .unwrap();
        }

        let pending = repo.list_pending(50).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, stranded.id);
    }

    #[tokio::test]
    async fn test_list_since_excludes_origin_device() {
        let db = test_db().await;
        let repo = db.events();

        {
            let mut conn = db.pool().acquire().await.unwrap();
            repo.insert(&mut conn, &sample_event("r1", "pos-1"))
                .await
                .unwrap();
            repo.insert(&mut conn, &sample_event("r2", "pos-2"))
                .await
                .unwrap();
        }

        let for_pos1 = repo.list_since("pos-1", None, 50).await.unwrap();
        assert_eq!(for_pos1.len(), 1);
        assert_eq!(for_pos1[0].origin_device, "pos-2");
    }

    #[tokio::test]
    async fn test_status_summary() {
        let db = test_db().await;
        let repo = db.events();
        let a = sample_event("r1", "pos-1");
        let b = sample_event("r2", "pos-1");

        {
            let mut conn = db.pool().acquire().await.unwrap();
            repo.insert(&mut conn, &a).await.unwrap();
            repo.insert(&mut conn, &b).await.unwrap();
            repo.set_status(&mut conn, &b.id, SyncEventStatus::Synced)
                .await
                .unwrap();
        }

        let summary = repo.status_summary("pos-1").await.unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.synced, 1);
        assert_eq!(summary.failed, 0);
    }
}
