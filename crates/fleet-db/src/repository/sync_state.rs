//! # Sync State Repository
//!
//! Per-device sync posture: status, pending-change counter, last sync
//! time and last error.
//!
//! ## Counter Rules
//! - `pending_changes_count` never drops below zero (SQL `MAX(0, ...)`
//!   plus a CHECK constraint on the table).
//! - Incrementing moves the device to `pending`.
//! - Decrementing to exactly zero moves it to `synced`.
//! - `mark_synced` resets the counter, clears the error and stamps
//!   `last_sync_at`.

use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::DbResult;
use fleet_core::{SyncState, SyncStatus};

/// Repository for per-device sync state rows.
#[derive(Debug, Clone)]
pub struct SyncStateRepository {
    pool: SqlitePool,
}

impl SyncStateRepository {
    /// Creates a new SyncStateRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SyncStateRepository { pool }
    }

    // =========================================================================
    // Mutations (transaction-composable)
    // =========================================================================

    /// Ensures a state row exists for the device and returns it.
    ///
    /// A fresh row starts as `synced` with zero pending changes.
    pub async fn get_or_create(
        &self,
        conn: &mut SqliteConnection,
        device_id: &str,
    ) -> DbResult<SyncState> {
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO sync_state
                (device_id, status, pending_changes_count, last_sync_at, last_error_message, updated_at)
            VALUES (?1, 'synced', 0, NULL, NULL, ?2)
            "#,
        )
        .bind(device_id)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        let state =
            sqlx::query_as::<_, SyncState>("SELECT * FROM sync_state WHERE device_id = ?1")
                .bind(device_id)
                .fetch_one(&mut *conn)
                .await?;

        Ok(state)
    }

    /// Adds `n` pending changes and marks the device `pending`.
    pub async fn increment_pending(
        &self,
        conn: &mut SqliteConnection,
        device_id: &str,
        n: i64,
    ) -> DbResult<()> {
        let now = Utc::now();

        debug!(device_id = %device_id, n, "Incrementing pending changes");

        sqlx::query(
            r#"
            UPDATE sync_state SET
                pending_changes_count = pending_changes_count + ?2,
                status = 'pending',
                updated_at = ?3
            WHERE device_id = ?1
            "#,
        )
        .bind(device_id)
        .bind(n)
        .bind(now)
        .execute(conn)
        .await?;

        Ok(())
    }

    /// Removes up to `n` pending changes, flooring at zero.
    ///
    /// When the counter reaches zero the device flips to `synced` and the
    /// sync time is stamped; otherwise the current status is kept.
    pub async fn decrement_pending(
        &self,
        conn: &mut SqliteConnection,
        device_id: &str,
        n: i64,
    ) -> DbResult<()> {
        let now = Utc::now();

        sqlx::query(
            r#"
            UPDATE sync_state SET
                pending_changes_count = MAX(0, pending_changes_count - ?2),
                status = CASE
                    WHEN MAX(0, pending_changes_count - ?2) = 0 THEN 'synced'
                    ELSE status
                END,
                last_sync_at = CASE
                    WHEN MAX(0, pending_changes_count - ?2) = 0 THEN ?3
                    ELSE last_sync_at
                END,
                updated_at = ?3
            WHERE device_id = ?1
            "#,
        )
        .bind(device_id)
        .bind(n)
        .bind(now)
        .execute(conn)
        .await?;

        Ok(())
    }

    /// Records a sync failure: status `error` plus the message.
    pub async fn set_error(
        &self,
        conn: &mut SqliteConnection,
        device_id: &str,
        message: &str,
    ) -> DbResult<()> {
        let now = Utc::now();

        sqlx::query(
            r#"
            UPDATE sync_state SET
                status = 'error',
                last_error_message = ?2,
                updated_at = ?3
            WHERE device_id = ?1
            "#,
        )
        .bind(device_id)
        .bind(message)
        .bind(now)
        .execute(conn)
        .await?;

        Ok(())
    }

    /// Sets the sync status without touching counters.
    pub async fn set_status(
        &self,
        conn: &mut SqliteConnection,
        device_id: &str,
        status: SyncStatus,
    ) -> DbResult<()> {
        let now = Utc::now();

        sqlx::query(
            "UPDATE sync_state SET status = ?2, updated_at = ?3 WHERE device_id = ?1",
        )
        .bind(device_id)
        .bind(status)
        .bind(now)
        .execute(conn)
        .await?;

        Ok(())
    }

    /// Marks a full successful sync: counter to zero, error cleared,
    /// sync time stamped.
    pub async fn mark_synced(
        &self,
        conn: &mut SqliteConnection,
        device_id: &str,
    ) -> DbResult<()> {
        let now = Utc::now();

        sqlx::query(
            r#"
            UPDATE sync_state SET
                status = 'synced',
                pending_changes_count = 0,
                last_sync_at = ?2,
                last_error_message = NULL,
                updated_at = ?2
            WHERE device_id = ?1
            "#,
        )
        .bind(device_id)
        .bind(now)
        .execute(conn)
        .await?;

        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Fetches a device's sync state.
    pub async fn get(&self, device_id: &str) -> DbResult<Option<SyncState>> {
        let state =
            sqlx::query_as::<_, SyncState>("SELECT * FROM sync_state WHERE device_id = ?1")
                .bind(device_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(state)
    }

    /// Devices with changes still waiting to sync, largest backlog first.
    pub async fn list_with_pending(&self) -> DbResult<Vec<SyncState>> {
        let states = sqlx::query_as::<_, SyncState>(
            r#"
            SELECT * FROM sync_state
            WHERE pending_changes_count > 0
            ORDER BY pending_changes_count DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(states)
    }

    /// Devices currently in the error state.
    pub async fn list_with_errors(&self) -> DbResult<Vec<SyncState>> {
        let states = sqlx::query_as::<_, SyncState>(
            "SELECT * FROM sync_state WHERE status = 'error' ORDER BY updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(states)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};

    async fn test_db() -> Database {
        Database::new(DbConfig::in_memory()).await.unwrap()
    }

    #[tokio::test]
    async fn test_counter_floors_at_zero() {
        let db = test_db().await;
        let repo = db.sync_states();

        {
            let mut conn = db.pool().acquire().await.unwrap();
            repo.get_or_create(&mut conn, "pos-1").await.unwrap();
            repo.increment_pending(&mut conn, "pos-1", 2).await.unwrap();
            repo.decrement_pending(&mut conn, "pos-1", 5).await.unwrap();
        }

        let state = repo.get("pos-1").await.unwrap().unwrap();
        assert_eq!(state.pending_changes_count, 0);
        assert_eq!(state.status, SyncStatus::Synced);
        assert!(state.last_sync_at.is_some());
    }

    #[tokio::test]
    async fn test_partial_decrement_stays_pending() {
        let db = test_db().await;
        let repo = db.sync_states();

        {
            let mut conn = db.pool().acquire().await.unwrap();
            repo.get_or_create(&mut conn, "pos-1").await.unwrap();
            repo.increment_pending(&mut conn, "pos-1", 3).await.unwrap();
            repo.decrement_pending(&mut conn, "pos-1", 1).await.unwrap();
        }

        let state = repo.get("pos-1").await.unwrap().unwrap();
        assert_eq!(state.pending_changes_count, 2);
        assert_eq!(state.status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn test_mark_synced_clears_error() {
        let db = test_db().await;
        let repo = db.sync_states();

        {
            let mut conn = db.pool().acquire().await.unwrap();
            repo.get_or_create(&mut conn, "pos-1").await.unwrap();
            repo.increment_pending(&mut conn, "pos-1", 4).await.unwrap();
            repo.set_error(&mut conn, "pos-1", "network timeout").await.unwrap();
            repo.mark_synced(&mut conn, "pos-1").await.unwrap();
        }

        let state = repo.get("pos-1").await.unwrap().unwrap();
        assert_eq!(state.status, SyncStatus::Synced);
        assert_eq!(state.pending_changes_count, 0);
        assert!(state.last_error_message.is_none());
    }

    #[tokio::test]
    async fn test_list_with_pending_orders_by_backlog() {
        let db = test_db().await;
        let repo = db.sync_states();

        {
            let mut conn = db.pool().acquire().await.unwrap();
            for (id, n) in [("a", 1), ("b", 9), ("c", 0)] {
                repo.get_or_create(&mut conn, id).await.unwrap();
                if n > 0 {
                    repo.increment_pending(&mut conn, id, n).await.unwrap();
                }
            }
        }

        let ids: Vec<String> = repo
            .list_with_pending()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.device_id)
            .collect();
        assert_eq!(ids, vec!["b", "a"]);
    }
}
