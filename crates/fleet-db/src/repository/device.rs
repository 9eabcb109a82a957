//! # Device Repository
//!
//! Authoritative store of device identity, role, priority and liveness.
//!
//! Devices are never hard-deleted: deactivation flips `is_active` and the
//! row is retained for history and reactivation on the next registration.

use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use fleet_core::{Device, DeviceRole};

/// Repository for device rows.
#[derive(Debug, Clone)]
pub struct DeviceRepository {
    pool: SqlitePool,
}

impl DeviceRepository {
    /// Creates a new DeviceRepository.
    pub fn new(pool: SqlitePool) -> Self {
        DeviceRepository { pool }
    }

    // =========================================================================
    // Mutations (transaction-composable)
    // =========================================================================

    /// Creates or updates a device from a registration/heartbeat.
    ///
    /// Refreshes `last_seen`, applies the announced role and priority, and
    /// reactivates the device if it was deactivated.
    pub async fn upsert(
        &self,
        conn: &mut SqliteConnection,
        device_id: &str,
        role: DeviceRole,
        priority: i64,
    ) -> DbResult<Device> {
        let now = Utc::now();

        debug!(device_id = %device_id, %role, priority, "Upserting device");

        sqlx::query(
            r#"
            INSERT INTO devices (device_id, role, priority, last_seen, is_active, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, 1, ?4, ?4)
            ON CONFLICT(device_id) DO UPDATE SET
                role = excluded.role,
                priority = excluded.priority,
                last_seen = excluded.last_seen,
                is_active = 1,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(device_id)
        .bind(role)
        .bind(priority)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        let device =
            sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE device_id = ?1")
                .bind(device_id)
                .fetch_one(&mut *conn)
                .await?;

        Ok(device)
    }

    /// Deactivates a device. The row is retained.
    pub async fn deactivate(&self, conn: &mut SqliteConnection, device_id: &str) -> DbResult<()> {
        let now = Utc::now();

        let result = sqlx::query(
            "UPDATE devices SET is_active = 0, updated_at = ?2 WHERE device_id = ?1",
        )
        .bind(device_id)
        .bind(now)
        .execute(conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Device", device_id));
        }
        Ok(())
    }

    /// Sets a device's role.
    pub async fn set_role(
        &self,
        conn: &mut SqliteConnection,
        device_id: &str,
        role: DeviceRole,
    ) -> DbResult<()> {
        let now = Utc::now();

        let result =
            sqlx::query("UPDATE devices SET role = ?2, updated_at = ?3 WHERE device_id = ?1")
                .bind(device_id)
                .bind(role)
                .bind(now)
                .execute(conn)
                .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Device", device_id));
        }
        Ok(())
    }

    /// Refreshes a device's last_seen timestamp.
    pub async fn touch_last_seen(
        &self,
        conn: &mut SqliteConnection,
        device_id: &str,
    ) -> DbResult<()> {
        let now = Utc::now();

        sqlx::query("UPDATE devices SET last_seen = ?2, updated_at = ?2 WHERE device_id = ?1")
            .bind(device_id)
            .bind(now)
            .execute(conn)
            .await?;

        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Fetches a device by id.
    pub async fn get(&self, device_id: &str) -> DbResult<Option<Device>> {
        let device =
            sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE device_id = ?1")
                .bind(device_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(device)
    }

    /// Returns the unique active leader, or None.
    ///
    /// None is also returned while more than one active leader exists:
    /// that condition is split-brain, surfaced by [`list_leaders`] and
    /// resolved by the election coordinator rather than masked here.
    ///
    /// [`list_leaders`]: DeviceRepository::list_leaders
    pub async fn get_leader(&self) -> DbResult<Option<Device>> {
        let mut leaders = self.list_leaders().await?;
        if leaders.len() == 1 {
            Ok(leaders.pop())
        } else {
            Ok(None)
        }
    }

    /// Returns every active device with role = leader.
    pub async fn list_leaders(&self) -> DbResult<Vec<Device>> {
        let leaders = sqlx::query_as::<_, Device>(
            r#"
            SELECT * FROM devices
            WHERE role = 'leader' AND is_active = 1
            ORDER BY priority DESC, last_seen DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(leaders)
    }

    /// Returns all active devices, highest priority first.
    ///
    /// Equal priorities order by device id ascending, matching the
    /// election tie-break.
    pub async fn list_active(&self) -> DbResult<Vec<Device>> {
        let devices = sqlx::query_as::<_, Device>(
            r#"
            SELECT * FROM devices
            WHERE is_active = 1
            ORDER BY priority DESC, device_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(devices)
    }

    /// Returns every device, active or not.
    pub async fn list_all(&self) -> DbResult<Vec<Device>> {
        let devices =
            sqlx::query_as::<_, Device>("SELECT * FROM devices ORDER BY device_id ASC")
                .fetch_all(&self.pool)
                .await?;

        Ok(devices)
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
    async fn test_upsert_reactivates_and_refreshes() {
        let db = test_db().await;
        let repo = db.devices();

        {
            let mut conn = db.pool().acquire().await.unwrap();
            repo.upsert(&mut conn, "pos-1", DeviceRole::Follower, 5)
                .await
                .unwrap();
            repo.deactivate(&mut conn, "pos-1").await.unwrap();
            let device = repo
                .upsert(&mut conn, "pos-1", DeviceRole::Follower, 7)
                .await
                .unwrap();
            assert!(device.is_active);
            assert_eq!(device.priority, 7);
        }

        assert_eq!(repo.list_active().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_get_leader_hides_split_brain() {
        let db = test_db().await;
        let repo = db.devices();

        {
            let mut conn = db.pool().acquire().await.unwrap();
            repo.upsert(&mut conn, "a", DeviceRole::Leader, 1)
                .await
                .unwrap();
            repo.upsert(&mut conn, "b", DeviceRole::Leader, 2)
                .await
                .unwrap();
        }

        assert!(repo.get_leader().await.unwrap().is_none());
        assert_eq!(repo.list_leaders().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_set_role_unknown_device() {
        let db = test_db().await;
        let repo = db.devices();

        let mut conn = db.pool().acquire().await.unwrap();
        let err = repo
            .set_role(&mut conn, "ghost", DeviceRole::Leader)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_list_active_orders_by_priority_then_id() {
        let db = test_db().await;
        let repo = db.devices();

        {
            let mut conn = db.pool().acquire().await.unwrap();
            repo.upsert(&mut conn, "c", DeviceRole::Follower, 5)
                .await
                .unwrap();
            repo.upsert(&mut conn, "a", DeviceRole::Follower, 5)
                .await
                .unwrap();
            repo.upsert(&mut conn, "b", DeviceRole::Follower, 9)
                .await
                .unwrap();
        }

        let ids: Vec<String> = repo
            .list_active()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.device_id)
            .collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }
}
