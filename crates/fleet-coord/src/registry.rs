//! # Device Registry
//!
//! Coordinator-facing view of the device table. Registration, liveness
//! and role changes all commit together with their audit entries: a
//! mutation that cannot be audited does not happen.

use tracing::{debug, info};

use crate::audit::AuditTrail;
use crate::error::{CoordError, CoordResult};
use fleet_core::{require, AuditEntry, AuditStatus, Device, DeviceRole};
use fleet_db::{Database, DbError};

/// Maps a missing-row store error onto the structural unknown-device error.
fn map_not_found(err: DbError, device_id: &str) -> CoordError {
    match err {
        DbError::NotFound { .. } => CoordError::UnknownDevice {
            device_id: device_id.to_string(),
        },
        other => other.into(),
    }
}

/// Registry of devices participating in the fleet.
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    db: Database,
    audit: AuditTrail,
}

impl DeviceRegistry {
    /// Creates a registry over the given database.
    pub fn new(db: Database) -> Self {
        let audit = AuditTrail::new(&db);
        DeviceRegistry { db, audit }
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Registers a device (or refreshes an existing registration).
    ///
    /// Creates the device row, ensures its sync state exists and audits
    /// the registration, all in one transaction. Re-registering a
    /// deactivated device reactivates it.
    pub async fn register(
        &self,
        device_id: &str,
        role: DeviceRole,
        priority: i64,
    ) -> CoordResult<Device> {
        require("device_id", device_id)?;
        if !(0..=100).contains(&priority) {
            return Err(fleet_core::ValidationError::InvalidValue {
                field: "priority",
                reason: format!("must be 0-100, got {}", priority),
            }
            .into());
        }

        let mut tx = self.db.begin().await?;

        let device = self
            .db
            .devices()
            .upsert(&mut tx, device_id, role, priority)
            .await?;
        self.db.sync_states().get_or_create(&mut tx, device_id).await?;
        self.audit
            .record_tx(
                &mut tx,
                AuditEntry::new("device", "register", AuditStatus::Success)
                    .device(device_id)
                    .details(format!("role={} priority={}", role, priority)),
            )
            .await?;

        tx.commit().await.map_err(DbError::from)?;

        info!(device_id = %device_id, %role, priority, "Device registered");
        Ok(device)
    }

    /// Refreshes a device's liveness timestamp.
    pub async fn heartbeat(&self, device_id: &str) -> CoordResult<()> {
        require("device_id", device_id)?;

        let mut conn = self.db.pool().acquire().await.map_err(DbError::from)?;
        self.db.devices().touch_last_seen(&mut conn, device_id).await?;

        debug!(device_id = %device_id, "Heartbeat recorded");
        Ok(())
    }

    /// Deactivates a device. The row is retained for history.
    pub async fn deactivate(&self, device_id: &str) -> CoordResult<()> {
        let mut tx = self.db.begin().await?;

        self.db
            .devices()
            .deactivate(&mut tx, device_id)
            .await
            .map_err(|e| map_not_found(e, device_id))?;
        self.audit
            .record_tx(
                &mut tx,
                AuditEntry::new("device", "deactivate", AuditStatus::Success)
                    .device(device_id),
            )
            .await?;

        tx.commit().await.map_err(DbError::from)?;

        info!(device_id = %device_id, "Device deactivated");
        Ok(())
    }

    /// Changes a device's role, with an audit entry in the same commit.
    pub async fn change_role(
        &self,
        device_id: &str,
        role: DeviceRole,
        reason: Option<&str>,
    ) -> CoordResult<Device> {
        let mut tx = self.db.begin().await?;

        self.db
            .devices()
            .set_role(&mut tx, device_id, role)
            .await
            .map_err(|e| map_not_found(e, device_id))?;
        self.audit
            .record_tx(
                &mut tx,
                AuditEntry::new("role_change", "role_update", AuditStatus::Success)
                    .device(device_id)
                    .details(format!(
                        "new_role={} reason={}",
                        role,
                        reason.unwrap_or("unspecified")
                    )),
            )
            .await?;

        tx.commit().await.map_err(DbError::from)?;

        info!(device_id = %device_id, %role, "Device role changed");

        self.db
            .devices()
            .get(device_id)
            .await?
            .ok_or_else(|| CoordError::UnknownDevice {
                device_id: device_id.to_string(),
            })
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Fetches a device, erroring if the registry does not know it.
    pub async fn get_known(&self, device_id: &str) -> CoordResult<Device> {
        self.db
            .devices()
            .get(device_id)
            .await?
            .ok_or_else(|| CoordError::UnknownDevice {
                device_id: device_id.to_string(),
            })
    }

    /// Fetches a device if it exists.
    pub async fn get(&self, device_id: &str) -> CoordResult<Option<Device>> {
        Ok(self.db.devices().get(device_id).await?)
    }

    /// Returns the unique active leader, or None (including during
    /// split-brain).
    pub async fn current_leader(&self) -> CoordResult<Option<Device>> {
        Ok(self.db.devices().get_leader().await?)
    }

    /// Returns all active devices, highest priority first.
    pub async fn list_active(&self) -> CoordResult<Vec<Device>> {
        Ok(self.db.devices().list_active().await?)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_db::DbConfig;

    async fn test_registry() -> DeviceRegistry {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        DeviceRegistry::new(db)
    }

    #[tokio::test]
    async fn test_register_creates_device_and_sync_state() {
        let registry = test_registry().await;

        let device = registry
            .register("pos-1", DeviceRole::Follower, 50)
            .await
            .unwrap();
        assert_eq!(device.device_id, "pos-1");
        assert!(device.is_active);

        // Sync state row was created alongside.
        let state = registry.db.sync_states().get("pos-1").await.unwrap();
        assert!(state.is_some());
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_input() {
        let registry = test_registry().await;

        let err = registry
            .register("", DeviceRole::Follower, 50)
            .await
            .unwrap_err();
        assert!(err.is_validation());

        let err = registry
            .register("pos-1", DeviceRole::Follower, 500)
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_change_role_unknown_device_is_structural() {
        let registry = test_registry().await;

        let err = registry
            .change_role("ghost", DeviceRole::Leader, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::UnknownDevice { .. }));
    }

    #[tokio::test]
    async fn test_deactivate_then_reregister_reactivates() {
        let registry = test_registry().await;

        registry
            .register("pos-1", DeviceRole::Follower, 50)
            .await
            .unwrap();
        registry.deactivate("pos-1").await.unwrap();
        assert!(registry.list_active().await.unwrap().is_empty());

        let device = registry
            .register("pos-1", DeviceRole::Follower, 60)
            .await
            .unwrap();
        assert!(device.is_active);
        assert_eq!(device.priority, 60);
    }
}
