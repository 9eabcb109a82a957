//! # Edge Case Guards
//!
//! Defenses around the happy path: clock drift detection, per-device
//! rate limiting, oversized-payload handling, degraded-mode policies and
//! network partition responses.
//!
//! ## Guard Placement
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Edge Case Guards                                  │
//! │                                                                         │
//! │  inbound message                                                       │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  rate limit ────────► reject (validation error, audited)               │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  clock drift ───────► ADVISORY ONLY: flag + audit, message proceeds    │
//! │       │               (the event timeline still orders by the          │
//! │       ▼                coordinator's clock)                            │
//! │  payload size ──────► direct / compressed / chunked transfer           │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  normal handling                                                       │
//! │                                                                         │
//! │  On failure:  degradation_policy(kind) picks a reduced service mode    │
//! │  On partition: partition_response(device) picks a role-aware plan      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::audit::AuditTrail;
use crate::config::GuardSettings;
use crate::error::{CoordError, CoordResult};
use fleet_core::{AuditEntry, AuditStatus, DeviceRole, SyncStatus};
use fleet_db::Database;

// =============================================================================
// Clock Drift
// =============================================================================

/// Advisory report of a device clock running ahead or behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftReport {
    pub device_id: String,
    /// Signed drift: positive means the device clock runs ahead.
    pub drift_secs: i64,
    pub threshold_secs: u64,
}

// =============================================================================
// Payload Size
// =============================================================================

/// How a payload of a given size should travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSizeStrategy {
    /// Small enough to send as-is.
    Direct,
    /// Compress before sending.
    Compressed,
    /// Split into fixed-size chunks.
    Chunked {
        chunk_size: usize,
        chunk_count: usize,
    },
}

// =============================================================================
// Degraded Mode
// =============================================================================

/// Failure classes that trigger degraded operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    NetworkTimeout,
    StorageError,
    ResourceExhaustion,
    CapacityExhaustion,
    Unknown,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::NetworkTimeout => "network_timeout",
            FailureKind::StorageError => "storage_error",
            FailureKind::ResourceExhaustion => "resource_exhaustion",
            FailureKind::CapacityExhaustion => "capacity_exhaustion",
            FailureKind::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Reduced service mode chosen for a failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegradationStrategy {
    /// Serve from local state only, queue writes for later dispatch.
    OfflineMode,
    /// Stop accepting writes, keep serving reads.
    ReadOnlyMode,
    /// Shed non-essential work.
    ReducedFunctionality,
    /// Critical operations only.
    EmergencyMode,
    /// Bare minimum service, for failures we cannot classify.
    MinimalFunctionality,
}

/// What the device falls back to while degraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegradationFallback {
    LocalOperationsOnly,
    CacheOperations,
    EssentialOperationsOnly,
    CriticalOperationsOnly,
    MinimalFunctionality,
}

/// How service is restored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPath {
    /// Reconnects and resumes on its own.
    AutomaticReconnect,
    /// An operator has to step in.
    ManualIntervention,
    /// Process restart required.
    RestartRequired,
    /// Reclaim capacity first.
    CleanupRequired,
}

/// The full degraded-mode decision for one failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DegradationPlan {
    pub kind: FailureKind,
    pub strategy: DegradationStrategy,
    pub fallback: DegradationFallback,
    pub recovery: RecoveryPath,
}

impl DegradationPlan {
    /// Whether the failed operation may be retried without an operator.
    pub fn retry_allowed(&self) -> bool {
        self.recovery == RecoveryPath::AutomaticReconnect
    }
}

// =============================================================================
// Partition Response
// =============================================================================

/// Steps a partitioned device should take, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionAction {
    /// Keep serving local operations from local state.
    ContinueLocalOperations,
    /// Buffer outbound events until connectivity returns.
    BufferOutboundEvents,
    /// Mark local sync state offline.
    SwitchToOfflineMode,
    /// Reconnect with backoff.
    ReconnectWithBackoff,
    /// Full resync once reconnected.
    ResyncOnReconnect,
}

/// Steps to run once connectivity returns, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStep {
    /// Wait for the network to stabilize before acting.
    WaitForNetwork,
    /// Push operations queued while partitioned.
    SyncPendingOperations,
    /// Cross-check local state against the fleet.
    ValidateConsistency,
    /// Return to normal service.
    Resume,
}

/// Role-aware plan for riding out a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlan {
    pub device_id: String,
    pub role: DeviceRole,
    pub actions: Vec<PartitionAction>,
    pub recovery: Vec<RecoveryStep>,
}

// =============================================================================
// Edge Case Guard
// =============================================================================

/// Applies the guard policies around coordinator operations.
#[derive(Debug, Clone)]
pub struct EdgeCaseGuard {
    db: Database,
    audit: AuditTrail,
    settings: GuardSettings,
}

impl EdgeCaseGuard {
    /// Creates a guard over the given database with the given thresholds.
    pub fn new(db: Database, settings: GuardSettings) -> Self {
        let audit = AuditTrail::new(&db);
        EdgeCaseGuard {
            db,
            audit,
            settings,
        }
    }

    /// Checks a device-reported timestamp against the coordinator clock.
    ///
    /// Advisory: a drifted clock is flagged and audited but never blocks
    /// the message. Event ordering uses coordinator-assigned timestamps,
    /// so a drifted producer cannot skew the timeline.
    pub async fn detect_clock_drift(
        &self,
        device_id: &str,
        reported: DateTime<Utc>,
    ) -> CoordResult<Option<DriftReport>> {
        let drift = reported.signed_duration_since(Utc::now());
        let drift_secs = drift.num_seconds();

        if drift_secs.unsigned_abs() <= self.settings.drift_threshold_secs {
            return Ok(None);
        }

        warn!(
            device_id = %device_id,
            drift_secs,
            threshold_secs = self.settings.drift_threshold_secs,
            "Device clock drift beyond threshold"
        );
        self.audit
            .record(
                AuditEntry::new("edge_case", "clock_drift", AuditStatus::Warning)
                    .device(device_id)
                    .details(format!(
                        "drift_secs={} threshold_secs={}",
                        drift_secs, self.settings.drift_threshold_secs
                    )),
            )
            .await?;

        Ok(Some(DriftReport {
            device_id: device_id.to_string(),
            drift_secs,
            threshold_secs: self.settings.drift_threshold_secs,
        }))
    }

    /// Enforces the per-device operation budget over the sliding window.
    ///
    /// The budget is measured against the device's audit trail, so every
    /// audited operation counts. Exceeding it rejects the operation
    /// before any state change, and the rejection itself is audited.
    pub async fn check_rate_limit(&self, device_id: &str) -> CoordResult<()> {
        let window = Duration::seconds(self.settings.rate_limit_window_secs as i64);
        let since = Utc::now() - window;

        let count = self.audit.count_for_device_since(device_id, since).await?;
        if count < self.settings.rate_limit_max_ops {
            return Ok(());
        }

        warn!(
            device_id = %device_id,
            count,
            max_ops = self.settings.rate_limit_max_ops,
            "Rate limit exceeded"
        );
        self.audit
            .record(
                AuditEntry::new("edge_case", "rate_limited", AuditStatus::Warning)
                    .device(device_id)
                    .details(format!(
                        "count={} window_secs={}",
                        count, self.settings.rate_limit_window_secs
                    )),
            )
            .await?;

        Err(CoordError::RateLimited {
            device_id: device_id.to_string(),
            count,
            window_secs: self.settings.rate_limit_window_secs,
            max_ops: self.settings.rate_limit_max_ops,
        })
    }

    /// Picks the transfer strategy for a payload of the given size.
    pub fn classify_sync_size(&self, payload_bytes: usize) -> SyncSizeStrategy {
        if payload_bytes > self.settings.chunked_threshold_bytes {
            let chunk_size = self.settings.chunk_size_bytes;
            SyncSizeStrategy::Chunked {
                chunk_size,
                chunk_count: payload_bytes.div_ceil(chunk_size),
            }
        } else if payload_bytes > self.settings.compression_threshold_bytes {
            SyncSizeStrategy::Compressed
        } else {
            SyncSizeStrategy::Direct
        }
    }

    /// Chooses the degraded service mode for a failure class.
    ///
    /// Every entry into degraded mode is audited with the `degraded`
    /// status. Unknown failures get the most conservative plan: minimal
    /// functionality until an operator steps in.
    pub async fn degradation_policy(
        &self,
        device_id: &str,
        kind: FailureKind,
    ) -> CoordResult<DegradationPlan> {
        let (strategy, fallback, recovery) = match kind {
            FailureKind::NetworkTimeout => (
                DegradationStrategy::OfflineMode,
                DegradationFallback::LocalOperationsOnly,
                RecoveryPath::AutomaticReconnect,
            ),
            FailureKind::StorageError => (
                DegradationStrategy::ReadOnlyMode,
                DegradationFallback::CacheOperations,
                RecoveryPath::ManualIntervention,
            ),
            FailureKind::ResourceExhaustion => (
                DegradationStrategy::ReducedFunctionality,
                DegradationFallback::EssentialOperationsOnly,
                RecoveryPath::RestartRequired,
            ),
            FailureKind::CapacityExhaustion => (
                DegradationStrategy::EmergencyMode,
                DegradationFallback::CriticalOperationsOnly,
                RecoveryPath::CleanupRequired,
            ),
            FailureKind::Unknown => (
                DegradationStrategy::MinimalFunctionality,
                DegradationFallback::MinimalFunctionality,
                RecoveryPath::ManualIntervention,
            ),
        };
        let plan = DegradationPlan {
            kind,
            strategy,
            fallback,
            recovery,
        };

        debug!(device_id = %device_id, %kind, ?plan.strategy, "Entering degraded mode");
        self.audit
            .record(
                AuditEntry::new("edge_case", "degraded_mode", AuditStatus::Degraded)
                    .device(device_id)
                    .details(format!(
                        "failure={} strategy={:?} fallback={:?} recovery={:?}",
                        kind, plan.strategy, plan.fallback, plan.recovery
                    )),
            )
            .await?;

        Ok(plan)
    }

    /// Builds the partition plan for a device that lost connectivity.
    ///
    /// Leaders keep serving locally and buffer what they would have
    /// dispatched; followers drop to offline mode and reconnect with
    /// backoff. The device's sync state flips to offline either way.
    pub async fn partition_response(&self, device_id: &str) -> CoordResult<PartitionPlan> {
        let device = self
            .db
            .devices()
            .get(device_id)
            .await?
            .ok_or_else(|| CoordError::UnknownDevice {
                device_id: device_id.to_string(),
            })?;

        let (actions, recovery) = match device.role {
            DeviceRole::Leader => (
                vec![
                    PartitionAction::ContinueLocalOperations,
                    PartitionAction::BufferOutboundEvents,
                ],
                vec![
                    RecoveryStep::WaitForNetwork,
                    RecoveryStep::ValidateConsistency,
                    RecoveryStep::Resume,
                ],
            ),
            DeviceRole::Follower => (
                vec![
                    PartitionAction::SwitchToOfflineMode,
                    PartitionAction::BufferOutboundEvents,
                    PartitionAction::ReconnectWithBackoff,
                    PartitionAction::ResyncOnReconnect,
                ],
                vec![
                    RecoveryStep::SyncPendingOperations,
                    RecoveryStep::ValidateConsistency,
                    RecoveryStep::Resume,
                ],
            ),
        };

        let mut tx = self.db.begin().await?;
        self.db
            .sync_states()
            .get_or_create(&mut tx, device_id)
            .await?;
        self.db
            .sync_states()
            .set_status(&mut tx, device_id, SyncStatus::Offline)
            .await?;
        self.audit
            .record_tx(
                &mut tx,
                AuditEntry::new("edge_case", "partition", AuditStatus::Warning)
                    .device(device_id)
                    .details(format!("role={}", device.role)),
            )
            .await?;
        tx.commit().await.map_err(fleet_db::DbError::from)?;

        warn!(device_id = %device_id, role = %device.role, "Partition response planned");

        Ok(PartitionPlan {
            device_id: device_id.to_string(),
            role: device.role,
            actions,
            recovery,
        })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_db::DbConfig;

    async fn test_guard(settings: GuardSettings) -> EdgeCaseGuard {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        EdgeCaseGuard::new(db, settings)
    }

    #[tokio::test]
    async fn test_drift_within_threshold_passes() {
        let guard = test_guard(GuardSettings::default()).await;
        let report = guard
            .detect_clock_drift("pos-1", Utc::now() + Duration::seconds(30))
            .await
            .unwrap();
        assert!(report.is_none());
    }

    #[tokio::test]
    async fn test_drift_beyond_threshold_is_flagged_not_fatal() {
        let guard = test_guard(GuardSettings::default()).await;
        let report = guard
            .detect_clock_drift("pos-1", Utc::now() + Duration::seconds(600))
            .await
            .unwrap()
            .unwrap();
        assert!(report.drift_secs >= 599);

        // Behind-clock drift is flagged too.
        let report = guard
            .detect_clock_drift("pos-1", Utc::now() - Duration::seconds(600))
            .await
            .unwrap();
        assert!(report.is_some());
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_over_budget() {
        let settings = GuardSettings {
            rate_limit_max_ops: 3,
            ..GuardSettings::default()
        };
        let guard = test_guard(settings).await;

        // Fill the window with audited operations.
        for _ in 0..3 {
            guard
                .audit
                .record(
                    AuditEntry::new("sync", "data_update", AuditStatus::Success).device("pos-1"),
                )
                .await
                .unwrap();
        }

        let err = guard.check_rate_limit("pos-1").await.unwrap_err();
        assert!(matches!(err, CoordError::RateLimited { count: 3, .. }));
        assert!(err.is_validation());

        // Other devices are unaffected.
        guard.check_rate_limit("pos-2").await.unwrap();
    }

    #[tokio::test]
    async fn test_classify_sync_size_thresholds() {
        let guard = test_guard(GuardSettings::default()).await;

        assert_eq!(guard.classify_sync_size(512), SyncSizeStrategy::Direct);
        assert_eq!(
            guard.classify_sync_size(200 * 1024),
            SyncSizeStrategy::Compressed
        );

        let strategy = guard.classify_sync_size(2 * 1024 * 1024 + 1);
        let SyncSizeStrategy::Chunked { chunk_size, chunk_count } = strategy else {
            panic!("expected chunked transfer");
        };
        assert_eq!(chunk_size, 256 * 1024);
        assert_eq!(chunk_count, 9); // ceil((2 MiB + 1) / 256 KiB)
    }

    #[tokio::test]
    async fn test_unknown_failure_gets_conservative_plan() {
        let guard = test_guard(GuardSettings::default()).await;
        let plan = guard
            .degradation_policy("pos-1", FailureKind::Unknown)
            .await
            .unwrap();
        assert_eq!(plan.strategy, DegradationStrategy::MinimalFunctionality);
        assert_eq!(plan.fallback, DegradationFallback::MinimalFunctionality);
        assert_eq!(plan.recovery, RecoveryPath::ManualIntervention);
        assert!(!plan.retry_allowed());
    }

    #[tokio::test]
    async fn test_degradation_plans_per_failure_class() {
        let guard = test_guard(GuardSettings::default()).await;

        let plan = guard
            .degradation_policy("pos-1", FailureKind::NetworkTimeout)
            .await
            .unwrap();
        assert_eq!(plan.strategy, DegradationStrategy::OfflineMode);
        assert_eq!(plan.fallback, DegradationFallback::LocalOperationsOnly);
        assert_eq!(plan.recovery, RecoveryPath::AutomaticReconnect);
        assert!(plan.retry_allowed());

        let plan = guard
            .degradation_policy("pos-1", FailureKind::CapacityExhaustion)
            .await
            .unwrap();
        assert_eq!(plan.strategy, DegradationStrategy::EmergencyMode);
        assert_eq!(plan.fallback, DegradationFallback::CriticalOperationsOnly);
        assert_eq!(plan.recovery, RecoveryPath::CleanupRequired);
        assert!(!plan.retry_allowed());
    }

    #[tokio::test]
    async fn test_partition_plan_depends_on_role() {
        let guard = test_guard(GuardSettings::default()).await;
        {
            let mut conn = guard.db.pool().acquire().await.unwrap();
            guard
                .db
                .devices()
                .upsert(&mut conn, "leader", DeviceRole::Leader, 90)
                .await
                .unwrap();
            guard
                .db
                .devices()
                .upsert(&mut conn, "follower", DeviceRole::Follower, 10)
                .await
                .unwrap();
        }

        let plan = guard.partition_response("leader").await.unwrap();
        assert!(plan.actions.contains(&PartitionAction::ContinueLocalOperations));
        assert!(!plan.actions.contains(&PartitionAction::SwitchToOfflineMode));
        assert_eq!(plan.recovery.last(), Some(&RecoveryStep::Resume));

        let plan = guard.partition_response("follower").await.unwrap();
        assert!(plan.actions.contains(&PartitionAction::ReconnectWithBackoff));
        assert!(plan.recovery.contains(&RecoveryStep::SyncPendingOperations));

        let state = guard.db.sync_states().get("follower").await.unwrap().unwrap();
        assert_eq!(state.status, SyncStatus::Offline);

        let err = guard.partition_response("ghost").await.unwrap_err();
        assert!(matches!(err, CoordError::UnknownDevice { .. }));
    }
}
