//! # Coordination Data Model
//!
//! Core types shared by the durable store and the coordinator services.
//!
//! ## Entity Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Coordination Entities                            │
//! │                                                                         │
//! │  Device          - identity, role, priority, liveness                   │
//! │                    (never hard-deleted, only deactivated)               │
//! │                                                                         │
//! │  SyncEvent       - one unit of change data; carries a record key when   │
//! │                    subject to conflict resolution; retained forever     │
//! │                                                                         │
//! │  SyncState       - per-device backlog: pending count + status           │
//! │                    invariant: count == 0  ⇔  status == synced           │
//! │                                                                         │
//! │  ElectionRecord  - append-only leadership change history                │
//! │                                                                         │
//! │  AuditEntry      - append-only record of every coordination decision;   │
//! │                    written BEFORE the owning operation is acknowledged  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

// =============================================================================
// Device
// =============================================================================

/// Role of a device in the fleet.
///
/// At most one active device holds [`DeviceRole::Leader`] under steady state.
/// More than one is a split-brain condition, detected and resolved by the
/// election coordinator rather than treated as a permanent invariant break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
pub enum DeviceRole {
    /// The single device authorized to originate canonical writes.
    Leader,
    /// A device that submits events to, and receives broadcasts from, the leader.
    Follower,
}

impl std::fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceRole::Leader => write!(f, "leader"),
            DeviceRole::Follower => write!(f, "follower"),
        }
    }
}

impl std::str::FromStr for DeviceRole {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "leader" | "master" => Ok(DeviceRole::Leader),
            "follower" | "client" => Ok(DeviceRole::Follower),
            other => Err(CoreError::UnknownVariant {
                kind: "device role",
                value: other.to_string(),
            }),
        }
    }
}

/// A registered fleet device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Device {
    /// Opaque device identifier (unique).
    pub device_id: String,

    /// Current role.
    pub role: DeviceRole,

    /// Election priority. Higher = preferred leader.
    pub priority: i64,

    /// Last heartbeat / registration time.
    pub last_seen: DateTime<Utc>,

    /// Whether the device is active. Deactivated devices are retained.
    pub is_active: bool,

    /// First registration time.
    pub created_at: DateTime<Utc>,

    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Sync Event
// =============================================================================

/// Lifecycle status of a sync event.
///
/// ## Transitions
/// ```text
/// ingest            ──► Pending
/// immediate persist ──► Queued     (critical path, pre-dispatch)
/// broadcast sent    ──► Dispatched
/// accounting done   ──► Synced     (terminal)
/// retryable failure ──► Pending    (attempts + 1, until exhausted)
/// retries exhausted ──► Failed     (terminal)
/// payload error     ──► Error      (terminal, non-retryable)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
pub enum SyncEventStatus {
    /// Persisted, awaiting the periodic dispatch scan.
    Pending,
    /// Persisted on the immediate (critical) path, dispatch imminent.
    Queued,
    /// Broadcast went out; accounting not yet committed.
    Dispatched,
    /// Broadcast and accounting committed.
    Synced,
    /// Dispatch attempts exhausted.
    Failed,
    /// Non-retryable error (e.g. undecodable payload).
    Error,
}

impl SyncEventStatus {
    /// Returns true for statuses that no transition leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncEventStatus::Synced | SyncEventStatus::Failed | SyncEventStatus::Error
        )
    }
}

impl std::fmt::Display for SyncEventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncEventStatus::Pending => "pending",
            SyncEventStatus::Queued => "queued",
            SyncEventStatus::Dispatched => "dispatched",
            SyncEventStatus::Synced => "synced",
            SyncEventStatus::Failed => "failed",
            SyncEventStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// A unit of change data flowing between devices.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct SyncEvent {
    /// Event id (UUID v4).
    pub id: String,

    /// Event type, e.g. "stock_update", "order".
    pub event_type: String,

    /// The data being synced, as JSON text.
    pub payload: String,

    /// Record key extracted from the payload (`record_id`), when present.
    /// Indexed in the store; drives at-most-one-pending-per-record.
    pub record_key: Option<String>,

    /// Originating device.
    pub origin_device: String,

    /// Originating user, if any.
    pub origin_user: Option<String>,

    /// Current lifecycle status.
    pub status: SyncEventStatus,

    /// Dispatch attempts so far.
    pub attempts: i64,

    /// When the event was created.
    pub created_at: DateTime<Utc>,
}

impl SyncEvent {
    /// Builds a new pending event, extracting the record key from the payload.
    pub fn new(
        event_type: impl Into<String>,
        payload: &serde_json::Value,
        origin_device: impl Into<String>,
        origin_user: Option<String>,
    ) -> Self {
        SyncEvent {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            payload: payload.to_string(),
            record_key: extract_record_key(payload),
            origin_device: origin_device.into(),
            origin_user,
            status: SyncEventStatus::Pending,
            attempts: 0,
            created_at: Utc::now(),
        }
    }

    /// Parses the payload back into JSON.
    pub fn payload_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}

/// Pulls the conflict-resolution record key out of an event payload.
///
/// Accepts `record_id` or `record_key`; numbers are stringified so numeric
/// ids collide with their string form.
pub fn extract_record_key(payload: &serde_json::Value) -> Option<String> {
    let value = payload.get("record_id").or_else(|| payload.get("record_key"))?;
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// =============================================================================
// Sync State
// =============================================================================

/// Per-device sync status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
pub enum SyncStatus {
    /// No pending changes.
    Synced,
    /// Pending changes waiting for dispatch.
    Pending,
    /// A sync run is in flight for this device.
    Syncing,
    /// Device is partitioned / offline.
    Offline,
    /// Last sync interaction failed.
    Error,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Pending => "pending",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Offline => "offline",
            SyncStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Per-device backlog tracking. Created lazily on first sync interaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct SyncState {
    /// Device this state belongs to.
    pub device_id: String,

    /// Current status.
    pub status: SyncStatus,

    /// Number of changes awaiting sync. Never negative.
    pub pending_changes_count: i64,

    /// Last successful full sync.
    pub last_sync_at: Option<DateTime<Utc>>,

    /// Last error message, cleared by a successful full sync.
    pub last_error_message: Option<String>,

    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Election Record
// =============================================================================

/// Why an election was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
pub enum ElectionReason {
    /// The leader announced a graceful shutdown.
    Shutdown,
    /// The leader stopped responding (heartbeat timeout / partition).
    Failure,
    /// Operator-initiated.
    Manual,
    /// A detected split-brain was reconciled.
    SplitBrainResolution,
}

impl std::fmt::Display for ElectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ElectionReason::Shutdown => "shutdown",
            ElectionReason::Failure => "failure",
            ElectionReason::Manual => "manual",
            ElectionReason::SplitBrainResolution => "split_brain_resolution",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for ElectionReason {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "shutdown" => Ok(ElectionReason::Shutdown),
            "failure" | "timeout" => Ok(ElectionReason::Failure),
            "manual" => Ok(ElectionReason::Manual),
            "split_brain_resolution" => Ok(ElectionReason::SplitBrainResolution),
            other => Err(CoreError::UnknownVariant {
                kind: "election reason",
                value: other.to_string(),
            }),
        }
    }
}

/// One leadership change. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct ElectionRecord {
    /// Record id (UUID v4).
    pub id: String,

    /// Leader before the election, if there was one.
    pub previous_leader: Option<String>,

    /// Elected leader.
    pub new_leader: String,

    /// Trigger reason.
    pub reason: ElectionReason,

    /// Active devices considered by the election.
    pub participant_count: i64,

    /// When the election committed.
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Audit Entry
// =============================================================================

/// Severity / outcome of an audited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
pub enum AuditStatus {
    Success,
    Error,
    Warning,
    Critical,
    Pending,
    /// The system entered a degraded mode (graceful degradation path).
    Degraded,
}

impl std::fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuditStatus::Success => "success",
            AuditStatus::Error => "error",
            AuditStatus::Warning => "warning",
            AuditStatus::Critical => "critical",
            AuditStatus::Pending => "pending",
            AuditStatus::Degraded => "degraded",
        };
        write!(f, "{}", s)
    }
}

/// One audited coordination decision. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct AuditEntry {
    /// Entry id (UUID v4).
    pub id: String,

    /// Category, e.g. "sync", "conflict", "role_change", "split_brain".
    pub event_type: String,

    /// Operation, e.g. "periodic_broadcast", "role_update", "resolve".
    pub operation: String,

    /// Outcome / severity.
    pub status: AuditStatus,

    /// Device the entry concerns, if any.
    pub device_id: Option<String>,

    /// User the entry concerns, if any.
    pub user_id: Option<String>,

    /// Free-text context.
    pub details: Option<String>,

    /// When the entry was written.
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    /// Builds a new entry timestamped now.
    pub fn new(
        event_type: impl Into<String>,
        operation: impl Into<String>,
        status: AuditStatus,
    ) -> Self {
        AuditEntry {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            operation: operation.into(),
            status,
            device_id: None,
            user_id: None,
            details: None,
            created_at: Utc::now(),
        }
    }

    /// Sets the device id.
    pub fn device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// Sets the user id.
    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Sets the details text.
    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_role_round_trip() {
        assert_eq!("leader".parse::<DeviceRole>().unwrap(), DeviceRole::Leader);
        assert_eq!("master".parse::<DeviceRole>().unwrap(), DeviceRole::Leader);
        assert_eq!("client".parse::<DeviceRole>().unwrap(), DeviceRole::Follower);
        assert_eq!(DeviceRole::Follower.to_string(), "follower");
        assert!("admin".parse::<DeviceRole>().is_err());
    }

    #[test]
    fn test_election_reason_display() {
        assert_eq!(
            ElectionReason::SplitBrainResolution.to_string(),
            "split_brain_resolution"
        );
        assert_eq!("timeout".parse::<ElectionReason>().unwrap(), ElectionReason::Failure);
    }

    #[test]
    fn test_record_key_extraction() {
        assert_eq!(
            extract_record_key(&json!({"record_id": "sku-42"})),
            Some("sku-42".to_string())
        );
        assert_eq!(
            extract_record_key(&json!({"record_id": 42})),
            Some("42".to_string())
        );
        assert_eq!(
            extract_record_key(&json!({"record_key": "r-1"})),
            Some("r-1".to_string())
        );
        assert_eq!(extract_record_key(&json!({"other": 1})), None);
    }

    #[test]
    fn test_new_event_defaults() {
        let event = SyncEvent::new(
            "stock_update",
            &json!({"record_id": "sku-1", "qty": 3}),
            "dev-a",
            None,
        );
        assert_eq!(event.status, SyncEventStatus::Pending);
        assert_eq!(event.attempts, 0);
        assert_eq!(event.record_key.as_deref(), Some("sku-1"));
        assert_eq!(event.payload_json().unwrap()["qty"], 3);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(SyncEventStatus::Synced.is_terminal());
        assert!(SyncEventStatus::Failed.is_terminal());
        assert!(SyncEventStatus::Error.is_terminal());
        assert!(!SyncEventStatus::Pending.is_terminal());
        assert!(!SyncEventStatus::Dispatched.is_terminal());
    }
}
