//! # Coordination Protocol
//!
//! JSON message types exchanged between devices and the coordinator.
//!
//! ## Wire Format
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Message Envelope                                 │
//! │                                                                         │
//! │  {                                                                      │
//! │    "type": "data_update",          ◄── message discriminator           │
//! │    "payload": {                    ◄── type-specific payload           │
//! │      "device_id": "pos-1",                                             │
//! │      "event_type": "stock_update",                                     │
//! │      "data": { "record_id": "r-42", "qty": 3 }                         │
//! │    }                                                                    │
//! │  }                                                                      │
//! │                                                                         │
//! │  Inbound:  device ──► coordinator  (CoordMessage)                      │
//! │  Outbound: coordinator ──► device  (CoordResponse / OutboundEvent)     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every inbound message is validated before it touches any state;
//! validation failures are rejected without side effects (beyond an
//! audit entry written by the coordinator).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fleet_core::{require, DeviceRole, ElectionReason, SyncEvent, ValidationError};

// =============================================================================
// Liveness
// =============================================================================

/// Liveness transition announced by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessState {
    /// Device came (back) online.
    Online,
    /// Device went offline unexpectedly (reported by a peer or probe).
    Offline,
    /// Device is shutting down gracefully.
    Shutdown,
}

impl std::fmt::Display for LivenessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LivenessState::Online => "online",
            LivenessState::Offline => "offline",
            LivenessState::Shutdown => "shutdown",
        };
        write!(f, "{}", s)
    }
}

/// Scope of a sync-request pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncScope {
    /// Everything, ignoring the watermark.
    Full,
    /// Only events after the watermark.
    #[default]
    Incremental,
}

// =============================================================================
// Inbound Messages
// =============================================================================

/// Messages devices send to the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum CoordMessage {
    /// Join or refresh membership in the fleet.
    Register {
        device_id: String,
        role: DeviceRole,
        priority: i64,
        /// Sender's wall clock, for drift detection.
        #[serde(default)]
        sent_at: Option<DateTime<Utc>>,
    },

    /// Periodic liveness ping.
    Heartbeat {
        device_id: String,
        #[serde(default)]
        sent_at: Option<DateTime<Utc>>,
    },

    /// Liveness transition (online / offline / shutdown).
    Liveness {
        device_id: String,
        state: LivenessState,
    },

    /// Request a role change for a device.
    RoleChange {
        device_id: String,
        role: DeviceRole,
        #[serde(default)]
        reason: Option<String>,
    },

    /// Ask the coordinator to run an election.
    ElectionTrigger {
        requested_by: String,
        reason: ElectionReason,
    },

    /// Pull pending events from other devices. Leader-only.
    SyncRequest {
        device_id: String,
        #[serde(default)]
        sync_type: SyncScope,
        /// Watermark for incremental pulls.
        #[serde(default)]
        since: Option<DateTime<Utc>>,
    },

    /// Submit a data change for synchronization.
    DataUpdate {
        device_id: String,
        event_type: String,
        data: serde_json::Value,
        #[serde(default)]
        user_id: Option<String>,
        /// Request inline dispatch instead of waiting for the periodic run.
        #[serde(default)]
        immediate: bool,
        #[serde(default)]
        sent_at: Option<DateTime<Utc>>,
    },

    /// Report conflicting versions of one record observed by a device.
    /// The coordinator arbitrates and names the surviving version.
    ConflictReport {
        device_id: String,
        record_key: String,
        versions: Vec<ConflictingVersion>,
    },

    /// Query the device's event queue counters.
    QueueStatus { device_id: String },
}

/// One side of a reported conflict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictingVersion {
    pub event_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl CoordMessage {
    /// The device the message concerns.
    pub fn device_id(&self) -> &str {
        match self {
            CoordMessage::Register { device_id, .. } => device_id,
            CoordMessage::Heartbeat { device_id, .. } => device_id,
            CoordMessage::Liveness { device_id, .. } => device_id,
            CoordMessage::RoleChange { device_id, .. } => device_id,
            CoordMessage::ElectionTrigger { requested_by, .. } => requested_by,
            CoordMessage::SyncRequest { device_id, .. } => device_id,
            CoordMessage::DataUpdate { device_id, .. } => device_id,
            CoordMessage::ConflictReport { device_id, .. } => device_id,
            CoordMessage::QueueStatus { device_id } => device_id,
        }
    }

    /// The sender's wall clock, where the message type carries one.
    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        match self {
            CoordMessage::Register { sent_at, .. } => *sent_at,
            CoordMessage::Heartbeat { sent_at, .. } => *sent_at,
            CoordMessage::DataUpdate { sent_at, .. } => *sent_at,
            _ => None,
        }
    }

    /// A short name for audits and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CoordMessage::Register { .. } => "register",
            CoordMessage::Heartbeat { .. } => "heartbeat",
            CoordMessage::Liveness { .. } => "liveness",
            CoordMessage::RoleChange { .. } => "role_change",
            CoordMessage::ElectionTrigger { .. } => "election_trigger",
            CoordMessage::SyncRequest { .. } => "sync_request",
            CoordMessage::DataUpdate { .. } => "data_update",
            CoordMessage::ConflictReport { .. } => "conflict_report",
            CoordMessage::QueueStatus { .. } => "queue_status",
        }
    }

    /// Validates the message shape before any state is touched.
    pub fn validate(&self) -> Result<(), ValidationError> {
        require("device_id", self.device_id())?;

        match self {
            CoordMessage::Register { priority, .. } => {
                if !(0..=100).contains(priority) {
                    return Err(ValidationError::InvalidValue {
                        field: "priority",
                        reason: format!("must be 0-100, got {}", priority),
                    });
                }
            }
            CoordMessage::DataUpdate { event_type, data, .. } => {
                require("event_type", event_type)?;
                if !data.is_object() {
                    return Err(ValidationError::InvalidValue {
                        field: "data",
                        reason: "must be a JSON object".into(),
                    });
                }
            }
            CoordMessage::ConflictReport { record_key, versions, .. } => {
                require("record_key", record_key)?;
                if versions.len() < 2 {
                    return Err(ValidationError::InvalidValue {
                        field: "versions",
                        reason: format!("a conflict needs at least 2 versions, got {}", versions.len()),
                    });
                }
                for version in versions {
                    require("event_id", &version.event_id)?;
                }
            }
            _ => {}
        }

        Ok(())
    }
}

// =============================================================================
// Responses
// =============================================================================

/// Replies the coordinator sends back to the requesting device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum CoordResponse {
    /// Generic acknowledgement.
    Ack { message: String },

    /// An event was accepted into the pipeline.
    EventAccepted { event_id: String },

    /// An event lost conflict resolution and was discarded.
    EventRejected {
        record_key: String,
        winning_event_id: String,
    },

    /// Pending events answering a sync request.
    Events { events: Vec<SyncEvent> },

    /// Queue counters answering a queue-status query.
    QueueStatus {
        device_id: String,
        total: i64,
        pending: i64,
        synced: i64,
        failed: i64,
    },

    /// Leadership after an election trigger.
    Leader {
        device_id: String,
        changed: bool,
    },

    /// Arbitration result for a reported conflict.
    ConflictResolved {
        record_key: String,
        winning_event_id: String,
    },
}

// =============================================================================
// Outbound Broadcasts
// =============================================================================

/// Messages the coordinator pushes to devices.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum OutboundEvent {
    /// A sync event being dispatched to the fleet.
    SyncUpdate { event: SyncEvent },

    /// Leadership changed.
    LeaderElected {
        leader: String,
        previous: Option<String>,
        reason: ElectionReason,
    },

    /// An event on the immediate critical path, pushed out of band of
    /// the periodic run.
    CriticalEvent { event: SyncEvent },
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_round_trip() {
        let msg = CoordMessage::DataUpdate {
            device_id: "pos-1".into(),
            event_type: "stock_update".into(),
            data: json!({"record_id": "r-1", "qty": 2}),
            user_id: Some("u-7".into()),
            immediate: false,
            sent_at: None,
        };

        let wire = serde_json::to_string(&msg).unwrap();
        assert!(wire.contains("\"type\":\"data_update\""));
        assert!(wire.contains("\"payload\""));

        let parsed: CoordMessage = serde_json::from_str(&wire).unwrap();
        assert_eq!(parsed.kind(), "data_update");
        assert_eq!(parsed.device_id(), "pos-1");
    }

    #[test]
    fn test_optional_fields_default() {
        let parsed: CoordMessage = serde_json::from_str(
            r#"{"type":"data_update","payload":{"device_id":"pos-1","event_type":"order","data":{}}}"#,
        )
        .unwrap();
        let CoordMessage::DataUpdate { immediate, user_id, sent_at, .. } = parsed else {
            panic!("wrong variant");
        };
        assert!(!immediate);
        assert!(user_id.is_none());
        assert!(sent_at.is_none());
    }

    #[test]
    fn test_validation_rejects_bad_shapes() {
        let missing_id = CoordMessage::Heartbeat {
            device_id: String::new(),
            sent_at: None,
        };
        assert!(missing_id.validate().is_err());

        let bad_priority = CoordMessage::Register {
            device_id: "pos-1".into(),
            role: DeviceRole::Follower,
            priority: 101,
            sent_at: None,
        };
        assert!(bad_priority.validate().is_err());

        let non_object = CoordMessage::DataUpdate {
            device_id: "pos-1".into(),
            event_type: "order".into(),
            data: json!([1, 2, 3]),
            user_id: None,
            immediate: false,
            sent_at: None,
        };
        assert!(non_object.validate().is_err());
    }

    #[test]
    fn test_conflict_report_needs_two_versions() {
        let version = |id: &str| ConflictingVersion {
            event_id: id.into(),
            created_at: Utc::now(),
            payload: json!({}),
        };

        let one_sided = CoordMessage::ConflictReport {
            device_id: "pos-1".into(),
            record_key: "r-1".into(),
            versions: vec![version("e-1")],
        };
        assert!(one_sided.validate().is_err());

        let proper = CoordMessage::ConflictReport {
            device_id: "pos-1".into(),
            record_key: "r-1".into(),
            versions: vec![version("e-1"), version("e-2")],
        };
        assert!(proper.validate().is_ok());
        assert_eq!(proper.kind(), "conflict_report");
    }

    #[test]
    fn test_unknown_type_fails_deserialization() {
        let result = serde_json::from_str::<CoordMessage>(
            r#"{"type":"bogus","payload":{"device_id":"pos-1"}}"#,
        );
        assert!(result.is_err());
    }
}
