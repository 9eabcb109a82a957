//! # Leader Election Module
//!
//! Leader election and split-brain resolution over the device registry.
//!
//! ## Election Protocol
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Leader Election Protocol                             │
//! │                                                                         │
//! │  ELECTION TRIGGER CONDITIONS:                                          │
//! │  ────────────────────────────                                          │
//! │  1. Current leader announces a graceful shutdown                       │
//! │  2. Current leader reported offline / failed                           │
//! │  3. Manual trigger from an operator                                    │
//! │  4. Split-brain resolution demoted every leader but one                │
//! │                                                                         │
//! │  CANDIDATE SELECTION:                                                  │
//! │  ────────────────────                                                  │
//! │  if candidate_a.priority > candidate_b.priority:                       │
//! │      candidate_a wins                                                   │
//! │  elif candidate_a.priority == candidate_b.priority:                    │
//! │      lexicographically_smaller(device_id) wins  // Deterministic       │
//! │                                                                         │
//! │  SPLIT-BRAIN RESOLUTION:                                               │
//! │  ───────────────────────                                               │
//! │  More than one active leader: keep the one with the highest            │
//! │  (priority, last_seen) pair, demote the rest. Detection is audited     │
//! │  as CRITICAL, each demotion individually.                              │
//! │                                                                         │
//! │  ATOMICITY:                                                            │
//! │  ──────────                                                            │
//! │  Demotions, the promotion, the election record and the audit entries   │
//! │  commit in ONE transaction. Observers never see two leaders created    │
//! │  by a half-applied election, and a failed election leaves the          │
//! │  registry exactly as it was.                                           │
//! │                                                                         │
//! │  A re-election that keeps the incumbent is a no-op: no transition      │
//! │  happened, so no election record is written.                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::AuditTrail;
use crate::error::{CoordError, CoordResult};
use fleet_core::{AuditEntry, AuditStatus, Device, DeviceRole, ElectionReason, ElectionRecord};
use fleet_db::{Database, DbError};

// =============================================================================
// Election Outcome
// =============================================================================

/// Result of an election or split-brain resolution.
#[derive(Debug, Clone)]
pub enum ElectionOutcome {
    /// Leadership moved to a new device.
    Elected {
        record: ElectionRecord,
        leader: Device,
    },
    /// The incumbent kept the role. No record was written.
    Unchanged { leader: Device },
}

impl ElectionOutcome {
    /// The device holding leadership after the operation.
    pub fn leader(&self) -> &Device {
        match self {
            ElectionOutcome::Elected { leader, .. } => leader,
            ElectionOutcome::Unchanged { leader } => leader,
        }
    }
}

// =============================================================================
// Election Coordinator
// =============================================================================

/// Runs elections and repairs split-brain over the persisted registry.
#[derive(Debug, Clone)]
pub struct ElectionCoordinator {
    db: Database,
    audit: AuditTrail,
}

impl ElectionCoordinator {
    /// Creates an election coordinator over the given database.
    pub fn new(db: Database) -> Self {
        let audit = AuditTrail::new(&db);
        ElectionCoordinator { db, audit }
    }

    /// Runs an election among the active devices.
    ///
    /// Highest priority wins; equal priorities break toward the
    /// lexicographically smaller device id. If the winner already holds
    /// leadership the election is a no-op.
    pub async fn trigger_election(&self, reason: ElectionReason) -> CoordResult<ElectionOutcome> {
        self.trigger_election_excluding(reason, None).await
    }

    /// Runs an election that a departing device cannot win.
    ///
    /// Used when the trigger is the current leader's own shutdown or
    /// failure: the device still counts as a participant (it is part of
    /// the fleet the election speaks for) but is never the candidate.
    pub async fn trigger_election_excluding(
        &self,
        reason: ElectionReason,
        exclude: Option<&str>,
    ) -> CoordResult<ElectionOutcome> {
        let active = self.db.devices().list_active().await?;

        // list_active orders by (priority DESC, device_id ASC), so the
        // first non-excluded entry is the election winner.
        let Some(candidate) = active
            .iter()
            .find(|d| Some(d.device_id.as_str()) != exclude)
            .cloned()
        else {
            warn!(%reason, "Election triggered with no eligible devices");
            self.audit
                .record(
                    AuditEntry::new("election", "no_eligible_devices", AuditStatus::Warning)
                        .details(format!("reason={}", reason)),
                )
                .await?;
            return Err(CoordError::NoEligibleDevices);
        };

        let leaders = self.db.devices().list_leaders().await?;
        if leaders.len() > 1 {
            // Ordinary elections refuse to run on a split-brain registry.
            return Err(CoordError::SplitBrain {
                leader_count: leaders.len(),
            });
        }

        let previous = leaders.into_iter().next();
        if let Some(ref incumbent) = previous {
            if incumbent.device_id == candidate.device_id {
                debug!(
                    leader = %incumbent.device_id,
                    %reason,
                    "Election kept the incumbent, nothing to record"
                );
                return Ok(ElectionOutcome::Unchanged {
                    leader: incumbent.clone(),
                });
            }
        }

        let record = ElectionRecord {
            id: Uuid::new_v4().to_string(),
            previous_leader: previous.as_ref().map(|d| d.device_id.clone()),
            new_leader: candidate.device_id.clone(),
            reason,
            participant_count: active.len() as i64,
            created_at: Utc::now(),
        };

        let mut tx = self.db.begin().await?;

        if let Some(ref incumbent) = previous {
            self.db
                .devices()
                .set_role(&mut tx, &incumbent.device_id, DeviceRole::Follower)
                .await?;
            self.audit
                .record_tx(
                    &mut tx,
                    AuditEntry::new("election", "demoted", AuditStatus::Warning)
                        .device(&incumbent.device_id)
                        .details(format!("new_leader={}", candidate.device_id)),
                )
                .await?;
        }
        self.db
            .devices()
            .set_role(&mut tx, &candidate.device_id, DeviceRole::Leader)
            .await?;
        self.db.elections().append(&mut tx, &record).await?;
        self.audit
            .record_tx(
                &mut tx,
                AuditEntry::new("election", "leader_elected", AuditStatus::Success)
                    .device(&candidate.device_id)
                    .details(format!(
                        "reason={} previous={} participants={}",
                        reason,
                        record.previous_leader.as_deref().unwrap_or("none"),
                        record.participant_count
                    )),
            )
            .await?;

        tx.commit().await.map_err(DbError::from)?;

        info!(
            new_leader = %candidate.device_id,
            previous_leader = ?record.previous_leader,
            %reason,
            participants = record.participant_count,
            "Leader elected"
        );

        let leader = self
            .db
            .devices()
            .get(&candidate.device_id)
            .await?
            .ok_or_else(|| CoordError::UnknownDevice {
                device_id: candidate.device_id.clone(),
            })?;

        Ok(ElectionOutcome::Elected { record, leader })
    }

    /// Returns the active leaders when more than one exists.
    ///
    /// A non-empty result means split-brain; the detection itself is
    /// audited as critical so it shows up even if resolution never runs.
    pub async fn detect_split_brain(&self) -> CoordResult<Vec<Device>> {
        let leaders = self.db.devices().list_leaders().await?;
        if leaders.len() <= 1 {
            return Ok(Vec::new());
        }

        warn!(leader_count = leaders.len(), "Split-brain detected");
        self.audit
            .record(
                AuditEntry::new("split_brain", "detected", AuditStatus::Critical).details(
                    format!(
                        "leaders={}",
                        leaders
                            .iter()
                            .map(|d| d.device_id.as_str())
                            .collect::<Vec<_>>()
                            .join(",")
                    ),
                ),
            )
            .await?;

        Ok(leaders)
    }

    /// Collapses a split-brain down to a single leader.
    ///
    /// The survivor is the leader with the highest priority; ties break
    /// toward the most recently seen. Everything (demotions, election
    /// record, per-device audits) commits atomically. Returns None when
    /// there was no split-brain to resolve.
    pub async fn resolve_split_brain(&self) -> CoordResult<Option<ElectionOutcome>> {
        let leaders = self.detect_split_brain().await?;
        if leaders.is_empty() {
            return Ok(None);
        }

        // list_leaders orders by (priority DESC, last_seen DESC): the
        // head survives.
        let survivor = leaders[0].clone();
        let demoted = &leaders[1..];

        let active_count = self.db.devices().list_active().await?.len() as i64;
        let record = ElectionRecord {
            id: Uuid::new_v4().to_string(),
            previous_leader: Some(survivor.device_id.clone()),
            new_leader: survivor.device_id.clone(),
            reason: ElectionReason::SplitBrainResolution,
            participant_count: active_count,
            created_at: Utc::now(),
        };

        let mut tx = self.db.begin().await?;

        for loser in demoted {
            self.db
                .devices()
                .set_role(&mut tx, &loser.device_id, DeviceRole::Follower)
                .await?;
            self.audit
                .record_tx(
                    &mut tx,
                    AuditEntry::new("split_brain", "demoted", AuditStatus::Warning)
                        .device(&loser.device_id)
                        .details(format!("surviving_leader={}", survivor.device_id)),
                )
                .await?;
        }
        self.db.elections().append(&mut tx, &record).await?;
        self.audit
            .record_tx(
                &mut tx,
                AuditEntry::new("split_brain", "resolved", AuditStatus::Success)
                    .device(&survivor.device_id)
                    .details(format!("demoted_count={}", demoted.len())),
            )
            .await?;

        tx.commit().await.map_err(DbError::from)?;

        info!(
            surviving_leader = %survivor.device_id,
            demoted = demoted.len(),
            "Split-brain resolved"
        );

        Ok(Some(ElectionOutcome::Elected {
            record,
            leader: survivor,
        }))
    }

    /// Recent leadership transitions, newest first.
    pub async fn history(&self, limit: i64) -> CoordResult<Vec<ElectionRecord>> {
        Ok(self.db.elections().list_recent(limit).await?)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_db::DbConfig;

    async fn test_db() -> Database {
        Database::new(DbConfig::in_memory()).await.unwrap()
    }

    async fn add_device(db: &Database, id: &str, role: DeviceRole, priority: i64) {
        let mut conn = db.pool().acquire().await.unwrap();
        db.devices().upsert(&mut conn, id, role, priority).await.unwrap();
    }

    #[tokio::test]
    async fn test_election_picks_highest_priority() {
        let db = test_db().await;
        add_device(&db, "a", DeviceRole::Follower, 10).await;
        add_device(&db, "b", DeviceRole::Follower, 90).await;
        add_device(&db, "c", DeviceRole::Follower, 50).await;

        let coordinator = ElectionCoordinator::new(db.clone());
        let outcome = coordinator
            .trigger_election(ElectionReason::Manual)
            .await
            .unwrap();

        let ElectionOutcome::Elected { record, leader } = outcome else {
            panic!("expected a leadership transition");
        };
        assert_eq!(leader.device_id, "b");
        assert_eq!(record.new_leader, "b");
        assert_eq!(record.previous_leader, None);
        assert_eq!(record.participant_count, 3);

        let current = db.devices().get_leader().await.unwrap().unwrap();
        assert_eq!(current.device_id, "b");
    }

    #[tokio::test]
    async fn test_election_tie_breaks_on_device_id() {
        let db = test_db().await;
        add_device(&db, "zeta", DeviceRole::Follower, 50).await;
        add_device(&db, "alpha", DeviceRole::Follower, 50).await;

        let coordinator = ElectionCoordinator::new(db);
        let outcome = coordinator
            .trigger_election(ElectionReason::Manual)
            .await
            .unwrap();
        assert_eq!(outcome.leader().device_id, "alpha");
    }

    #[tokio::test]
    async fn test_reelection_of_incumbent_writes_no_record() {
        let db = test_db().await;
        add_device(&db, "a", DeviceRole::Leader, 90).await;
        add_device(&db, "b", DeviceRole::Follower, 10).await;

        let coordinator = ElectionCoordinator::new(db.clone());
        let outcome = coordinator
            .trigger_election(ElectionReason::Manual)
            .await
            .unwrap();
        assert!(matches!(outcome, ElectionOutcome::Unchanged { .. }));
        assert!(db.elections().list_recent(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_election_with_no_devices_fails() {
        let db = test_db().await;
        let coordinator = ElectionCoordinator::new(db);

        let err = coordinator
            .trigger_election(ElectionReason::Failure)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::NoEligibleDevices));
    }

    #[tokio::test]
    async fn test_election_demotes_previous_leader() {
        let db = test_db().await;
        add_device(&db, "old", DeviceRole::Leader, 10).await;
        add_device(&db, "new", DeviceRole::Follower, 90).await;

        let coordinator = ElectionCoordinator::new(db.clone());
        let outcome = coordinator
            .trigger_election(ElectionReason::Shutdown)
            .await
            .unwrap();
        assert_eq!(outcome.leader().device_id, "new");

        let old = db.devices().get("old").await.unwrap().unwrap();
        assert_eq!(old.role, DeviceRole::Follower);

        let records = db.elections().list_recent(10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].previous_leader.as_deref(), Some("old"));
        assert_eq!(records[0].reason, ElectionReason::Shutdown);

        // The incumbent's demotion leaves its own audit trail entry.
        let demotions = coordinator
            .audit
            .query(&fleet_db::AuditFilter {
                device_id: Some("old".into()),
                event_type: Some("election".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(demotions.len(), 1);
        assert_eq!(demotions[0].operation, "demoted");
        assert_eq!(demotions[0].status, AuditStatus::Warning);
    }

    #[tokio::test]
    async fn test_excluded_device_cannot_win() {
        let db = test_db().await;
        add_device(&db, "a", DeviceRole::Leader, 90).await;
        add_device(&db, "b", DeviceRole::Follower, 40).await;
        add_device(&db, "c", DeviceRole::Follower, 60).await;

        let coordinator = ElectionCoordinator::new(db.clone());
        let outcome = coordinator
            .trigger_election_excluding(ElectionReason::Shutdown, Some("a"))
            .await
            .unwrap();

        let ElectionOutcome::Elected { record, leader } = outcome else {
            panic!("expected a leadership transition");
        };
        assert_eq!(leader.device_id, "c");
        assert_eq!(record.previous_leader.as_deref(), Some("a"));
        // The departing device still counts as a participant.
        assert_eq!(record.participant_count, 3);

        let old = db.devices().get("a").await.unwrap().unwrap();
        assert_eq!(old.role, DeviceRole::Follower);
    }

    #[tokio::test]
    async fn test_split_brain_resolution_keeps_highest_priority() {
        let db = test_db().await;
        add_device(&db, "x", DeviceRole::Leader, 30).await;
        add_device(&db, "y", DeviceRole::Leader, 70).await;
        add_device(&db, "z", DeviceRole::Follower, 10).await;

        let coordinator = ElectionCoordinator::new(db.clone());

        let detected = coordinator.detect_split_brain().await.unwrap();
        assert_eq!(detected.len(), 2);

        let outcome = coordinator.resolve_split_brain().await.unwrap().unwrap();
        assert_eq!(outcome.leader().device_id, "y");

        let leaders = db.devices().list_leaders().await.unwrap();
        assert_eq!(leaders.len(), 1);
        assert_eq!(leaders[0].device_id, "y");

        let records = db.elections().list_recent(10).await.unwrap();
        assert_eq!(records[0].reason, ElectionReason::SplitBrainResolution);
    }

    #[tokio::test]
    async fn test_split_brain_tie_breaks_on_last_seen() {
        let db = test_db().await;
        add_device(&db, "x", DeviceRole::Leader, 50).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        // Upserted later, so y carries the fresher last_seen.
        add_device(&db, "y", DeviceRole::Leader, 50).await;

        let coordinator = ElectionCoordinator::new(db);
        let outcome = coordinator.resolve_split_brain().await.unwrap().unwrap();
        assert_eq!(outcome.leader().device_id, "y");
    }

    #[tokio::test]
    async fn test_resolve_without_split_brain_is_noop() {
        let db = test_db().await;
        add_device(&db, "a", DeviceRole::Leader, 50).await;

        let coordinator = ElectionCoordinator::new(db.clone());
        assert!(coordinator.resolve_split_brain().await.unwrap().is_none());
        assert!(db.elections().list_recent(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ordinary_election_refuses_split_brain() {
        let db = test_db().await;
        add_device(&db, "x", DeviceRole::Leader, 30).await;
        add_device(&db, "y", DeviceRole::Leader, 70).await;

        let coordinator = ElectionCoordinator::new(db);
        let err = coordinator
            .trigger_election(ElectionReason::Manual)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::SplitBrain { leader_count: 2 }));
    }
}
