//! # Sync Event Pipeline
//!
//! Ingest, conflict resolution and dispatch of sync events.
//!
//! ## Event Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Event Pipeline                               │
//! │                                                                         │
//! │  ingest(device, type, data)                                            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  record key extracted? ──► pending event holds the key?                │
//! │       │                          │                                      │
//! │       │                          ▼                                      │
//! │       │                   resolve(existing, incoming)                  │
//! │       │                     • existing wins ──► incoming REJECTED      │
//! │       │                     • incoming wins ──► existing SUPERSEDED    │
//! │       ▼                                                                 │
//! │  persist pending + bump origin's pending count   (one transaction)     │
//! │       │                                                                 │
//! │       ├── immediate ──► inline dispatch now                            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  periodic run (every interval):                                        │
//! │     drain oldest pending events, one at a time                         │
//! │     • success: synced + origin count drops        (one transaction)    │
//! │     • failure: attempts += 1, origin flagged error, NEXT EVENT STILL   │
//! │       RUNS (per-event isolation), failed for good after max attempts   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Pending-count invariant: an origin device's `pending_changes_count`
//! equals its number of non-terminal events, because both sides of that
//! equation always move in the same transaction.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::audit::AuditTrail;
use crate::config::SyncSettings;
use crate::error::{CoordError, CoordResult};
use crate::protocol::{ConflictingVersion, OutboundEvent};
use crate::transport::Transport;
use fleet_core::{
    resolve, resolve_among, AuditEntry, AuditStatus, ConflictDisposition, SyncEvent,
    SyncEventStatus, ValidationError,
};
use fleet_db::{Database, DbError, EventStatusSummary};

// =============================================================================
// Outcomes
// =============================================================================

/// What happened to an ingested event.
#[derive(Debug, Clone)]
pub enum IngestOutcome {
    /// Persisted as pending (or already dispatched, if immediate).
    Accepted { event: SyncEvent },
    /// Lost conflict resolution against an earlier pending event.
    Rejected {
        record_key: String,
        winning_event_id: String,
    },
    /// Won conflict resolution; the previously pending event was retired.
    Superseded {
        event: SyncEvent,
        superseded_event_id: String,
    },
}

/// Counters from one periodic run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeriodicSummary {
    pub scanned: usize,
    pub dispatched: usize,
    pub failed: usize,
}

// =============================================================================
// Pipeline
// =============================================================================

/// The sync-event pipeline.
#[derive(Debug, Clone)]
pub struct SyncEventPipeline<T: Transport + Clone> {
    db: Database,
    audit: AuditTrail,
    transport: T,
    settings: SyncSettings,
}

impl<T: Transport + Clone> SyncEventPipeline<T> {
    /// Creates a pipeline over the given database and transport.
    pub fn new(db: Database, transport: T, settings: SyncSettings) -> Self {
        let audit = AuditTrail::new(&db);
        SyncEventPipeline {
            db,
            audit,
            transport,
            settings,
        }
    }

    // =========================================================================
    // Ingest
    // =========================================================================

    /// Accepts a data change into the pipeline.
    ///
    /// If the payload names a record already held by a pending event, the
    /// two are arbitrated first-write-wins and only one survives. With
    /// `immediate` the surviving event is dispatched inline instead of
    /// waiting for the periodic run.
    pub async fn ingest(
        &self,
        device_id: &str,
        event_type: &str,
        data: &serde_json::Value,
        user_id: Option<String>,
        immediate: bool,
    ) -> CoordResult<IngestOutcome> {
        fleet_core::require("device_id", device_id)?;
        fleet_core::require("event_type", event_type)?;
        if !data.is_object() {
            return Err(ValidationError::InvalidValue {
                field: "data",
                reason: "must be a JSON object".into(),
            }
            .into());
        }

        // Events are only accepted from registered devices.
        if self.db.devices().get(device_id).await?.is_none() {
            return Err(CoordError::UnknownDevice {
                device_id: device_id.to_string(),
            });
        }

        let incoming = SyncEvent::new(event_type, data, device_id, user_id);

        // Conflict check: at most one pending event per record key.
        let mut superseded: Option<SyncEvent> = None;
        if let Some(record_key) = incoming.record_key.clone() {
            if let Some(existing) = self.db.events().find_pending_by_record_key(&record_key).await? {
                let outcome = resolve(&existing, &incoming);
                match outcome.disposition {
                    ConflictDisposition::Rejected => {
                        debug!(
                            record_key = %record_key,
                            winner = %existing.id,
                            loser_origin = %device_id,
                            "Incoming event lost conflict resolution"
                        );
                        self.audit
                            .record(
                                AuditEntry::new("conflict", "resolve", AuditStatus::Warning)
                                    .device(device_id)
                                    .details(format!(
                                        "record_key={} winner={} disposition=rejected",
                                        record_key, existing.id
                                    )),
                            )
                            .await?;
                        return Ok(IngestOutcome::Rejected {
                            record_key,
                            winning_event_id: existing.id,
                        });
                    }
                    ConflictDisposition::Accepted => {
                        superseded = Some(existing);
                    }
                }
            }
        }

        // Persist the survivor, retire the superseded event and adjust
        // pending counts, all in one commit.
        let mut tx = self.db.begin().await?;

        if let Some(ref old) = superseded {
            self.db
                .events()
                .set_status(&mut tx, &old.id, SyncEventStatus::Failed)
                .await?;
            self.db
                .sync_states()
                .get_or_create(&mut tx, &old.origin_device)
                .await?;
            self.db
                .sync_states()
                .decrement_pending(&mut tx, &old.origin_device, 1)
                .await?;
            self.audit
                .record_tx(
                    &mut tx,
                    AuditEntry::new("conflict", "resolve", AuditStatus::Warning)
                        .device(&old.origin_device)
                        .details(format!(
                            "record_key={} superseded_by={} disposition=accepted",
                            incoming.record_key.as_deref().unwrap_or(""),
                            incoming.id
                        )),
                )
                .await?;
        }

        self.db.events().insert(&mut tx, &incoming).await?;
        if immediate {
            self.db
                .events()
                .set_status(&mut tx, &incoming.id, SyncEventStatus::Queued)
                .await?;
        }
        self.db.sync_states().get_or_create(&mut tx, device_id).await?;
        self.db
            .sync_states()
            .increment_pending(&mut tx, device_id, 1)
            .await?;
        self.audit
            .record_tx(
                &mut tx,
                AuditEntry::new("sync", "ingest", AuditStatus::Success)
                    .device(device_id)
                    .details(format!("event_id={} event_type={}", incoming.id, event_type)),
            )
            .await?;

        tx.commit().await.map_err(DbError::from)?;

        info!(
            event_id = %incoming.id,
            device_id = %device_id,
            event_type = %event_type,
            immediate,
            "Event ingested"
        );

        if immediate {
            // Inline dispatch failures are not ingest failures: the
            // event is durable and the periodic run will retry it.
            if let Err(e) = self.dispatch_one(&incoming, true).await {
                warn!(event_id = %incoming.id, error = %e, "Immediate dispatch failed, left for periodic retry");
            }
        }

        let event = self
            .db
            .events()
            .get(&incoming.id)
            .await?
            .unwrap_or(incoming);

        match superseded {
            Some(old) => Ok(IngestOutcome::Superseded {
                event,
                superseded_event_id: old.id,
            }),
            None => Ok(IngestOutcome::Accepted { event }),
        }
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Dispatches a single event to the fleet. Critical (immediate-path)
    /// events go out as a distinct broadcast so receivers can shortcut
    /// their normal apply queue.
    async fn dispatch_one(&self, event: &SyncEvent, critical: bool) -> CoordResult<()> {
        // A payload that no longer parses can never dispatch; retrying
        // would burn attempts on a permanent defect.
        if let Err(parse_err) = event.payload_json() {
            let mut tx = self.db.begin().await?;
            self.db
                .events()
                .set_status(&mut tx, &event.id, SyncEventStatus::Error)
                .await?;
            self.db
                .sync_states()
                .get_or_create(&mut tx, &event.origin_device)
                .await?;
            self.db
                .sync_states()
                .decrement_pending(&mut tx, &event.origin_device, 1)
                .await?;
            self.audit
                .record_tx(
                    &mut tx,
                    AuditEntry::new("sync", "payload_error", AuditStatus::Error)
                        .device(&event.origin_device)
                        .details(format!("event_id={} error={}", event.id, parse_err)),
                )
                .await?;
            tx.commit().await.map_err(DbError::from)?;

            warn!(event_id = %event.id, error = %parse_err, "Undecodable payload, event marked error");
            return Err(CoordError::SerializationFailed(parse_err.to_string()));
        }

        {
            let mut conn = self.db.pool().acquire().await.map_err(DbError::from)?;
            self.db
                .events()
                .set_status(&mut conn, &event.id, SyncEventStatus::Dispatched)
                .await?;
        }

        let outbound = if critical {
            OutboundEvent::CriticalEvent {
                event: event.clone(),
            }
        } else {
            OutboundEvent::SyncUpdate {
                event: event.clone(),
            }
        };
        let send_result = self.transport.broadcast(&outbound).await;

        match send_result {
            Ok(()) => {
                let mut tx = self.db.begin().await?;
                self.db
                    .events()
                    .set_status(&mut tx, &event.id, SyncEventStatus::Synced)
                    .await?;
                self.db
                    .sync_states()
                    .get_or_create(&mut tx, &event.origin_device)
                    .await?;
                self.db
                    .sync_states()
                    .decrement_pending(&mut tx, &event.origin_device, 1)
                    .await?;
                self.audit
                    .record_tx(
                        &mut tx,
                        AuditEntry::new("sync", "dispatched", AuditStatus::Success)
                            .device(&event.origin_device)
                            .details(format!("event_id={}", event.id)),
                    )
                    .await?;
                tx.commit().await.map_err(DbError::from)?;

                debug!(event_id = %event.id, "Event dispatched");
                Ok(())
            }
            Err(e) => {
                let mut tx = self.db.begin().await?;
                let status = self
                    .db
                    .events()
                    .record_dispatch_failure(
                        &mut tx,
                        &event.id,
                        self.settings.max_dispatch_attempts,
                    )
                    .await?;
                self.db
                    .sync_states()
                    .get_or_create(&mut tx, &event.origin_device)
                    .await?;
                self.db
                    .sync_states()
                    .set_error(&mut tx, &event.origin_device, &e.to_string())
                    .await?;
                if status == SyncEventStatus::Failed {
                    // Terminal: the event stops occupying the queue.
                    self.db
                        .sync_states()
                        .decrement_pending(&mut tx, &event.origin_device, 1)
                        .await?;
                }
                self.audit
                    .record_tx(
                        &mut tx,
                        AuditEntry::new("sync", "dispatch_failed", AuditStatus::Error)
                            .device(&event.origin_device)
                            .details(format!("event_id={} status={} error={}", event.id, status, e)),
                    )
                    .await?;
                tx.commit().await.map_err(DbError::from)?;

                warn!(event_id = %event.id, %status, error = %e, "Event dispatch failed");
                Err(e)
            }
        }
    }

    /// Runs one periodic sync pass.
    ///
    /// Drains the oldest pending events up to the batch size. Each event
    /// dispatches independently: one failure is recorded and the pass
    /// moves on to the next event.
    pub async fn run_periodic(&self) -> CoordResult<PeriodicSummary> {
        let pending = self.db.events().list_pending(self.settings.batch_size).await?;
        let mut summary = PeriodicSummary {
            scanned: pending.len(),
            ..PeriodicSummary::default()
        };

        for event in &pending {
            match self.dispatch_one(event, false).await {
                Ok(()) => summary.dispatched += 1,
                Err(e) => {
                    summary.failed += 1;
                    debug!(event_id = %event.id, error = %e, "Periodic dispatch failure isolated");
                }
            }
        }

        if summary.scanned > 0 {
            info!(
                scanned = summary.scanned,
                dispatched = summary.dispatched,
                failed = summary.failed,
                "Periodic sync pass finished"
            );
        }

        Ok(summary)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Pending events for a puller, excluding its own, oldest first.
    pub async fn events_for(
        &self,
        device_id: &str,
        since: Option<chrono::DateTime<chrono::Utc>>,
    ) -> CoordResult<Vec<SyncEvent>> {
        Ok(self
            .db
            .events()
            .list_since(device_id, since, self.settings.batch_size)
            .await?)
    }

    /// Queue counters for one device.
    pub async fn queue_status(&self, device_id: &str) -> CoordResult<EventStatusSummary> {
        Ok(self.db.events().status_summary(device_id).await?)
    }

    /// Arbitrates a conflict reported by a device and names the
    /// surviving version. Same first-write-wins rule as ingest; the
    /// arbitration is audited but changes no stored events, since the
    /// reported versions live on the reporting device.
    pub async fn report_conflict(
        &self,
        device_id: &str,
        record_key: &str,
        versions: &[ConflictingVersion],
    ) -> CoordResult<String> {
        let timestamps: Vec<_> = versions.iter().map(|v| v.created_at).collect();
        let winner = resolve_among(&timestamps).ok_or(ValidationError::MissingField {
            field: "versions",
        })?;
        let winning_event_id = versions[winner].event_id.clone();

        self.audit
            .record(
                AuditEntry::new("conflict", "report", AuditStatus::Warning)
                    .device(device_id)
                    .details(format!(
                        "record_key={} versions={} winner={}",
                        record_key,
                        versions.len(),
                        winning_event_id
                    )),
            )
            .await?;

        info!(
            device_id = %device_id,
            record_key = %record_key,
            winner = %winning_event_id,
            "Reported conflict arbitrated"
        );
        Ok(winning_event_id)
    }

    // =========================================================================
    // Periodic Worker
    // =========================================================================

    /// Spawns the periodic sync loop.
    ///
    /// Each tick takes the shared coordinator gate so periodic passes
    /// never interleave with message handling. The returned worker stops
    /// the loop on [`PipelineWorker::stop`].
    pub fn start_periodic(&self, interval: Duration, gate: Arc<Mutex<()>>) -> PipelineWorker {
        let pipeline = self.clone();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Periodic sync worker started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The immediate first tick would race startup registration.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let _guard = gate.lock().await;
                        if let Err(e) = pipeline.run_periodic().await {
                            warn!(error = %e, "Periodic sync pass failed");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            info!("Periodic sync worker stopping");
                            break;
                        }
                    }
                }
            }
        });

        PipelineWorker {
            shutdown_tx,
            handle,
        }
    }
}

/// Handle to a running periodic sync loop.
#[derive(Debug)]
pub struct PipelineWorker {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PipelineWorker {
    /// Signals the loop to stop and waits for it to finish.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalTransport;
    use fleet_db::DbConfig;
    use serde_json::json;

    /// Transport double that refuses every delivery.
    #[derive(Clone, Default)]
    struct FailingTransport;

    impl Transport for FailingTransport {
        async fn send_to(&self, device_id: &str, _event: &OutboundEvent) -> CoordResult<()> {
            Err(CoordError::Transport {
                peer: device_id.to_string(),
                message: "unreachable".into(),
            })
        }

        async fn broadcast(&self, _event: &OutboundEvent) -> CoordResult<()> {
            Err(CoordError::Transport {
                peer: "*".into(),
                message: "unreachable".into(),
            })
        }
    }

    async fn test_db() -> Database {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        db.devices()
            .upsert(&mut conn, "pos-1", fleet_core::DeviceRole::Follower, 50)
            .await
            .unwrap();
        db.devices()
            .upsert(&mut conn, "pos-2", fleet_core::DeviceRole::Follower, 40)
            .await
            .unwrap();
        drop(conn);
        db
    }

    fn settings() -> SyncSettings {
        SyncSettings::default()
    }

    #[tokio::test]
    async fn test_ingest_persists_and_counts() {
        let db = test_db().await;
        let pipeline = SyncEventPipeline::new(db.clone(), LocalTransport::new(), settings());

        let outcome = pipeline
            .ingest("pos-1", "stock_update", &json!({"record_id": "r-1"}), None, false)
            .await
            .unwrap();
        let IngestOutcome::Accepted { event } = outcome else {
            panic!("expected acceptance");
        };
        assert_eq!(event.status, SyncEventStatus::Pending);

        let state = db.sync_states().get("pos-1").await.unwrap().unwrap();
        assert_eq!(state.pending_changes_count, 1);
    }

    #[tokio::test]
    async fn test_ingest_rejects_unknown_device() {
        let db = test_db().await;
        let pipeline = SyncEventPipeline::new(db, LocalTransport::new(), settings());

        let err = pipeline
            .ingest("ghost", "order", &json!({}), None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::UnknownDevice { .. }));
    }

    #[tokio::test]
    async fn test_conflicting_later_event_is_rejected() {
        let db = test_db().await;
        let pipeline = SyncEventPipeline::new(db.clone(), LocalTransport::new(), settings());

        let first = pipeline
            .ingest("pos-1", "stock_update", &json!({"record_id": "r-1", "qty": 1}), None, false)
            .await
            .unwrap();
        let IngestOutcome::Accepted { event: winner } = first else {
            panic!("expected acceptance");
        };

        // Same record, arrives later: first-write-wins rejects it.
        let second = pipeline
            .ingest("pos-2", "stock_update", &json!({"record_id": "r-1", "qty": 9}), None, false)
            .await
            .unwrap();
        let IngestOutcome::Rejected { record_key, winning_event_id } = second else {
            panic!("expected rejection");
        };
        assert_eq!(record_key, "r-1");
        assert_eq!(winning_event_id, winner.id);

        // The loser's origin gained no pending count.
        let state = db.sync_states().get("pos-2").await.unwrap().unwrap();
        assert_eq!(state.pending_changes_count, 0);
    }

    #[tokio::test]
    async fn test_distinct_records_do_not_conflict() {
        let db = test_db().await;
        let pipeline = SyncEventPipeline::new(db, LocalTransport::new(), settings());

        for key in ["r-1", "r-2", "r-3"] {
            let outcome = pipeline
                .ingest("pos-1", "stock_update", &json!({"record_id": key}), None, false)
                .await
                .unwrap();
            assert!(matches!(outcome, IngestOutcome::Accepted { .. }));
        }
    }

    #[tokio::test]
    async fn test_periodic_run_dispatches_and_clears_counts() {
        let db = test_db().await;
        let transport = LocalTransport::new();
        let mut rx = transport.subscribe("pos-2").await;
        let pipeline = SyncEventPipeline::new(db.clone(), transport, settings());

        pipeline
            .ingest("pos-1", "order", &json!({"record_id": "r-1"}), None, false)
            .await
            .unwrap();
        pipeline
            .ingest("pos-1", "order", &json!({"record_id": "r-2"}), None, false)
            .await
            .unwrap();

        let summary = pipeline.run_periodic().await.unwrap();
        assert_eq!(summary, PeriodicSummary { scanned: 2, dispatched: 2, failed: 0 });

        // Subscriber saw both updates.
        assert!(matches!(rx.recv().await, Some(OutboundEvent::SyncUpdate { .. })));
        assert!(matches!(rx.recv().await, Some(OutboundEvent::SyncUpdate { .. })));

        let state = db.sync_states().get("pos-1").await.unwrap().unwrap();
        assert_eq!(state.pending_changes_count, 0);
        assert_eq!(state.status, fleet_core::SyncStatus::Synced);

        // Nothing left for the next pass.
        let summary = pipeline.run_periodic().await.unwrap();
        assert_eq!(summary.scanned, 0);
    }

    #[tokio::test]
    async fn test_dispatch_failure_is_isolated_and_retried() {
        let db = test_db().await;
        let pipeline = SyncEventPipeline::new(db.clone(), FailingTransport, settings());

        pipeline
            .ingest("pos-1", "order", &json!({"record_id": "r-1"}), None, false)
            .await
            .unwrap();
        pipeline
            .ingest("pos-1", "order", &json!({"record_id": "r-2"}), None, false)
            .await
            .unwrap();

        // First pass: both fail, both were still attempted.
        let summary = pipeline.run_periodic().await.unwrap();
        assert_eq!(summary, PeriodicSummary { scanned: 2, dispatched: 0, failed: 2 });

        let state = db.sync_states().get("pos-1").await.unwrap().unwrap();
        assert_eq!(state.status, fleet_core::SyncStatus::Error);
        assert!(state.last_error_message.is_some());
        assert_eq!(state.pending_changes_count, 2);

        // Attempts 2 and 3: after the third failure both events are
        // terminal and stop occupying the queue.
        pipeline.run_periodic().await.unwrap();
        pipeline.run_periodic().await.unwrap();

        let summary = pipeline.run_periodic().await.unwrap();
        assert_eq!(summary.scanned, 0);

        let state = db.sync_states().get("pos-1").await.unwrap().unwrap();
        assert_eq!(state.pending_changes_count, 0);

        let counters = pipeline.queue_status("pos-1").await.unwrap();
        assert_eq!(counters.failed, 2);
    }

    #[tokio::test]
    async fn test_immediate_dispatch_skips_the_wait() {
        let db = test_db().await;
        let transport = LocalTransport::new();
        let mut rx = transport.subscribe("pos-2").await;
        let pipeline = SyncEventPipeline::new(db.clone(), transport, settings());

        let outcome = pipeline
            .ingest("pos-1", "order", &json!({"record_id": "r-1"}), None, true)
            .await
            .unwrap();
        let IngestOutcome::Accepted { event } = outcome else {
            panic!("expected acceptance");
        };
        assert_eq!(event.status, SyncEventStatus::Synced);
        // The immediate path announces itself as critical.
        assert!(matches!(rx.recv().await, Some(OutboundEvent::CriticalEvent { .. })));

        let state = db.sync_states().get("pos-1").await.unwrap().unwrap();
        assert_eq!(state.pending_changes_count, 0);
    }

    #[tokio::test]
    async fn test_failed_immediate_dispatch_stays_durable() {
        let db = test_db().await;
        let pipeline = SyncEventPipeline::new(db.clone(), FailingTransport, settings());

        let outcome = pipeline
            .ingest("pos-1", "order", &json!({"record_id": "r-1"}), None, true)
            .await
            .unwrap();
        let IngestOutcome::Accepted { event } = outcome else {
            panic!("expected acceptance");
        };
        // Back in the queue for the periodic retry.
        assert_eq!(event.status, SyncEventStatus::Pending);
        assert_eq!(event.attempts, 1);
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_parked_as_error() {
        let db = test_db().await;
        let pipeline = SyncEventPipeline::new(db.clone(), LocalTransport::new(), settings());

        let outcome = pipeline
            .ingest("pos-1", "order", &json!({"record_id": "r-1"}), None, false)
            .await
            .unwrap();
        let IngestOutcome::Accepted { event } = outcome else {
            panic!("expected acceptance");
        };

        // Corrupt the stored payload behind the pipeline's back.
        sqlx::query("UPDATE sync_events SET payload = 'not json' WHERE id = ?")
            .bind(&event.id)
            .execute(db.pool())
            .await
            .unwrap();

        let summary = pipeline.run_periodic().await.unwrap();
        assert_eq!(summary, PeriodicSummary { scanned: 1, dispatched: 0, failed: 1 });

        // Parked permanently, no retries left queued behind it.
        let stored = db.events().get(&event.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SyncEventStatus::Error);
        assert_eq!(stored.attempts, 0);

        let state = db.sync_states().get("pos-1").await.unwrap().unwrap();
        assert_eq!(state.pending_changes_count, 0);

        let summary = pipeline.run_periodic().await.unwrap();
        assert_eq!(summary.scanned, 0);
    }

    #[tokio::test]
    async fn test_events_for_excludes_own_events() {
        let db = test_db().await;
        let pipeline = SyncEventPipeline::new(db, LocalTransport::new(), settings());

        pipeline
            .ingest("pos-1", "order", &json!({"record_id": "r-1"}), None, false)
            .await
            .unwrap();
        pipeline
            .ingest("pos-2", "order", &json!({"record_id": "r-2"}), None, false)
            .await
            .unwrap();

        let events = pipeline.events_for("pos-1", None).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].origin_device, "pos-2");
    }

    #[tokio::test]
    async fn test_reported_conflict_names_the_earliest_version() {
        let db = test_db().await;
        let pipeline = SyncEventPipeline::new(db, LocalTransport::new(), settings());

        let base = chrono::Utc::now();
        let versions = vec![
            ConflictingVersion {
                event_id: "e-late".into(),
                created_at: base + chrono::Duration::seconds(30),
                payload: json!({"qty": 5}),
            },
            ConflictingVersion {
                event_id: "e-early".into(),
                created_at: base,
                payload: json!({"qty": 2}),
            },
        ];

        let winner = pipeline
            .report_conflict("pos-1", "r-1", &versions)
            .await
            .unwrap();
        assert_eq!(winner, "e-early");
    }

    #[tokio::test]
    async fn test_periodic_worker_runs_and_stops() {
        let db = test_db().await;
        let transport = LocalTransport::new();
        let pipeline = SyncEventPipeline::new(db.clone(), transport, settings());

        pipeline
            .ingest("pos-1", "order", &json!({"record_id": "r-1"}), None, false)
            .await
            .unwrap();

        let gate = Arc::new(Mutex::new(()));
        let worker = pipeline.start_periodic(Duration::from_millis(20), gate);
        tokio::time::sleep(Duration::from_millis(80)).await;
        worker.stop().await;

        let counters = pipeline.queue_status("pos-1").await.unwrap();
        assert_eq!(counters.synced, 1);
        assert_eq!(counters.pending, 0);
    }
}
