//! # Fleet Coordinator
//!
//! The orchestrator: owns the registry, the election coordinator, the
//! sync pipeline and the edge-case guards, and routes protocol messages
//! through them.
//!
//! ## Message Path
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Coordinator Message Path                         │
//! │                                                                         │
//! │  CoordMessage                                                          │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  validate() ──────────► reject + audit (no state touched)              │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  acquire gate ◄──────── the periodic worker takes the same lock, so    │
//! │       │                 handling and periodic passes never interleave  │
//! │       ▼                                                                 │
//! │  rate limit ──────────► reject + audit                                 │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  clock drift ─────────► advisory flag only                             │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  route: registry / election / pipeline / guard                         │
//! │                                                                         │
//! │  Leadership changes additionally broadcast LeaderElected to the        │
//! │  whole fleet.                                                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::audit::AuditTrail;
use crate::config::CoordinatorConfig;
use crate::election::{ElectionCoordinator, ElectionOutcome};
use crate::error::{CoordError, CoordResult};
use crate::guard::{EdgeCaseGuard, PartitionPlan};
use crate::pipeline::{IngestOutcome, PipelineWorker, SyncEventPipeline};
use crate::protocol::{CoordMessage, CoordResponse, LivenessState, OutboundEvent, SyncScope};
use crate::registry::DeviceRegistry;
use crate::transport::Transport;
use fleet_core::{AuditEntry, AuditStatus, DeviceRole, ElectionReason};
use fleet_db::Database;

/// The fleet coordinator.
pub struct Coordinator<T: Transport + Clone> {
    config: CoordinatorConfig,
    registry: DeviceRegistry,
    election: ElectionCoordinator,
    pipeline: SyncEventPipeline<T>,
    guard: EdgeCaseGuard,
    transport: T,
    audit: AuditTrail,
    /// Serializes mutations: message handling and the periodic worker
    /// both hold this across their critical sections.
    gate: Arc<Mutex<()>>,
    worker: Mutex<Option<PipelineWorker>>,
}

impl<T: Transport + Clone> Coordinator<T> {
    /// Creates a coordinator over the given database and transport.
    pub fn new(config: CoordinatorConfig, db: Database, transport: T) -> Self {
        let registry = DeviceRegistry::new(db.clone());
        let election = ElectionCoordinator::new(db.clone());
        let pipeline = SyncEventPipeline::new(db.clone(), transport.clone(), config.sync.clone());
        let guard = EdgeCaseGuard::new(db.clone(), config.guard.clone());
        let audit = AuditTrail::new(&db);

        Coordinator {
            config,
            registry,
            election,
            pipeline,
            guard,
            transport,
            audit,
            gate: Arc::new(Mutex::new(())),
            worker: Mutex::new(None),
        }
    }

    /// Starts the periodic sync worker.
    pub async fn start(&self) {
        let mut worker = self.worker.lock().await;
        if worker.is_none() {
            *worker = Some(
                self.pipeline
                    .start_periodic(self.config.sync_interval(), self.gate.clone()),
            );
            info!(device_id = %self.config.device_id(), "Coordinator started");
        }
    }

    /// Stops the periodic sync worker and waits for it to finish.
    pub async fn shutdown(&self) {
        if let Some(worker) = self.worker.lock().await.take() {
            worker.stop().await;
        }
        info!("Coordinator stopped");
    }

    // =========================================================================
    // Message Handling
    // =========================================================================

    /// Handles one inbound message end to end.
    pub async fn handle(&self, msg: CoordMessage) -> CoordResult<CoordResponse> {
        if let Err(e) = msg.validate() {
            self.audit
                .record(
                    AuditEntry::new("message", msg.kind(), AuditStatus::Error)
                        .device(msg.device_id())
                        .details(format!("rejected: {}", e)),
                )
                .await?;
            return Err(e.into());
        }

        let _guard = self.gate.lock().await;

        // Heartbeats are exempt from the budget so liveness keeps
        // flowing from a throttled device.
        if !matches!(msg, CoordMessage::Heartbeat { .. }) {
            self.guard.check_rate_limit(msg.device_id()).await?;
        }

        if let Some(sent_at) = msg.sent_at() {
            // Advisory only: the message proceeds either way.
            self.guard
                .detect_clock_drift(msg.device_id(), sent_at)
                .await?;
        }

        match msg {
            CoordMessage::Register {
                device_id,
                role,
                priority,
                ..
            } => self.handle_register(&device_id, role, priority).await,

            CoordMessage::Heartbeat { device_id, .. } => {
                self.registry.heartbeat(&device_id).await?;
                Ok(CoordResponse::Ack {
                    message: "heartbeat".into(),
                })
            }

            CoordMessage::Liveness { device_id, state } => {
                self.handle_liveness(&device_id, state).await
            }

            CoordMessage::RoleChange { device_id, role, reason } => {
                self.handle_role_change(&device_id, role, reason.as_deref()).await
            }

            CoordMessage::ElectionTrigger { requested_by, reason } => {
                // The requester must be known; anyone known may ask.
                self.registry.get_known(&requested_by).await?;
                let outcome = self.election.trigger_election(reason).await?;
                self.announce_leadership(&outcome, reason).await;
                Ok(leader_response(&outcome))
            }

            CoordMessage::SyncRequest { device_id, sync_type, since } => {
                self.registry.get_known(&device_id).await?;
                // Any device may pull, but only a fleet with an active
                // leader answers: leaderless state means the canonical
                // timeline is still being re-established.
                if self.registry.current_leader().await?.is_none() {
                    return Err(CoordError::NoLeader);
                }
                let since = match sync_type {
                    SyncScope::Full => None,
                    SyncScope::Incremental => since,
                };
                let events = self.pipeline.events_for(&device_id, since).await?;
                Ok(CoordResponse::Events { events })
            }

            CoordMessage::DataUpdate {
                device_id,
                event_type,
                data,
                user_id,
                immediate,
                ..
            } => {
                let outcome = self
                    .pipeline
                    .ingest(&device_id, &event_type, &data, user_id, immediate)
                    .await?;
                Ok(match outcome {
                    IngestOutcome::Accepted { event }
                    | IngestOutcome::Superseded { event, .. } => CoordResponse::EventAccepted {
                        event_id: event.id,
                    },
                    IngestOutcome::Rejected {
                        record_key,
                        winning_event_id,
                    } => CoordResponse::EventRejected {
                        record_key,
                        winning_event_id,
                    },
                })
            }

            CoordMessage::ConflictReport {
                device_id,
                record_key,
                versions,
            } => {
                self.registry.get_known(&device_id).await?;
                let winning_event_id = self
                    .pipeline
                    .report_conflict(&device_id, &record_key, &versions)
                    .await?;
                Ok(CoordResponse::ConflictResolved {
                    record_key,
                    winning_event_id,
                })
            }

            CoordMessage::QueueStatus { device_id } => {
                let summary = self.pipeline.queue_status(&device_id).await?;
                Ok(CoordResponse::QueueStatus {
                    device_id,
                    total: summary.total,
                    pending: summary.pending,
                    synced: summary.synced,
                    failed: summary.failed,
                })
            }
        }
    }

    /// Handles a network partition report for a device.
    ///
    /// Builds the role-aware partition plan; if the partitioned device
    /// was the leader, leadership fails over to a reachable device.
    pub async fn handle_partition(&self, device_id: &str) -> CoordResult<PartitionPlan> {
        let _guard = self.gate.lock().await;

        let plan = self.guard.partition_response(device_id).await?;

        if plan.role == DeviceRole::Leader {
            warn!(device_id = %device_id, "Partitioned device was the leader, failing over");
            match self
                .election
                .trigger_election_excluding(ElectionReason::Failure, Some(device_id))
                .await
            {
                Ok(outcome) => {
                    self.announce_leadership(&outcome, ElectionReason::Failure).await
                }
                Err(CoordError::NoEligibleDevices) => {
                    // Single-device fleet: nothing to fail over to.
                }
                Err(e) => return Err(e),
            }
        }

        Ok(plan)
    }

    // =========================================================================
    // Routing Internals
    // =========================================================================

    async fn handle_register(
        &self,
        device_id: &str,
        role: DeviceRole,
        priority: i64,
    ) -> CoordResult<CoordResponse> {
        self.registry.register(device_id, role, priority).await?;

        // A registration announcing leadership can create split-brain;
        // repair it immediately and deterministically.
        if role == DeviceRole::Leader {
            if let Some(outcome) = self.election.resolve_split_brain().await? {
                self.announce_leadership(&outcome, ElectionReason::SplitBrainResolution)
                    .await;
                return Ok(leader_response(&outcome));
            }
        }

        // A fleet without a leader elects one as soon as a device joins.
        if self.registry.current_leader().await?.is_none() {
            let outcome = self.election.trigger_election(ElectionReason::Manual).await?;
            self.announce_leadership(&outcome, ElectionReason::Manual).await;
            return Ok(leader_response(&outcome));
        }

        Ok(CoordResponse::Ack {
            message: format!("registered {}", device_id),
        })
    }

    async fn handle_liveness(
        &self,
        device_id: &str,
        state: LivenessState,
    ) -> CoordResult<CoordResponse> {
        let device = self.registry.get_known(device_id).await?;

        match state {
            LivenessState::Online => {
                self.registry.heartbeat(device_id).await?;
                Ok(CoordResponse::Ack {
                    message: "online".into(),
                })
            }
            LivenessState::Shutdown | LivenessState::Offline => {
                let was_leader = device.role == DeviceRole::Leader;
                let reason = match state {
                    LivenessState::Shutdown => ElectionReason::Shutdown,
                    _ => ElectionReason::Failure,
                };

                // Failover runs while the departing device is still
                // registered, so it counts as an election participant
                // without being electable.
                if was_leader {
                    match self
                        .election
                        .trigger_election_excluding(reason, Some(device_id))
                        .await
                    {
                        Ok(outcome) => {
                            self.announce_leadership(&outcome, reason).await;
                            self.registry.deactivate(device_id).await?;
                            return Ok(leader_response(&outcome));
                        }
                        Err(CoordError::NoEligibleDevices) => {
                            // Last device leaving: just deactivate it.
                        }
                        Err(e) => return Err(e),
                    }
                }

                self.registry.deactivate(device_id).await?;
                Ok(CoordResponse::Ack {
                    message: format!("{} {}", state, device_id),
                })
            }
        }
    }

    async fn handle_role_change(
        &self,
        device_id: &str,
        role: DeviceRole,
        reason: Option<&str>,
    ) -> CoordResult<CoordResponse> {
        self.registry.change_role(device_id, role, reason).await?;

        // Promoting a second leader is legal at the registry level but
        // leaves the fleet split-brained; collapse it right away.
        if role == DeviceRole::Leader {
            if let Some(outcome) = self.election.resolve_split_brain().await? {
                self.announce_leadership(&outcome, ElectionReason::SplitBrainResolution)
                    .await;
                return Ok(leader_response(&outcome));
            }
        }

        Ok(CoordResponse::Ack {
            message: format!("role of {} is now {}", device_id, role),
        })
    }

    /// Broadcasts a leadership change to the fleet. Best effort: an
    /// unreachable fleet learns the leader on its next pull.
    async fn announce_leadership(&self, outcome: &ElectionOutcome, reason: ElectionReason) {
        let ElectionOutcome::Elected { record, leader } = outcome else {
            return;
        };

        let event = OutboundEvent::LeaderElected {
            leader: leader.device_id.clone(),
            previous: record.previous_leader.clone(),
            reason,
        };
        if let Err(e) = self.transport.broadcast(&event).await {
            warn!(error = %e, "Failed to broadcast leadership change");
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// The device registry.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// The election coordinator.
    pub fn election(&self) -> &ElectionCoordinator {
        &self.election
    }

    /// The sync pipeline.
    pub fn pipeline(&self) -> &SyncEventPipeline<T> {
        &self.pipeline
    }

    /// The edge-case guard.
    pub fn guard(&self) -> &EdgeCaseGuard {
        &self.guard
    }

    /// The audit trail.
    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    /// This coordinator's configuration.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }
}

fn leader_response(outcome: &ElectionOutcome) -> CoordResponse {
    CoordResponse::Leader {
        device_id: outcome.leader().device_id.clone(),
        changed: matches!(outcome, ElectionOutcome::Elected { .. }),
    }
}
