//! # fleet-coord: Coordination Engine for the Device Fleet
//!
//! Leader election, split-brain resolution, sync-event pipelining and
//! edge-case guarding for a fleet of point-of-sale edge devices sharing
//! one coordination store.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Fleet Coordination                               │
//! │                                                                         │
//! │  devices ──CoordMessage──► Coordinator ──CoordResponse──► devices      │
//! │                                │                                        │
//! │            ┌───────────────────┼────────────────────┐                   │
//! │            ▼                   ▼                    ▼                   │
//! │     DeviceRegistry    ElectionCoordinator    SyncEventPipeline          │
//! │     (registry.rs)     (election.rs)          (pipeline.rs)              │
//! │            │                   │                    │                   │
//! │            └───────┬───────────┴──────────┬─────────┘                   │
//! │                    ▼                      ▼                             │
//! │              EdgeCaseGuard           Transport                          │
//! │              (guard.rs)              (transport.rs)                     │
//! │                    │                                                    │
//! │                    ▼                                                    │
//! │               fleet-db (SQLite, one transaction per mutation)           │
//! │                                                                         │
//! │  All mutations funnel through one async gate, so elections, ingest     │
//! │  and periodic dispatch never interleave.                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`coordinator`] - Orchestrator and message routing
//! - [`registry`] - Device membership, liveness and roles
//! - [`election`] - Leader election and split-brain resolution
//! - [`pipeline`] - Event ingest, conflict resolution and dispatch
//! - [`guard`] - Clock drift, rate limits, degradation, partitions
//! - [`protocol`] - JSON wire messages
//! - [`transport`] - Delivery seam (channel-backed local impl included)
//! - [`config`] - TOML + environment configuration
//! - [`audit`] - Audit trail access
//! - [`error`] - Error taxonomy (validation / transient / structural)

// =============================================================================
// Module Declarations
// =============================================================================

pub mod audit;
pub mod config;
pub mod coordinator;
pub mod election;
pub mod error;
pub mod guard;
pub mod pipeline;
pub mod protocol;
pub mod registry;
pub mod transport;

// =============================================================================
// Re-exports
// =============================================================================

pub use audit::AuditTrail;
pub use config::{CoordinatorConfig, GuardSettings, SyncSettings};
pub use coordinator::Coordinator;
pub use election::{ElectionCoordinator, ElectionOutcome};
pub use error::{CoordError, CoordResult};
pub use guard::{
    DegradationFallback, DegradationPlan, DegradationStrategy, DriftReport, EdgeCaseGuard,
    FailureKind, PartitionAction, PartitionPlan, RecoveryPath, RecoveryStep, SyncSizeStrategy,
};
pub use pipeline::{IngestOutcome, PeriodicSummary, PipelineWorker, SyncEventPipeline};
pub use protocol::{
    ConflictingVersion, CoordMessage, CoordResponse, LivenessState, OutboundEvent, SyncScope,
};
pub use registry::DeviceRegistry;
pub use transport::{LocalTransport, Transport};
