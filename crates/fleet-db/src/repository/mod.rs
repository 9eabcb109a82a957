//! # Repository Layer
//!
//! One repository per table. Reads run directly on the pool; mutations
//! take a `&mut SqliteConnection` so the coordinator can compose them
//! into transactions (role change + audit entry, demotion + promotion +
//! election record) that commit atomically.

pub mod audit;
pub mod device;
pub mod election;
pub mod event;
pub mod sync_state;

pub use audit::{AuditFilter, AuditRepository};
pub use device::DeviceRepository;
pub use election::ElectionLogRepository;
pub use event::{EventRepository, EventStatusSummary};
pub use sync_state::SyncStateRepository;
