//! # fleet-core: Pure Coordination Logic
//!
//! Shared types and deterministic logic for the fleet coordinator.
//! This crate performs NO I/O: no database, no network, no clock sources
//! beyond timestamping newly built values.
//!
//! ## Modules
//! - [`types`] - The coordination data model (devices, events, sync state,
//!   election records, audit entries)
//! - [`conflict`] - The pure, deterministic conflict resolver
//!   (first-write-wins)
//! - [`error`] - Domain and validation error types
//!
//! ## Feature Flags
//! - `sqlx` - adds `FromRow`/`Type` derives so fleet-db can map rows
//!   directly onto these types. No sqlx runtime code is pulled in.

pub mod conflict;
pub mod error;
pub mod types;

pub use conflict::{resolve, resolve_among, ConflictDisposition, ConflictOutcome, ConflictWinner};
pub use error::{require, CoreError, ValidationError};
pub use types::{
    extract_record_key, AuditEntry, AuditStatus, Device, DeviceRole, ElectionReason,
    ElectionRecord, SyncEvent, SyncEventStatus, SyncState, SyncStatus,
};
