//! # fleet-db: Storage Layer for the Fleet Coordinator
//!
//! SQLite persistence for device registry, sync events, per-device sync
//! state, election history and the audit trail, built on sqlx.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Fleet Coordinator Data Flow                        │
//! │                                                                         │
//! │  Coordinator (fleet-coord)                                             │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     fleet-db (THIS CRATE)                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌────────────────┐    ┌─────────────┐  │   │
//! │  │   │   Database    │    │  Repositories  │    │ Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │                │    │ (embedded)  │  │   │
//! │  │   │               │    │ DeviceRepo     │    │             │  │   │
//! │  │   │ SqlitePool    │◄───│ EventRepo      │    │ 001_initial │  │   │
//! │  │   │ Transactions  │    │ SyncStateRepo  │    │ _schema.sql │  │   │
//! │  │   │ (begin())     │    │ ElectionRepo   │    │             │  │   │
//! │  │   │               │    │ AuditRepo      │    │             │  │   │
//! │  │   └───────────────┘    └────────────────┘    └─────────────┘  │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │                   SQLite Database (WAL mode)                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`repository`] - One repository per table
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fleet_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("path/to/fleet.db")).await?;
//!
//! let leader = db.devices().get_leader().await?;
//!
//! // Multi-statement mutations compose into one transaction.
//! let mut tx = db.begin().await?;
//! db.devices().set_role(&mut tx, "pos-2", DeviceRole::Leader).await?;
//! tx.commit().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

// Repository re-exports for convenience
pub use repository::audit::{AuditFilter, AuditRepository};
pub use repository::device::DeviceRepository;
pub use repository::election::ElectionLogRepository;
pub use repository::event::{EventRepository, EventStatusSummary};
pub use repository::sync_state::SyncStateRepository;
