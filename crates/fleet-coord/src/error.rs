//! # Coordination Error Types
//!
//! Error types for fleet coordination operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                   Coordination Error Categories                         │
//! │                                                                         │
//! │  ┌──────────────────┐  ┌──────────────────┐  ┌──────────────────────┐ │
//! │  │   Validation     │  │    Transient     │  │     Structural       │ │
//! │  │  (rejected before│  │  (rolled back,   │  │  (topology is wrong, │ │
//! │  │   any mutation)  │  │   maybe retried) │  │   retry won't help)  │ │
//! │  │                  │  │                  │  │                      │ │
//! │  │  Validation      │  │  Database        │  │  SplitBrain          │ │
//! │  │  RateLimited     │  │  Transport       │  │  NoEligibleDevices   │ │
//! │  │  InvalidMessage  │  │                  │  │  UnknownDevice       │ │
//! │  │                  │  │                  │  │  NoLeader            │ │
//! │  └──────────────────┘  └──────────────────┘  └──────────────────────┘ │
//! │                                                                         │
//! │  Plus configuration errors (load/save/validate) at startup.            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Result type alias for coordination operations.
pub type CoordResult<T> = Result<T, CoordError>;

/// Coordination error type covering all coordinator failures.
///
/// ## Design Principles
/// - Each variant includes enough context for debugging
/// - Errors are categorized for different handling strategies
/// - All errors are `Send + Sync` for async compatibility
#[derive(Debug, Error)]
pub enum CoordError {
    // =========================================================================
    // Validation Errors (rejected before any state change)
    // =========================================================================
    /// A message or payload failed validation.
    #[error(transparent)]
    Validation(#[from] fleet_core::ValidationError),

    /// A message shape the protocol does not recognize.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// A device exceeded its operation budget for the sliding window.
    #[error("Rate limit exceeded for device {device_id}: {count} ops in {window_secs}s (max {max_ops})")]
    RateLimited {
        device_id: String,
        count: i64,
        window_secs: u64,
        max_ops: i64,
    },

    // =========================================================================
    // Transient Errors (the operation rolled back and may be retried)
    // =========================================================================
    /// Store access failed mid-operation.
    #[error("Store error: {0}")]
    Database(String),

    /// Delivering to a peer failed.
    #[error("Transport to {peer} failed: {message}")]
    Transport { peer: String, message: String },

    // =========================================================================
    // Structural Errors (the fleet topology itself is wrong)
    // =========================================================================
    /// More than one active leader exists.
    #[error("Split-brain: {leader_count} active leaders")]
    SplitBrain { leader_count: usize },

    /// An election found no active devices to promote.
    #[error("No eligible devices for election")]
    NoEligibleDevices,

    /// An operation referenced a device the registry does not know.
    #[error("Unknown device: {device_id}")]
    UnknownDevice { device_id: String },

    /// No active leader exists and the operation needs one.
    #[error("No active leader")]
    NoLeader,

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid coordinator configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Failed to serialize or deserialize a message.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Coordinator is shutting down.
    #[error("Coordinator is shutting down")]
    ShuttingDown,

    /// Internal coordinator error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<fleet_db::DbError> for CoordError {
    fn from(err: fleet_db::DbError) -> Self {
        CoordError::Database(err.to_string())
    }
}

impl From<fleet_core::CoreError> for CoordError {
    fn from(err: fleet_core::CoreError) -> Self {
        match err {
            fleet_core::CoreError::Validation(v) => CoordError::Validation(v),
            other => CoordError::InvalidMessage(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoordError {
    fn from(err: serde_json::Error) -> Self {
        CoordError::SerializationFailed(err.to_string())
    }
}

impl From<std::io::Error> for CoordError {
    fn from(err: std::io::Error) -> Self {
        CoordError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for CoordError {
    fn from(err: toml::de::Error) -> Self {
        CoordError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for CoordError {
    fn from(err: toml::ser::Error) -> Self {
        CoordError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry / audit logic)
// =============================================================================

impl CoordError {
    /// Returns true if the operation was rejected before touching state.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            CoordError::Validation(_)
                | CoordError::InvalidMessage(_)
                | CoordError::RateLimited { .. }
        )
    }

    /// Returns true if this error is recoverable: the failed operation
    /// rolled back cleanly and a later attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoordError::Database(_) | CoordError::Transport { .. }
        )
    }

    /// Returns true if the fleet topology itself is wrong. Retrying the
    /// same operation cannot help until the topology is repaired.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            CoordError::SplitBrain { .. }
                | CoordError::NoEligibleDevices
                | CoordError::UnknownDevice { .. }
                | CoordError::NoLeader
        )
    }
}
