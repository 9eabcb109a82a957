//! # Error Types
//!
//! Domain-specific error types for fleet-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  fleet-core errors (this file)                                         │
//! │  ├── CoreError        - General domain errors                          │
//! │  └── ValidationError  - Protocol-boundary field validation failures    │
//! │                                                                         │
//! │  fleet-db errors (separate crate)                                      │
//! │  └── DbError          - Durable store failures                         │
//! │                                                                         │
//! │  fleet-coord errors (separate crate)                                   │
//! │  └── CoordError       - Validation / Transient / Structural taxonomy   │
//! │                                                                         │
//! │  Flow: ValidationError → CoordError → caller diagnostic                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Principles
//! 1. Use `thiserror` for derive macros (not manual impl)
//! 2. Include context in error messages (device id, field name)
//! 3. Errors are enum variants, never bare Strings
//! 4. Validation failures happen BEFORE any mutation

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A string did not parse into a known enum variant.
    #[error("Unknown {kind}: '{value}'")]
    UnknownVariant { kind: &'static str, value: String },

    /// An event payload is not valid JSON.
    #[error("Undecodable event payload: {0}")]
    UndecodablePayload(String),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Protocol-boundary validation errors.
///
/// Raised before any mutation; the caller receives a structured diagnostic
/// and nothing is audited as a state change.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("Missing required field: {field}")]
    MissingField { field: &'static str },

    /// A field is present but its value is not acceptable.
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Checks that a string field is present and non-empty.
pub fn require(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        Err(ValidationError::MissingField { field })
    } else {
        Ok(())
    }
}
