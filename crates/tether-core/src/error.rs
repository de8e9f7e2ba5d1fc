//! # Error Types
//!
//! Domain-specific error types for tether-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  tether-core errors (this file)                                        │
//! │  ├── CoreError        - State machine and correlation violations       │
//! │  └── ValidationError  - Identifier/topic validation failures           │
//! │                                                                         │
//! │  tether-sync errors (separate crate)                                   │
//! │  └── SyncError        - Transport, protocol rejection, timeout, close  │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → caller                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use crate::jobs::JobStatus;

// =============================================================================
// Core Error
// =============================================================================

/// Core protocol errors.
///
/// Every variant is fatal to the single call that produced it and leaves the
/// surrounding state untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// A job status change that the execution state machine does not allow.
    ///
    /// ## When This Occurs
    /// - Calling `succeeded` after `failed` (or twice)
    /// - Moving a job out of `Succeeded`, `Failed`, `Rejected` or `Canceled`
    /// - Requesting `Queued` from the device side
    #[error("Invalid job transition for {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    /// A token was registered while an entry with the same token is still
    /// outstanding.
    #[error("Client token already outstanding: {0}")]
    DuplicateToken(String),

    /// A status change was requested for a job execution that is not known.
    #[error("Unknown job execution: {thing_name}/{job_id}")]
    UnknownJob { thing_name: String, job_id: String },

    /// A topic could not be parsed as a shadow or job topic.
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Invalid format (e.g., characters outside the allowed set).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================
