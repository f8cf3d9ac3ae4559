//! Backing Store Error Types
//!
//! Typed errors for the persistence seam. The write scheduler branches on
//! these (create fallback on `NotFound`, refresh-retry on
//! `VersionConflict`), so they are concrete variants rather than opaque
//! `anyhow` errors; `Backend` remains the escape hatch for
//! implementation-specific failures.

use thiserror::Error;

/// Backing store operation errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// The addressed node does not exist in the store
    #[error("Node not found in store: {id}")]
    NotFound { id: String },

    /// A create collided with an existing record for the same id
    #[error("Node already exists in store: {id}")]
    DuplicateId { id: String },

    /// Optimistic concurrency check failed
    #[error(
        "Version conflict for node {id}: expected version {expected_version}, found {actual_version}"
    )]
    VersionConflict {
        id: String,
        expected_version: i64,
        actual_version: i64,
    },

    /// A structural invariant was broken at the store; never retried
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// A concurrent structural operation raced this one; caller may retry
    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    /// Opaque backend failure (connection loss, I/O, serialization)
    #[error("Store backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    /// Create a not-found error
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Create a duplicate-id error
    pub fn duplicate_id(id: impl Into<String>) -> Self {
        Self::DuplicateId { id: id.into() }
    }

    /// Create a version conflict error
    pub fn version_conflict(
        id: impl Into<String>,
        expected_version: i64,
        actual_version: i64,
    ) -> Self {
        Self::VersionConflict {
            id: id.into(),
            expected_version,
            actual_version,
        }
    }

    /// Create a constraint violation error
    pub fn constraint_violation(msg: impl Into<String>) -> Self {
        Self::ConstraintViolation(msg.into())
    }

    /// Create a concurrent modification error
    pub fn concurrent_modification(msg: impl Into<String>) -> Self {
        Self::ConcurrentModification(msg.into())
    }

    /// Whether a retry with the same inputs can ever succeed.
    ///
    /// `VersionConflict` is retriable only after a fresh read, which the
    /// scheduler performs itself, so it is not listed here.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::ConcurrentModification(_))
    }
}

/// Convenience alias for store results
pub type StoreResult<T> = Result<T, StoreError>;
