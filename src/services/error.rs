//! Engine Error Types
//!
//! Error taxonomy for the coordination layer. Per-node failures are
//! isolated: one node's error never blocks or invalidates writes for
//! unrelated nodes.

use crate::db::StoreError;
use crate::models::ValidationError;
use thiserror::Error;

/// Errors surfaced by the cache, scheduler, and hierarchy engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// Node not found in the cache
    #[error("Node not found: {id}")]
    NodeNotFound { id: String },

    /// A waited-on dependency was deleted (or permanently failed) before
    /// it ever persisted; the waiter is released with this signal instead
    /// of blocking forever
    #[error("Write for node {id} abandoned: dependency {dependency} will never persist")]
    DependencyAbandoned { id: String, dependency: String },

    /// Parking this write would close a circular wait between scheduled
    /// writes
    #[error("Write for node {id} would deadlock waiting on {dependency}")]
    DependencyCycle { id: String, dependency: String },

    /// Cascading delete beyond the depth ceiling; rejected before any
    /// partial deletion occurs
    #[error("Hierarchy depth {depth} exceeds the limit of {limit}")]
    RecursionLimitExceeded { depth: usize, limit: usize },

    /// A move would make a node an ancestor of itself
    #[error("Circular reference detected: {context}")]
    CircularReference { context: String },

    /// The requested operation is malformed (e.g., insert after itself)
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Node validation failed
    #[error("Node validation failed: {0}")]
    ValidationFailed(#[from] ValidationError),

    /// The backing store rejected the operation
    #[error("Store operation failed: {0}")]
    Store(#[from] StoreError),

    /// A scheduled write exhausted its retries
    #[error("Write for node {id} failed after {attempts} attempt(s)")]
    WriteFailed { id: String, attempts: u32 },
}

impl EngineError {
    /// Create a node-not-found error
    pub fn node_not_found(id: impl Into<String>) -> Self {
        Self::NodeNotFound { id: id.into() }
    }

    /// Create a dependency-abandoned error
    pub fn dependency_abandoned(id: impl Into<String>, dependency: impl Into<String>) -> Self {
        Self::DependencyAbandoned {
            id: id.into(),
            dependency: dependency.into(),
        }
    }

    /// Create a dependency-cycle error
    pub fn dependency_cycle(id: impl Into<String>, dependency: impl Into<String>) -> Self {
        Self::DependencyCycle {
            id: id.into(),
            dependency: dependency.into(),
        }
    }

    /// Create a circular reference error
    pub fn circular_reference(context: impl Into<String>) -> Self {
        Self::CircularReference {
            context: context.into(),
        }
    }

    /// Create an invalid operation error
    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }
}

/// Convenience alias for engine results
pub type EngineResult<T> = Result<T, EngineError>;
