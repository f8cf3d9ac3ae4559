//! Persistence Seam
//!
//! This module defines the boundary between the coordination layer and the
//! backing store:
//!
//! - [`NodeStore`] - the abstract store contract (CRUD with optimistic
//!   version checks, atomic cascade delete, mention edges, vector search)
//! - [`StoreError`] - the typed error taxonomy the scheduler branches on
//! - [`MemoryStore`] - process-local reference implementation
//! - [`DomainEvent`] - change notifications broadcast by the cache

mod error;
pub mod events;
mod memory_store;
mod node_store;

pub use error::{StoreError, StoreResult};
pub use events::{ChangeSource, DomainEvent};
pub use memory_store::{MemoryStore, OpCounts, StoreOp};
pub use node_store::{MentionEdge, NodeStore};
