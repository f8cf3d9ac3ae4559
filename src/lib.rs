//! # outline-core
//!
//! Persistence coordination engine for hierarchical node graphs: an
//! in-memory cache that is the source of truth during a session, a write
//! scheduler that debounces, orders, and retries persistence, a hierarchy
//! engine that keeps sibling chains and parent pointers consistent through
//! moves and cascading deletes, and an abstract [`db::NodeStore`] seam any
//! backing store can implement.
//!
//! ## Design principles
//!
//! 1. **The cache is authoritative** - reads never wait on the store;
//!    subscribers are notified synchronously with each mutation.
//! 2. **Persistence identity is explicit** - whether a node has ever been
//!    durably created is tracked separately from its save/pending/writing
//!    display state, and is the sole input to the CREATE-vs-UPDATE
//!    decision.
//! 3. **Writes are coordinated, not immediate** - content edits coalesce
//!    within a debounce window; structural changes dispatch immediately;
//!    writes that depend on an unpersisted node wait for it, and are
//!    released with an explicit signal if it will never persist.
//!
//! ## Quick start
//!
//! ```
//! use outline_core::db::MemoryStore;
//! use outline_core::services::{CreateNodeParams, NodeEngine};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = NodeEngine::new(Arc::new(MemoryStore::new()));
//! let id = engine.create_node(CreateNodeParams::new("text", "hello"))?;
//! engine.flush().await;
//! assert!(engine.get_node(&id).unwrap().ever_persisted);
//! # Ok(())
//! # }
//! ```

pub mod db;
pub mod models;
pub mod services;

pub use db::{DomainEvent, MemoryStore, NodeStore, StoreError};
pub use models::{DeleteResult, LifecycleState, Node, NodeUpdate};
pub use services::{
    CreateNodeParams, EngineError, InsertPosition, NodeEngine, SchedulerConfig,
};
