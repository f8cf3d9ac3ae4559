//! Coordination Services
//!
//! The in-memory side of the persistence pipeline:
//!
//! - [`NodeCache`] - authoritative working copy of the loaded node graph
//! - [`WriteScheduler`] - debounce, ordering, retry, and the
//!   CREATE-vs-UPDATE decision
//! - [`HierarchyEngine`] - compound structural operations (move, reorder,
//!   cascading delete)
//! - [`MentionIndex`] - bidirectional reference lookup
//! - [`NodeEngine`] - the facade callers construct

pub mod engine;
pub mod error;
pub mod hierarchy;
pub mod mention_index;
pub mod node_cache;
pub mod write_scheduler;

pub use engine::{CreateNodeParams, NodeEngine};
pub use error::{EngineError, EngineResult};
pub use hierarchy::{HierarchyEngine, InsertPosition, MAX_HIERARCHY_DEPTH};
pub use mention_index::MentionIndex;
pub use node_cache::{NodeCache, WriteRequest, WriteSink};
pub use write_scheduler::{SchedulerConfig, WriteOutcome, WriteScheduler};
