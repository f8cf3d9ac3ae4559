//! Data Models
//!
//! Core data structures shared by the cache, the write scheduler, and the
//! backing store seam: the universal [`Node`], the sparse [`NodeUpdate`]
//! patch, query types, and validation.

pub mod node;

pub use node::{
    order_by_sibling_chain, DeleteResult, LifecycleState, Node, NodeFilter, NodeOrder, NodeQuery,
    NodeUpdate, ValidationError,
};
