//! NodeStore Trait - Backing Store Abstraction
//!
//! This module defines the `NodeStore` trait consumed by the write
//! scheduler and the hierarchy engine. The trait is the persistence
//! boundary of the crate: everything above it treats the store as an
//! abstract key-addressed record set with optimistic-concurrency version
//! checks.
//!
//! # Design Decisions
//!
//! 1. **Async-first**: all methods are async so both embedded and network
//!    backends fit behind the same seam
//! 2. **Typed errors**: the scheduler branches on [`StoreError`] variants
//!    (`NotFound` triggers the create fallback, `VersionConflict` the
//!    refresh retry), so methods return `StoreResult` rather than opaque
//!    errors
//! 3. **Ownership semantics**: creates take the `Node` by value; updates
//!    take a sparse [`NodeUpdate`] plus the caller's last known version

use crate::db::error::StoreResult;
use crate::models::{DeleteResult, Node, NodeQuery, NodeUpdate};
use async_trait::async_trait;

/// A mention edge scheduled for removal alongside a subtree delete
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MentionEdge {
    pub source_id: String,
    pub target_id: String,
}

impl MentionEdge {
    pub fn new(source_id: impl Into<String>, target_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            target_id: target_id.into(),
        }
    }
}

/// Abstraction layer for node persistence operations.
///
/// Implementations must be `Send + Sync`; futures may move between
/// threads.
#[async_trait]
pub trait NodeStore: Send + Sync {
    //
    // CORE CRUD OPERATIONS
    //

    /// Create a new node record.
    ///
    /// Returns the stored node with its store-assigned version.
    ///
    /// # Errors
    ///
    /// - `DuplicateId` if a record with the same id already exists
    /// - `ConstraintViolation` if validation fails at the store
    async fn create_node(&self, node: Node) -> StoreResult<Node>;

    /// Get a node by id. `Ok(None)` means the node doesn't exist (not an
    /// error).
    async fn get_node(&self, id: &str) -> StoreResult<Option<Node>>;

    /// Apply a sparse update under an optimistic version check.
    ///
    /// Returns the full updated node with its bumped version.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the record doesn't exist (the scheduler falls back
    ///   to a create exactly once)
    /// - `VersionConflict` if `expected_version` is stale
    async fn update_node(
        &self,
        id: &str,
        expected_version: i64,
        update: NodeUpdate,
    ) -> StoreResult<Node>;

    /// Delete a single node record. Idempotent: deleting a missing id
    /// succeeds with `deleted_count == 0`.
    async fn delete_node(&self, id: &str) -> StoreResult<DeleteResult>;

    /// Delete a node and all of its descendants in one atomic transaction.
    ///
    /// # Contract
    ///
    /// 1. **Atomicity**: all-or-nothing; on failure the store is unchanged
    /// 2. **Order**: children are removed before parents (leaf-to-root)
    /// 3. **Mention cleanup**: every edge in `edges` is removed in the same
    ///    transaction, before the nodes themselves
    /// 4. **Idempotence**: a missing root succeeds with count 0
    /// 5. **Races**: a create landing inside the subtree mid-delete fails
    ///    the transaction with `ConcurrentModification`; one operation
    ///    wins, the other reports a conflict
    ///
    /// Returns the number of nodes removed.
    async fn delete_subtree_atomic(
        &self,
        root_id: &str,
        edges: Vec<MentionEdge>,
    ) -> StoreResult<usize>;

    //
    // QUERYING
    //

    /// Query nodes with filters, ordering, and pagination. Filter fields
    /// combine with AND; `None` fields are ignored.
    async fn query_nodes(&self, query: NodeQuery) -> StoreResult<Vec<Node>>;

    /// Get all children of a parent (or root-level nodes for `None`),
    /// ordered by the `before_sibling_id` chain.
    async fn get_children(&self, parent_id: Option<&str>) -> StoreResult<Vec<Node>>;

    //
    // MENTION EDGES
    //

    /// Create a mention edge. Idempotent on duplicates.
    async fn create_mention(&self, source_id: &str, target_id: &str) -> StoreResult<()>;

    /// Delete a mention edge. Idempotent on missing edges.
    async fn delete_mention(&self, source_id: &str, target_id: &str) -> StoreResult<()>;

    /// Target ids this node mentions
    async fn get_outgoing_mentions(&self, node_id: &str) -> StoreResult<Vec<String>>;

    /// Source ids mentioning this node
    async fn get_incoming_mentions(&self, node_id: &str) -> StoreResult<Vec<String>>;

    //
    // EMBEDDINGS
    //

    /// Replace a node's embedding vector
    async fn update_embedding(&self, node_id: &str, embedding: &[f32]) -> StoreResult<()>;

    /// Search nodes by cosine similarity, descending. Scores fall in
    /// [-1.0, 1.0].
    async fn search_by_embedding(
        &self,
        embedding: &[f32],
        limit: usize,
    ) -> StoreResult<Vec<(Node, f32)>>;

    //
    // LIFECYCLE
    //

    /// Flush pending writes and release resources
    async fn close(&self) -> StoreResult<()>;
}
