//! Node Engine Facade
//!
//! The single entry point callers construct: wires the cache to the write
//! scheduler, owns the hierarchy engine and mention index, and exposes the
//! operation surface (create, edit, move, reorder, delete, reference
//! management). All collaborators are dependency-injected; nothing in the
//! crate reaches for a global.

use crate::db::{ChangeSource, DomainEvent, NodeStore};
use crate::models::{DeleteResult, Node, NodeQuery, NodeUpdate};
use crate::services::error::{EngineError, EngineResult};
use crate::services::hierarchy::{HierarchyEngine, InsertPosition};
use crate::services::mention_index::MentionIndex;
use crate::services::node_cache::NodeCache;
use crate::services::write_scheduler::{SchedulerConfig, WriteOutcome, WriteScheduler};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Parameters for creating a new node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNodeParams {
    /// Node type (e.g., "text", "task", "date")
    pub node_type: String,
    /// Initial content
    pub content: String,
    /// Parent node (None for root-level)
    pub parent_id: Option<String>,
    /// Type-specific metadata; defaults to an empty object
    #[serde(default)]
    pub properties: Option<serde_json::Value>,
    /// Where to place the node among its siblings
    #[serde(skip)]
    pub position: Option<InsertPosition>,
}

impl CreateNodeParams {
    pub fn new(node_type: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            node_type: node_type.into(),
            content: content.into(),
            parent_id: None,
            properties: None,
            position: None,
        }
    }

    pub fn under(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn at(mut self, position: InsertPosition) -> Self {
        self.position = Some(position);
        self
    }
}

/// Coordination engine over cache, scheduler, hierarchy, and store
pub struct NodeEngine {
    cache: Arc<NodeCache>,
    scheduler: Arc<WriteScheduler>,
    hierarchy: HierarchyEngine,
    mentions: Arc<MentionIndex>,
    store: Arc<dyn NodeStore>,
}

impl NodeEngine {
    /// Build an engine over `store` with default scheduler tuning
    pub fn new(store: Arc<dyn NodeStore>) -> Self {
        Self::with_config(store, SchedulerConfig::default())
    }

    /// Build an engine with explicit scheduler tuning
    pub fn with_config(store: Arc<dyn NodeStore>, config: SchedulerConfig) -> Self {
        let cache = Arc::new(NodeCache::new());
        let scheduler = WriteScheduler::new(cache.clone(), store.clone(), config);
        cache.wire_sink(scheduler.clone());
        let mentions = Arc::new(MentionIndex::new());
        let hierarchy = HierarchyEngine::new(
            cache.clone(),
            scheduler.clone(),
            mentions.clone(),
            store.clone(),
        );
        Self {
            cache,
            scheduler,
            hierarchy,
            mentions,
            store,
        }
    }

    /// The shared node cache (read surface for UI layers)
    pub fn cache(&self) -> &Arc<NodeCache> {
        &self.cache
    }

    /// Subscribe to cache mutation and lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.cache.subscribe()
    }

    /// Subscribe to terminal write outcomes
    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<WriteOutcome> {
        self.scheduler.subscribe_outcomes()
    }

    /// Create a node and schedule its first persistence.
    ///
    /// The node is visible in the cache immediately. If the parent exists
    /// but has never persisted, the create is parked until the parent
    /// lands. Returns the new node's id.
    pub fn create_node(&self, params: CreateNodeParams) -> EngineResult<String> {
        let properties = params.properties.unwrap_or_else(|| json!({}));
        let container = match &params.parent_id {
            Some(parent_id) => {
                let parent = self
                    .cache
                    .get(parent_id)
                    .ok_or_else(|| EngineError::node_not_found(parent_id))?;
                parent.container_node_id.or(Some(parent.id))
            }
            None => None,
        };
        let mut node = Node::new_in_container(
            params.node_type,
            params.content,
            params.parent_id.clone(),
            container,
            properties,
        );
        node.validate()?;

        // Resolve the sibling slot before the node enters the cache
        let siblings = self.cache.children(params.parent_id.as_deref());
        let position = params.position.unwrap_or(InsertPosition::Last);
        let (before, next) = match &position {
            InsertPosition::First => (None, siblings.first().cloned()),
            InsertPosition::Last => (siblings.last().map(|n| n.id.clone()), None),
            InsertPosition::After(sibling_id) => {
                let index = siblings
                    .iter()
                    .position(|n| &n.id == sibling_id)
                    .ok_or_else(|| {
                        EngineError::invalid_operation(format!(
                            "{sibling_id} is not a child of the target parent"
                        ))
                    })?;
                (Some(sibling_id.clone()), siblings.get(index + 1).cloned())
            }
        };
        node.before_sibling_id = before;
        let id = node.id.clone();

        let deps = match &params.parent_id {
            Some(parent_id) if self.cache.ever_persisted(parent_id) == Some(false) => {
                vec![parent_id.clone()]
            }
            _ => Vec::new(),
        };

        if deps.is_empty() {
            self.cache.set(node, false);
        } else {
            // Enter the cache without scheduling, then schedule with the
            // parent dependency attached
            self.cache.set(node.clone(), true);
            let mut request = crate::services::node_cache::WriteRequest::full(&node);
            request.deps = deps;
            request.structural = true;
            self.scheduler.submit_request(request);
        }

        if let Some(next) = next {
            let mut repair = NodeUpdate::new();
            repair.before_sibling_id = Some(Some(id.clone()));
            self.cache
                .apply(&next.id, repair, ChangeSource::Hierarchy)?;
        }

        tracing::debug!(id, "node created");
        Ok(id)
    }

    /// Load an already-persisted node into the cache without scheduling a
    /// write (session warm-up).
    pub fn load_node(&self, mut node: Node) {
        node.ever_persisted = true;
        node.lifecycle = crate::models::LifecycleState::Saved;
        self.cache.set(node, true);
    }

    /// Get a node from the cache
    pub fn get_node(&self, id: &str) -> Option<Node> {
        self.cache.get(id)
    }

    /// Ordered children of a parent (or root-level nodes)
    pub fn children(&self, parent_id: Option<&str>) -> Vec<Node> {
        self.cache.children(parent_id)
    }

    /// Apply a partial update to a node and schedule its write
    pub fn update_node(&self, id: &str, update: NodeUpdate) -> EngineResult<Node> {
        self.upsert(id, update, ChangeSource::User)
    }

    /// [`NodeEngine::update_node`] with an explicit change source, so
    /// subscribers can tell user edits from engine-internal mutations
    pub fn upsert(
        &self,
        id: &str,
        update: NodeUpdate,
        source: ChangeSource,
    ) -> EngineResult<Node> {
        self.cache.apply(id, update, source)
    }

    /// Move a node under a new parent at the requested position
    pub fn move_node(
        &self,
        id: &str,
        new_parent_id: Option<&str>,
        position: InsertPosition,
    ) -> EngineResult<()> {
        self.hierarchy.move_node(id, new_parent_id, position)
    }

    /// Reorder a node among its current siblings
    pub fn reorder_node(&self, id: &str, position: InsertPosition) -> EngineResult<()> {
        self.hierarchy.reorder_node(id, position)
    }

    /// Delete a node and its subtree (idempotent)
    pub async fn delete_subtree(&self, id: &str) -> EngineResult<DeleteResult> {
        self.hierarchy.delete_subtree(id).await
    }

    /// Record a mention edge in the index, the source node's mention list,
    /// and the store.
    pub async fn add_reference(&self, source_id: &str, target_id: &str) -> EngineResult<()> {
        if source_id == target_id {
            return Err(EngineError::invalid_operation(
                "node cannot reference itself",
            ));
        }
        let source = self
            .cache
            .get(source_id)
            .ok_or_else(|| EngineError::node_not_found(source_id))?;
        if !self.cache.contains(target_id) {
            return Err(EngineError::node_not_found(target_id));
        }

        if !self.mentions.add_reference(source_id, target_id) {
            return Ok(());
        }
        let mut mentions = source.mentions.clone();
        if !mentions.iter().any(|m| m == target_id) {
            mentions.push(target_id.to_string());
            let mut update = NodeUpdate::new();
            update.mentions = Some(mentions);
            self.cache.apply(source_id, update, ChangeSource::User)?;
        }

        // Edge rows require both endpoints; defer to the scheduler's own
        // ordering by waiting for the nodes to land first
        self.scheduler.flush_node(source_id).await;
        self.scheduler.flush_node(target_id).await;
        self.store.create_mention(source_id, target_id).await?;
        self.cache.emit_mention_added(source_id, target_id);
        Ok(())
    }

    /// Remove a mention edge from the index, the source node, and the
    /// store. Idempotent.
    pub async fn remove_reference(&self, source_id: &str, target_id: &str) -> EngineResult<()> {
        let existed = self.mentions.remove_reference(source_id, target_id);

        if let Some(source) = self.cache.get(source_id) {
            if source.mentions.iter().any(|m| m == target_id) {
                let mentions: Vec<String> = source
                    .mentions
                    .into_iter()
                    .filter(|m| m != target_id)
                    .collect();
                let mut update = NodeUpdate::new();
                update.mentions = Some(mentions);
                self.cache.apply(source_id, update, ChangeSource::User)?;
            }
        }

        self.store.delete_mention(source_id, target_id).await?;
        if existed {
            self.cache.emit_mention_removed(source_id, target_id);
        }
        Ok(())
    }

    /// Ids this node references
    pub fn outgoing_references(&self, id: &str) -> Vec<String> {
        self.mentions.outgoing(id)
    }

    /// Ids referencing this node
    pub fn incoming_references(&self, id: &str) -> Vec<String> {
        self.mentions.incoming(id)
    }

    /// Query persisted nodes directly from the store
    pub async fn query_nodes(&self, query: NodeQuery) -> EngineResult<Vec<Node>> {
        Ok(self.store.query_nodes(query).await?)
    }

    /// Semantic search over stored embeddings
    pub async fn search_by_embedding(
        &self,
        embedding: &[f32],
        limit: usize,
    ) -> EngineResult<Vec<(Node, f32)>> {
        Ok(self.store.search_by_embedding(embedding, limit).await?)
    }

    /// Wait for every scheduled write to reach a terminal state
    pub async fn flush(&self) {
        self.scheduler.flush().await;
    }

    /// Count of cache mutations since construction
    pub fn dirty_count(&self) -> u64 {
        self.cache.dirty_count()
    }

    /// Flush writes and close the store
    pub async fn shutdown(&self) -> EngineResult<()> {
        self.scheduler.flush().await;
        self.store.close().await?;
        Ok(())
    }
}
