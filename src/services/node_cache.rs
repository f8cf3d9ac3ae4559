//! Node Graph Cache
//!
//! The in-memory authoritative working copy of every loaded node: the
//! single source of truth for reads during a session. Mutations are
//! synchronous - subscribers are notified of the new value before any
//! backing-store I/O happens, so UI feedback is never delayed by pending
//! writes.
//!
//! The cache never decides persistence itself. Every mutating call
//! forwards a [`WriteRequest`] to the wired [`WriteSink`] (the write
//! scheduler) unless explicitly skipped; the scheduler owns debounce,
//! ordering, and the CREATE-vs-UPDATE decision.

use crate::db::{ChangeSource, DomainEvent};
use crate::models::{order_by_sibling_chain, LifecycleState, Node, NodeUpdate};
use crate::services::error::{EngineError, EngineResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use tokio::sync::broadcast;

/// Broadcast channel capacity for domain events.
///
/// 128 provides headroom for burst operations (bulk loads, cascade
/// deletes) while limiting memory overhead. Observer lag is acceptable -
/// subscribers track current state, not history.
const DOMAIN_EVENT_CHANNEL_CAPACITY: usize = 128;

/// A change scheduled for persistence
#[derive(Debug, Clone)]
pub struct WriteRequest {
    /// Target node id
    pub id: String,
    /// Accumulated field changes to persist
    pub update: NodeUpdate,
    /// Node ids whose writes must durably complete before this one may be
    /// dispatched (only honored while a dependency has never persisted)
    pub deps: Vec<String>,
    /// Structural changes bypass the debounce window
    pub structural: bool,
}

impl WriteRequest {
    /// Request carrying every persistable field of `node`, used when a
    /// whole node enters the pipeline at once.
    pub fn full(node: &Node) -> Self {
        Self {
            id: node.id.clone(),
            update: NodeUpdate {
                node_type: Some(node.node_type.clone()),
                content: Some(node.content.clone()),
                parent_id: Some(node.parent_id.clone()),
                container_node_id: Some(node.container_node_id.clone()),
                before_sibling_id: Some(node.before_sibling_id.clone()),
                properties: Some(node.properties.clone()),
                mentions: Some(node.mentions.clone()),
            },
            deps: Vec::new(),
            structural: false,
        }
    }
}

/// Receiver of scheduled writes. Implemented by the write scheduler;
/// the seam keeps the cache free of scheduling policy.
pub trait WriteSink: Send + Sync {
    fn submit(&self, request: WriteRequest);
}

/// In-memory node graph cache
pub struct NodeCache {
    nodes: RwLock<HashMap<String, Node>>,
    events: broadcast::Sender<DomainEvent>,
    dirty: AtomicU64,
    sink: OnceLock<Arc<dyn WriteSink>>,
}

impl Default for NodeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeCache {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(DOMAIN_EVENT_CHANNEL_CAPACITY);
        Self {
            nodes: RwLock::new(HashMap::new()),
            events,
            dirty: AtomicU64::new(0),
            sink: OnceLock::new(),
        }
    }

    /// Wire the write scheduler. Must be called once during engine
    /// construction, before any non-skipped mutation.
    pub fn wire_sink(&self, sink: Arc<dyn WriteSink>) {
        let _ = self.sink.set(sink);
    }

    /// Subscribe to cache mutation events
    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.events.subscribe()
    }

    /// Get a node by id
    pub fn get(&self, id: &str) -> Option<Node> {
        self.nodes.read().unwrap().get(id).cloned()
    }

    /// Whether the cache holds a node with this id
    pub fn contains(&self, id: &str) -> bool {
        self.nodes.read().unwrap().contains_key(id)
    }

    /// Number of loaded nodes
    pub fn len(&self) -> usize {
        self.nodes.read().unwrap().len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.read().unwrap().is_empty()
    }

    /// Every loaded node, in no particular order
    pub fn snapshot(&self) -> Vec<Node> {
        self.nodes.read().unwrap().values().cloned().collect()
    }

    /// Children of `parent_id` (or root-level nodes for `None`), ordered
    /// by the sibling chain
    pub fn children(&self, parent_id: Option<&str>) -> Vec<Node> {
        let children: Vec<Node> = self
            .nodes
            .read()
            .unwrap()
            .values()
            .filter(|node| node.parent_id.as_deref() == parent_id)
            .cloned()
            .collect();
        order_by_sibling_chain(children)
    }

    /// The sibling immediately after `id` in its chain, if any
    pub fn next_sibling(&self, id: &str, parent_id: Option<&str>) -> Option<Node> {
        self.nodes
            .read()
            .unwrap()
            .values()
            .find(|node| {
                node.parent_id.as_deref() == parent_id
                    && node.before_sibling_id.as_deref() == Some(id)
            })
            .cloned()
    }

    /// Count of set/apply calls since construction. Tests assert on this
    /// to prove write scheduling occurred.
    pub fn dirty_count(&self) -> u64 {
        self.dirty.load(Ordering::Relaxed)
    }

    /// Insert or overwrite a node.
    ///
    /// Subscribers are always notified synchronously; the change is
    /// forwarded to the write scheduler unless `skip_write` is set (the
    /// initial empty-viewer placeholder is the only expected skipper).
    pub fn set(&self, node: Node, skip_write: bool) {
        {
            let mut nodes = self.nodes.write().unwrap();
            nodes.insert(node.id.clone(), node.clone());
        }
        self.dirty.fetch_add(1, Ordering::Relaxed);

        let source = if skip_write {
            ChangeSource::Load
        } else {
            ChangeSource::User
        };
        self.emit(DomainEvent::NodeUpserted {
            node: node.clone(),
            source,
        });

        if !skip_write {
            self.forward(WriteRequest::full(&node));
        }
    }

    /// Merge a partial change into an existing node and schedule its
    /// write.
    pub fn apply(
        &self,
        id: &str,
        update: NodeUpdate,
        source: ChangeSource,
    ) -> EngineResult<Node> {
        self.apply_with_deps(id, update, source, Vec::new())
    }

    /// [`NodeCache::apply`] with explicit write dependencies, used by the
    /// hierarchy engine when a splice must wait for a freshly created
    /// parent to persist.
    pub fn apply_with_deps(
        &self,
        id: &str,
        update: NodeUpdate,
        source: ChangeSource,
        deps: Vec<String>,
    ) -> EngineResult<Node> {
        let structural = update.is_structural();
        let node = {
            let mut nodes = self.nodes.write().unwrap();
            let node = nodes
                .get_mut(id)
                .ok_or_else(|| EngineError::node_not_found(id))?;
            update.apply_to(node);
            node.lifecycle = LifecycleState::WritePending;
            node.clone()
        };
        self.dirty.fetch_add(1, Ordering::Relaxed);

        self.emit(DomainEvent::NodeUpserted {
            node: node.clone(),
            source,
        });
        self.forward(WriteRequest {
            id: id.to_string(),
            update,
            deps,
            structural,
        });
        Ok(node)
    }

    /// Remove a node from the cache only. Persistence-side removal is the
    /// hierarchy engine's job.
    pub fn remove(&self, id: &str) -> Option<Node> {
        let removed = self.nodes.write().unwrap().remove(id);
        if removed.is_some() {
            self.emit(DomainEvent::NodeRemoved { id: id.to_string() });
        }
        removed
    }

    /// Scheduler hook: update a node's lifecycle without rescheduling
    pub fn mark_lifecycle(&self, id: &str, state: LifecycleState) {
        let changed = {
            let mut nodes = self.nodes.write().unwrap();
            match nodes.get_mut(id) {
                Some(node) if node.lifecycle != state => {
                    node.lifecycle = state;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.emit(DomainEvent::LifecycleChanged {
                id: id.to_string(),
                state,
            });
        }
    }

    /// Scheduler hook: record a durably completed write.
    ///
    /// Sets `ever_persisted` (never reset afterwards) and the
    /// store-assigned version. Content is left untouched - later edits
    /// layered on top of the completed write are preserved.
    pub fn mark_persisted(&self, id: &str, version: i64) {
        let found = {
            let mut nodes = self.nodes.write().unwrap();
            match nodes.get_mut(id) {
                Some(node) => {
                    node.ever_persisted = true;
                    node.version = version;
                    node.lifecycle = LifecycleState::Saved;
                    true
                }
                None => false,
            }
        };
        if found {
            self.emit(DomainEvent::LifecycleChanged {
                id: id.to_string(),
                state: LifecycleState::Saved,
            });
        }
    }

    /// Whether the node has ever been persisted (`None` if unknown id)
    pub fn ever_persisted(&self, id: &str) -> Option<bool> {
        self.nodes.read().unwrap().get(id).map(|n| n.ever_persisted)
    }

    /// Broadcast a mention-edge addition
    pub fn emit_mention_added(&self, source_id: &str, target_id: &str) {
        self.emit(DomainEvent::MentionAdded {
            source_id: source_id.to_string(),
            target_id: target_id.to_string(),
        });
    }

    /// Broadcast a mention-edge removal
    pub fn emit_mention_removed(&self, source_id: &str, target_id: &str) {
        self.emit(DomainEvent::MentionRemoved {
            source_id: source_id.to_string(),
            target_id: target_id.to_string(),
        });
    }

    fn emit(&self, event: DomainEvent) {
        // No receivers is fine; nothing is listening yet
        let _ = self.events.send(event);
    }

    fn forward(&self, request: WriteRequest) {
        match self.sink.get() {
            Some(sink) => sink.submit(request),
            None => tracing::warn!(
                id = %request.id,
                "write dropped: no scheduler wired to the cache"
            ),
        }
    }
}
