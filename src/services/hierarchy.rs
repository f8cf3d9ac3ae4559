//! Hierarchy Integrity Engine
//!
//! Compound structural operations (move/reparent, sibling reorder,
//! cascading delete) expressed as ordered sequences of primitive writes
//! routed through the write scheduler.
//!
//! # Sibling chains
//!
//! Siblings form an intrusive singly-linked list through
//! `before_sibling_id` (predecessor pointers). Every move is two splices:
//!
//! 1. **Splice out**: the old next sibling's pointer is repaired to the
//!    moved node's old predecessor
//! 2. **Splice in**: the moved node takes its new pointers and the new
//!    next sibling's pointer is repaired to the moved node
//!
//! The two splices are independent primitive writes and declare no
//! dependency on each other - chaining them is what produced the
//! circular-wait failure mode in fast consecutive indents. The moved
//! node's write depends only on a freshly created (never persisted) new
//! parent.

use crate::db::{ChangeSource, NodeStore};
use crate::models::{DeleteResult, Node, NodeUpdate};
use crate::services::error::{EngineError, EngineResult};
use crate::services::mention_index::MentionIndex;
use crate::services::node_cache::NodeCache;
use crate::services::write_scheduler::WriteScheduler;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Maximum supported hierarchy depth for cascading operations
pub const MAX_HIERARCHY_DEPTH: usize = 1_000;

/// Where to place a node among its new siblings
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertPosition {
    /// First child (no predecessor)
    First,
    /// Immediately after the named sibling
    After(String),
    /// Last child
    Last,
}

/// Structural operation engine
pub struct HierarchyEngine {
    cache: Arc<NodeCache>,
    scheduler: Arc<WriteScheduler>,
    mentions: Arc<MentionIndex>,
    store: Arc<dyn NodeStore>,
}

impl HierarchyEngine {
    pub fn new(
        cache: Arc<NodeCache>,
        scheduler: Arc<WriteScheduler>,
        mentions: Arc<MentionIndex>,
        store: Arc<dyn NodeStore>,
    ) -> Self {
        Self {
            cache,
            scheduler,
            mentions,
            store,
        }
    }

    /// Move a node under a new parent at the requested position.
    ///
    /// Both affected sibling chains are repaired synchronously in the
    /// cache; the resulting writes dispatch immediately (structural
    /// changes bypass the debounce window).
    pub fn move_node(
        &self,
        id: &str,
        new_parent_id: Option<&str>,
        position: InsertPosition,
    ) -> EngineResult<()> {
        let node = self
            .cache
            .get(id)
            .ok_or_else(|| EngineError::node_not_found(id))?;

        if new_parent_id == Some(id) {
            return Err(EngineError::invalid_operation(
                "node cannot become its own parent",
            ));
        }
        if let InsertPosition::After(sibling) = &position {
            if sibling == id {
                return Err(EngineError::invalid_operation(
                    "node cannot be placed after itself",
                ));
            }
        }

        let new_parent = match new_parent_id {
            Some(parent_id) => {
                let parent = self
                    .cache
                    .get(parent_id)
                    .ok_or_else(|| EngineError::node_not_found(parent_id))?;
                self.ensure_not_descendant(id, parent_id)?;
                Some(parent)
            }
            None => None,
        };

        // Resolve the target slot among the new siblings (the moved node
        // itself excluded so in-parent reorders resolve cleanly)
        let siblings: Vec<Node> = self
            .cache
            .children(new_parent_id)
            .into_iter()
            .filter(|n| n.id != id)
            .collect();
        let (new_before, new_next) = match &position {
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

        let same_parent = node.parent_id.as_deref() == new_parent_id;
        if same_parent && node.before_sibling_id == new_before {
            return Ok(());
        }

        let new_container = match &new_parent {
            Some(parent) => parent
                .container_node_id
                .clone()
                .or_else(|| Some(parent.id.clone())),
            None => None,
        };

        // Splice out: repair the old chain around the departing node
        if let Some(old_next) = self.cache.next_sibling(id, node.parent_id.as_deref()) {
            let mut repair = NodeUpdate::new();
            repair.before_sibling_id = Some(node.before_sibling_id.clone());
            self.cache
                .apply(&old_next.id, repair, ChangeSource::Hierarchy)?;
        }

        // Splice in: the moved node's write waits for a brand-new parent
        // to persist first, and for nothing else
        let deps = match &new_parent {
            Some(parent) if !parent.ever_persisted => vec![parent.id.clone()],
            _ => Vec::new(),
        };
        let mut update = NodeUpdate::new();
        update.parent_id = Some(new_parent_id.map(String::from));
        update.container_node_id = Some(new_container.clone());
        update.before_sibling_id = Some(new_before);
        self.cache
            .apply_with_deps(id, update, ChangeSource::Hierarchy, deps)?;

        if let Some(new_next) = new_next {
            let mut repair = NodeUpdate::new();
            repair.before_sibling_id = Some(Some(id.to_string()));
            self.cache
                .apply(&new_next.id, repair, ChangeSource::Hierarchy)?;
        }

        if !same_parent && new_container != node.container_node_id {
            self.recalculate_containers(id, new_container)?;
        }

        Ok(())
    }

    /// Reorder a node among its current siblings
    pub fn reorder_node(&self, id: &str, position: InsertPosition) -> EngineResult<()> {
        let node = self
            .cache
            .get(id)
            .ok_or_else(|| EngineError::node_not_found(id))?;
        self.move_node(id, node.parent_id.as_deref(), position)
    }

    /// Delete a node and its entire subtree.
    ///
    /// Descendants are collected leaf-first with an explicit stack (the
    /// depth ceiling is checked before any mutation), pending writes for
    /// the doomed set are abandoned, every mention edge touching the set
    /// is purged, and the store removes the subtree in one atomic
    /// transaction. A missing id succeeds silently.
    pub async fn delete_subtree(&self, id: &str) -> EngineResult<DeleteResult> {
        let Some(node) = self.cache.get(id) else {
            // Not loaded this session; still honor idempotent delete of
            // whatever the store may hold
            let removed = self.store.delete_subtree_atomic(id, Vec::new()).await?;
            return Ok(DeleteResult::removed(removed));
        };

        let doomed = self.collect_subtree(id)?;
        let doomed_set: HashSet<String> = doomed.iter().cloned().collect();

        let edges = self.mentions.edges_touching(&doomed_set);

        let persisted: Vec<&String> = doomed
            .iter()
            .filter(|d| self.cache.ever_persisted(d) == Some(true))
            .collect();

        let store_removed = if node.ever_persisted {
            self.store
                .delete_subtree_atomic(id, edges)
                .await
                .map_err(EngineError::from)?
        } else if persisted.is_empty() {
            // Pure in-memory undo: nothing ever reached the store
            0
        } else {
            // The root never persisted but some descendants did (they were
            // persisted before being moved in); remove them individually
            let mut removed = 0;
            for doomed_id in persisted {
                removed += self.store.delete_node(doomed_id).await?.deleted_count;
            }
            for edge in edges {
                self.store
                    .delete_mention(&edge.source_id, &edge.target_id)
                    .await?;
            }
            removed
        };

        // Store transaction committed; now reflect it in memory. Pending
        // writes for the doomed set are released only after the commit so
        // a failed delete never silently drops coalesced edits.
        for doomed_id in &doomed {
            self.scheduler.abandon(doomed_id);
        }
        if let Some(next) = self.cache.next_sibling(id, node.parent_id.as_deref()) {
            let mut repair = NodeUpdate::new();
            repair.before_sibling_id = Some(node.before_sibling_id.clone());
            self.cache
                .apply(&next.id, repair, ChangeSource::Hierarchy)?;
        }
        let removed_edges = self.mentions.purge(&doomed_set);
        let mut cache_removed = 0;
        for doomed_id in &doomed {
            if self.cache.remove(doomed_id).is_some() {
                cache_removed += 1;
            }
        }

        // Surviving sources must not keep pointing at deleted targets;
        // their mention lists are rewritten and persisted like any edit
        let mut stale: HashMap<String, HashSet<String>> = HashMap::new();
        for edge in &removed_edges {
            if !doomed_set.contains(&edge.source_id) && doomed_set.contains(&edge.target_id) {
                stale
                    .entry(edge.source_id.clone())
                    .or_default()
                    .insert(edge.target_id.clone());
            }
        }
        for (source_id, targets) in stale {
            if let Some(source) = self.cache.get(&source_id) {
                let mentions: Vec<String> = source
                    .mentions
                    .into_iter()
                    .filter(|m| !targets.contains(m))
                    .collect();
                let mut update = NodeUpdate::new();
                update.mentions = Some(mentions);
                self.cache
                    .apply(&source_id, update, ChangeSource::Hierarchy)?;
            }
        }

        tracing::debug!(
            id,
            cache_removed,
            store_removed,
            "subtree deleted"
        );
        Ok(DeleteResult::removed(cache_removed.max(store_removed)))
    }

    /// Collect `root` and all descendants, leaf-first, with an explicit
    /// stack. Fails before any mutation if the subtree exceeds the depth
    /// ceiling.
    fn collect_subtree(&self, root: &str) -> EngineResult<Vec<String>> {
        let mut preorder: Vec<String> = Vec::new();
        let mut stack: Vec<(String, usize)> = vec![(root.to_string(), 1)];
        let mut seen: HashSet<String> = HashSet::new();

        while let Some((id, depth)) = stack.pop() {
            if depth > MAX_HIERARCHY_DEPTH {
                return Err(EngineError::RecursionLimitExceeded {
                    depth,
                    limit: MAX_HIERARCHY_DEPTH,
                });
            }
            if !seen.insert(id.clone()) {
                // A cycle in parent pointers would otherwise loop forever
                return Err(EngineError::circular_reference(format!(
                    "node {id} reachable twice while collecting subtree"
                )));
            }
            for child in self.cache.children(Some(&id)) {
                stack.push((child.id, depth + 1));
            }
            preorder.push(id);
        }

        preorder.reverse();
        Ok(preorder)
    }

    /// Walk the parent chain from `candidate` and reject if it passes
    /// through `id`.
    fn ensure_not_descendant(&self, id: &str, candidate: &str) -> EngineResult<()> {
        let mut current = Some(candidate.to_string());
        let mut hops = 0;
        while let Some(current_id) = current {
            if current_id == id {
                return Err(EngineError::circular_reference(format!(
                    "cannot move {id} under its own descendant {candidate}"
                )));
            }
            hops += 1;
            if hops > MAX_HIERARCHY_DEPTH {
                return Err(EngineError::RecursionLimitExceeded {
                    depth: hops,
                    limit: MAX_HIERARCHY_DEPTH,
                });
            }
            current = self.cache.get(&current_id).and_then(|n| n.parent_id);
        }
        Ok(())
    }

    /// Propagate a container change through the moved subtree
    fn recalculate_containers(
        &self,
        root: &str,
        container: Option<String>,
    ) -> EngineResult<()> {
        let mut stack: Vec<String> = self
            .cache
            .children(Some(root))
            .into_iter()
            .map(|n| n.id)
            .collect();
        let mut seen: HashSet<String> = HashSet::new();

        while let Some(id) = stack.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            let mut update = NodeUpdate::new();
            update.container_node_id = Some(container.clone());
            self.cache.apply(&id, update, ChangeSource::Hierarchy)?;
            stack.extend(self.cache.children(Some(&id)).into_iter().map(|n| n.id));
        }
        Ok(())
    }
}
