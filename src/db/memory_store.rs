//! In-Memory Node Store
//!
//! Reference implementation of [`NodeStore`] over process-local maps. Used
//! as the session store in tests and as the executable contract for
//! database-backed implementations: version bumping, duplicate-create
//! detection, atomic cascade delete, and cosine vector search all behave
//! exactly as the trait documents.
//!
//! The store additionally exposes per-operation counters (consumed by the
//! debounce-coalescing tests) and a fault plan for exercising the
//! scheduler's retry and fallback paths.

use crate::db::error::{StoreError, StoreResult};
use crate::db::node_store::{MentionEdge, NodeStore};
use crate::models::{
    order_by_sibling_chain, DeleteResult, Node, NodeOrder, NodeQuery, NodeUpdate,
};
use anyhow::anyhow;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

/// Store operations that can be counted and fault-injected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Create,
    Update,
    Delete,
    DeleteSubtree,
}

/// Snapshot of how many times each operation reached the store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpCounts {
    pub creates: u64,
    pub updates: u64,
    pub deletes: u64,
    pub subtree_deletes: u64,
}

#[derive(Default)]
struct Inner {
    nodes: HashMap<String, Node>,
    /// (source_id, target_id) pairs; BTreeSet keeps mention queries ordered
    edges: BTreeSet<(String, String)>,
    counts: OpCounts,
    /// Remaining injected failures per operation
    faults: HashMap<StoreOp, usize>,
}

/// Process-local [`NodeStore`] implementation
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of node records currently stored
    pub fn node_count(&self) -> usize {
        self.inner.lock().unwrap().nodes.len()
    }

    /// Per-operation call counters (attempts that passed fault injection)
    pub fn op_counts(&self) -> OpCounts {
        self.inner.lock().unwrap().counts.clone()
    }

    /// Make the next `times` calls to `op` fail with a transient backend
    /// error. Used by retry tests.
    pub fn inject_failures(&self, op: StoreOp, times: usize) {
        self.inner.lock().unwrap().faults.insert(op, times);
    }

    /// Remove a record out-of-band, simulating a create that never landed.
    /// Does not touch counters.
    pub fn drop_record(&self, id: &str) {
        self.inner.lock().unwrap().nodes.remove(id);
    }

    fn take_fault(inner: &mut Inner, op: StoreOp) -> StoreResult<()> {
        if let Some(remaining) = inner.faults.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                tracing::debug!(?op, "memory store: injected transient failure");
                return Err(StoreError::Backend(anyhow!(
                    "injected transient failure for {:?}",
                    op
                )));
            }
        }
        Ok(())
    }

    /// Collect a subtree leaf-first with an explicit stack.
    fn collect_subtree(inner: &Inner, root_id: &str) -> Vec<String> {
        let mut children_of: HashMap<&str, Vec<&str>> = HashMap::new();
        for node in inner.nodes.values() {
            if let Some(parent) = &node.parent_id {
                children_of.entry(parent.as_str()).or_default().push(&node.id);
            }
        }

        // Pre-order walk, then reverse for leaf-first order
        let mut preorder = Vec::new();
        let mut stack = vec![root_id];
        while let Some(id) = stack.pop() {
            preorder.push(id.to_string());
            if let Some(children) = children_of.get(id) {
                stack.extend(children.iter().copied());
            }
        }
        preorder.reverse();
        preorder
    }
}

#[async_trait]
impl NodeStore for MemoryStore {
    async fn create_node(&self, node: Node) -> StoreResult<Node> {
        node.validate()
            .map_err(|e| StoreError::constraint_violation(e.to_string()))?;

        let mut inner = self.inner.lock().unwrap();
        Self::take_fault(&mut inner, StoreOp::Create)?;
        inner.counts.creates += 1;

        if inner.nodes.contains_key(&node.id) {
            return Err(StoreError::duplicate_id(&node.id));
        }

        let mut stored = node;
        stored.version = 1;
        inner.nodes.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn get_node(&self, id: &str) -> StoreResult<Option<Node>> {
        Ok(self.inner.lock().unwrap().nodes.get(id).cloned())
    }

    async fn update_node(
        &self,
        id: &str,
        expected_version: i64,
        update: NodeUpdate,
    ) -> StoreResult<Node> {
        let mut inner = self.inner.lock().unwrap();
        Self::take_fault(&mut inner, StoreOp::Update)?;
        inner.counts.updates += 1;

        let node = inner
            .nodes
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found(id))?;

        if node.version != expected_version {
            return Err(StoreError::version_conflict(
                id,
                expected_version,
                node.version,
            ));
        }

        update.apply_to(node);
        node.version += 1;
        Ok(node.clone())
    }

    async fn delete_node(&self, id: &str) -> StoreResult<DeleteResult> {
        let mut inner = self.inner.lock().unwrap();
        Self::take_fault(&mut inner, StoreOp::Delete)?;
        inner.counts.deletes += 1;

        match inner.nodes.remove(id) {
            Some(_) => {
                inner
                    .edges
                    .retain(|(source, target)| source != id && target != id);
                Ok(DeleteResult::removed(1))
            }
            None => Ok(DeleteResult::not_found()),
        }
    }

    async fn delete_subtree_atomic(
        &self,
        root_id: &str,
        edges: Vec<MentionEdge>,
    ) -> StoreResult<usize> {
        let mut inner = self.inner.lock().unwrap();
        Self::take_fault(&mut inner, StoreOp::DeleteSubtree)?;
        inner.counts.subtree_deletes += 1;

        if !inner.nodes.contains_key(root_id) {
            return Ok(0);
        }

        let doomed = Self::collect_subtree(&inner, root_id);

        // Single-mutation-point transaction: everything below either all
        // happens or none of it does.
        for edge in &edges {
            inner
                .edges
                .remove(&(edge.source_id.clone(), edge.target_id.clone()));
        }
        let doomed_set: BTreeSet<&str> = doomed.iter().map(String::as_str).collect();
        inner.edges.retain(|(source, target)| {
            !doomed_set.contains(source.as_str()) && !doomed_set.contains(target.as_str())
        });

        let mut removed = 0;
        for id in &doomed {
            if inner.nodes.remove(id).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn query_nodes(&self, query: NodeQuery) -> StoreResult<Vec<Node>> {
        let inner = self.inner.lock().unwrap();
        let mut results: Vec<Node> = inner
            .nodes
            .values()
            .filter(|node| {
                let Some(filter) = &query.filter else {
                    return true;
                };
                if let Some(node_type) = &filter.node_type {
                    if &node.node_type != node_type {
                        return false;
                    }
                }
                if let Some(parent_id) = &filter.parent_id {
                    if &node.parent_id != parent_id {
                        return false;
                    }
                }
                if let Some(container) = &filter.container_node_id {
                    if node.container_node_id.as_ref() != Some(container) {
                        return false;
                    }
                }
                if let Some(needle) = &filter.content_contains {
                    if !node
                        .content
                        .to_lowercase()
                        .contains(&needle.to_lowercase())
                    {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();

        match query.order_by {
            Some(NodeOrder::ModifiedAt) => {
                results.sort_by(|a, b| a.modified_at.cmp(&b.modified_at))
            }
            Some(NodeOrder::Content) => results.sort_by(|a, b| a.content.cmp(&b.content)),
            _ => results.sort_by(|a, b| a.created_at.cmp(&b.created_at)),
        }

        let offset = query.offset.unwrap_or(0);
        let mut results: Vec<Node> = results.into_iter().skip(offset).collect();
        if let Some(limit) = query.limit {
            results.truncate(limit);
        }
        Ok(results)
    }

    async fn get_children(&self, parent_id: Option<&str>) -> StoreResult<Vec<Node>> {
        let inner = self.inner.lock().unwrap();
        let children: Vec<Node> = inner
            .nodes
            .values()
            .filter(|node| node.parent_id.as_deref() == parent_id)
            .cloned()
            .collect();
        Ok(order_by_sibling_chain(children))
    }

    async fn create_mention(&self, source_id: &str, target_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.nodes.contains_key(source_id) {
            return Err(StoreError::not_found(source_id));
        }
        if !inner.nodes.contains_key(target_id) {
            return Err(StoreError::not_found(target_id));
        }
        inner
            .edges
            .insert((source_id.to_string(), target_id.to_string()));
        Ok(())
    }

    async fn delete_mention(&self, source_id: &str, target_id: &str) -> StoreResult<()> {
        self.inner
            .lock()
            .unwrap()
            .edges
            .remove(&(source_id.to_string(), target_id.to_string()));
        Ok(())
    }

    async fn get_outgoing_mentions(&self, node_id: &str) -> StoreResult<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .edges
            .iter()
            .filter(|(source, _)| source == node_id)
            .map(|(_, target)| target.clone())
            .collect())
    }

    async fn get_incoming_mentions(&self, node_id: &str) -> StoreResult<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .edges
            .iter()
            .filter(|(_, target)| target == node_id)
            .map(|(source, _)| source.clone())
            .collect())
    }

    async fn update_embedding(&self, node_id: &str, embedding: &[f32]) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let node = inner
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| StoreError::not_found(node_id))?;
        node.embedding = Some(embedding.to_vec());
        Ok(())
    }

    async fn search_by_embedding(
        &self,
        embedding: &[f32],
        limit: usize,
    ) -> StoreResult<Vec<(Node, f32)>> {
        let inner = self.inner.lock().unwrap();
        let mut scored: Vec<(Node, f32)> = inner
            .nodes
            .values()
            .filter_map(|node| {
                let candidate = node.embedding.as_deref()?;
                Some((node.clone(), cosine_similarity(embedding, candidate)))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn close(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Cosine similarity in [-1.0, 1.0]; zero-length or mismatched vectors
/// score 0.
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_test::assert_ok;

    fn text_node(content: &str, parent: Option<&str>) -> Node {
        Node::new(
            "text".to_string(),
            content.to_string(),
            parent.map(String::from),
            json!({}),
        )
    }

    #[tokio::test]
    async fn test_create_get_round_trip() {
        let store = MemoryStore::new();
        let node = text_node("hello", None);
        let id = node.id.clone();

        let created = assert_ok!(store.create_node(node.clone()).await);
        let fetched = store.get_node(&id).await.unwrap().unwrap();

        assert_eq!(created, fetched);
        assert_eq!(fetched.content, "hello");
        assert_eq!(fetched.version, 1);
    }

    #[tokio::test]
    async fn test_duplicate_create_conflicts() {
        let store = MemoryStore::new();
        let node = text_node("x", None);
        store.create_node(node.clone()).await.unwrap();

        let result = store.create_node(node).await;
        assert!(matches!(result, Err(StoreError::DuplicateId { .. })));
    }

    #[tokio::test]
    async fn test_update_bumps_version_and_checks_it() {
        let store = MemoryStore::new();
        let node = text_node("v1", None);
        let id = node.id.clone();
        store.create_node(node).await.unwrap();

        let updated = store
            .update_node(&id, 1, NodeUpdate::new().with_content("v2"))
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.content, "v2");

        // Stale version loses
        let result = store
            .update_node(&id, 1, NodeUpdate::new().with_content("v3"))
            .await;
        assert!(matches!(
            result,
            Err(StoreError::VersionConflict {
                expected_version: 1,
                actual_version: 2,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_update_missing_node_is_not_found() {
        let store = MemoryStore::new();
        let result = store
            .update_node("ghost", 1, NodeUpdate::new().with_content("x"))
            .await;
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = MemoryStore::new();
        let node = text_node("x", None);
        let id = node.id.clone();
        store.create_node(node).await.unwrap();

        assert_eq!(store.delete_node(&id).await.unwrap().deleted_count, 1);
        assert_eq!(store.delete_node(&id).await.unwrap().deleted_count, 0);
        assert_eq!(store.delete_subtree_atomic("ghost", vec![]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_subtree_removes_descendants_and_edges() {
        let store = MemoryStore::new();
        let root = text_node("root", None);
        let child = text_node("child", Some(&root.id));
        let grandchild = text_node("grandchild", Some(&child.id));
        let outsider = text_node("outsider", None);

        for node in [&root, &child, &grandchild, &outsider] {
            store.create_node((*node).clone()).await.unwrap();
        }
        store
            .create_mention(&outsider.id, &grandchild.id)
            .await
            .unwrap();

        let removed = store
            .delete_subtree_atomic(
                &root.id,
                vec![MentionEdge::new(&outsider.id, &grandchild.id)],
            )
            .await
            .unwrap();

        assert_eq!(removed, 3);
        assert!(store.get_node(&outsider.id).await.unwrap().is_some());
        assert!(store.get_node(&grandchild.id).await.unwrap().is_none());
        assert!(store
            .get_outgoing_mentions(&outsider.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_injected_failure_leaves_store_unchanged() {
        let store = MemoryStore::new();
        let root = text_node("root", None);
        let child = text_node("child", Some(&root.id));
        store.create_node(root.clone()).await.unwrap();
        store.create_node(child.clone()).await.unwrap();

        store.inject_failures(StoreOp::DeleteSubtree, 1);
        let result = store.delete_subtree_atomic(&root.id, vec![]).await;
        assert!(result.is_err());
        assert_eq!(store.node_count(), 2);

        // Next attempt succeeds
        assert_eq!(
            store.delete_subtree_atomic(&root.id, vec![]).await.unwrap(),
            2
        );
        assert_eq!(store.node_count(), 0);
    }

    #[tokio::test]
    async fn test_get_children_follows_sibling_chain() {
        let store = MemoryStore::new();
        let parent = text_node("parent", None);
        let a = text_node("a", Some(&parent.id));
        let mut b = text_node("b", Some(&parent.id));
        b.before_sibling_id = Some(a.id.clone());

        for node in [&parent, &b, &a] {
            store.create_node((*node).clone()).await.unwrap();
        }

        let children = store.get_children(Some(&parent.id)).await.unwrap();
        let contents: Vec<&str> = children.iter().map(|n| n.content.as_str()).collect();
        assert_eq!(contents, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_embedding_search_orders_by_similarity() {
        let store = MemoryStore::new();
        let close = text_node("close", None);
        let far = text_node("far", None);
        store.create_node(close.clone()).await.unwrap();
        store.create_node(far.clone()).await.unwrap();

        store
            .update_embedding(&close.id, &[1.0, 0.0, 0.0])
            .await
            .unwrap();
        store
            .update_embedding(&far.id, &[0.0, 1.0, 0.0])
            .await
            .unwrap();

        let results = store
            .search_by_embedding(&[0.9, 0.1, 0.0], 10)
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0.id, close.id);
        assert!(results[0].1 > results[1].1);
        assert!(results[0].1 <= 1.0 && results[1].1 >= -1.0);
    }

    #[tokio::test]
    async fn test_query_filters_and_paginates() {
        let store = MemoryStore::new();
        for i in 0..5 {
            let mut node = text_node(&format!("note {i}"), None);
            node.node_type = if i % 2 == 0 { "task" } else { "text" }.to_string();
            store.create_node(node).await.unwrap();
        }

        let tasks = store
            .query_nodes(NodeQuery {
                filter: Some(crate::models::NodeFilter {
                    node_type: Some("task".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(tasks.len(), 3);

        let page = store
            .query_nodes(NodeQuery {
                limit: Some(2),
                offset: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
    }
}
