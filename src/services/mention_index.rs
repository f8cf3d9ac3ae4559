//! Mention Graph Index
//!
//! Bidirectional lookup between outgoing and incoming reference edges,
//! backing "what references this node" queries. The index is purely
//! in-memory; the store keeps its own edge records, and the hierarchy
//! engine consults this index during cascading delete to purge every edge
//! touching a doomed subtree before the nodes themselves are removed.
//!
//! Both directions use ordered sets so `outgoing`/`incoming` return
//! deterministic id order.

use crate::db::MentionEdge;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::RwLock;

#[derive(Default)]
struct Directions {
    outgoing: BTreeMap<String, BTreeSet<String>>,
    incoming: BTreeMap<String, BTreeSet<String>>,
}

/// In-memory bidirectional mention index
#[derive(Default)]
pub struct MentionIndex {
    inner: RwLock<Directions>,
}

impl MentionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `source_id` references `target_id`. Idempotent; returns
    /// true if the edge was new. Self-references are ignored.
    pub fn add_reference(&self, source_id: &str, target_id: &str) -> bool {
        if source_id == target_id {
            return false;
        }
        let mut inner = self.inner.write().unwrap();
        let added = inner
            .outgoing
            .entry(source_id.to_string())
            .or_default()
            .insert(target_id.to_string());
        inner
            .incoming
            .entry(target_id.to_string())
            .or_default()
            .insert(source_id.to_string());
        added
    }

    /// Remove a reference edge. Idempotent; returns true if the edge
    /// existed.
    pub fn remove_reference(&self, source_id: &str, target_id: &str) -> bool {
        let mut inner = self.inner.write().unwrap();
        let removed = inner
            .outgoing
            .get_mut(source_id)
            .map(|targets| targets.remove(target_id))
            .unwrap_or(false);
        if let Some(sources) = inner.incoming.get_mut(target_id) {
            sources.remove(source_id);
        }
        removed
    }

    /// Ordered set of ids this node references
    pub fn outgoing(&self, node_id: &str) -> Vec<String> {
        self.inner
            .read()
            .unwrap()
            .outgoing
            .get(node_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Ordered set of ids referencing this node
    pub fn incoming(&self, node_id: &str) -> Vec<String> {
        self.inner
            .read()
            .unwrap()
            .incoming
            .get(node_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every edge where either endpoint is in `ids`
    pub fn edges_touching(&self, ids: &HashSet<String>) -> Vec<MentionEdge> {
        let inner = self.inner.read().unwrap();
        let mut edges = Vec::new();
        for (source, targets) in &inner.outgoing {
            for target in targets {
                if ids.contains(source) || ids.contains(target) {
                    edges.push(MentionEdge::new(source, target));
                }
            }
        }
        edges
    }

    /// Drop every edge touching `ids`, returning the removed edges
    pub fn purge(&self, ids: &HashSet<String>) -> Vec<MentionEdge> {
        let removed = self.edges_touching(ids);
        let mut inner = self.inner.write().unwrap();
        for edge in &removed {
            if let Some(targets) = inner.outgoing.get_mut(&edge.source_id) {
                targets.remove(&edge.target_id);
            }
            if let Some(sources) = inner.incoming.get_mut(&edge.target_id) {
                sources.remove(&edge.source_id);
            }
        }
        inner.outgoing.retain(|_, set| !set.is_empty());
        inner.incoming.retain(|_, set| !set.is_empty());
        removed
    }

    /// Total edge count (for diagnostics)
    pub fn edge_count(&self) -> usize {
        self.inner
            .read()
            .unwrap()
            .outgoing
            .values()
            .map(|set| set.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_is_idempotent_and_symmetric() {
        let index = MentionIndex::new();
        assert!(index.add_reference("a", "b"));
        assert!(!index.add_reference("a", "b"));

        assert_eq!(index.outgoing("a"), vec!["b".to_string()]);
        assert_eq!(index.incoming("b"), vec!["a".to_string()]);
        assert!(index.outgoing("b").is_empty());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let index = MentionIndex::new();
        index.add_reference("a", "b");
        assert!(index.remove_reference("a", "b"));
        assert!(!index.remove_reference("a", "b"));
        assert!(index.outgoing("a").is_empty());
        assert!(index.incoming("b").is_empty());
    }

    #[test]
    fn test_self_reference_rejected() {
        let index = MentionIndex::new();
        assert!(!index.add_reference("a", "a"));
        assert_eq!(index.edge_count(), 0);
    }

    #[test]
    fn test_outgoing_is_ordered() {
        let index = MentionIndex::new();
        index.add_reference("a", "zebra");
        index.add_reference("a", "alpha");
        index.add_reference("a", "mid");
        assert_eq!(
            index.outgoing("a"),
            vec!["alpha".to_string(), "mid".to_string(), "zebra".to_string()]
        );
    }

    #[test]
    fn test_purge_removes_both_directions() {
        let index = MentionIndex::new();
        index.add_reference("a", "b");
        index.add_reference("b", "c");
        index.add_reference("outside", "b");
        index.add_reference("outside", "elsewhere");

        let doomed: HashSet<String> = ["b".to_string()].into_iter().collect();
        let removed = index.purge(&doomed);

        assert_eq!(removed.len(), 3);
        assert!(index.outgoing("a").is_empty());
        assert!(index.incoming("c").is_empty());
        assert_eq!(index.outgoing("outside"), vec!["elsewhere".to_string()]);
        assert_eq!(index.edge_count(), 1);
    }
}
