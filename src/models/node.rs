//! Node Data Structures
//!
//! This module defines the core `Node` struct and the supporting types used
//! throughout the persistence pipeline.
//!
//! # Architecture
//!
//! - **Universal Node**: a single struct represents all content types;
//!   entity-specific data lives in the JSON `properties` field
//! - **Client-assigned IDs**: ids are generated in memory and reused as the
//!   store key, so a node's identity never changes when it is persisted
//! - **Coordination state is in-memory only**: `lifecycle` and
//!   `ever_persisted` are `#[serde(skip)]` and rebuilt from
//!   presence-in-store on reload

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Default version value for serde deserialization (version 1)
fn default_version() -> i64 {
    1
}

/// Validation errors for Node operations
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid node type: {0}")]
    InvalidNodeType(String),

    #[error("Invalid parent reference: {0}")]
    InvalidParent(String),

    #[error("Invalid container reference: {0}")]
    InvalidContainer(String),

    #[error("Invalid sibling reference: {0}")]
    InvalidSibling(String),

    #[error("Properties validation failed: {0}")]
    InvalidProperties(String),
}

/// Per-node write lifecycle, orthogonal to node identity.
///
/// A node legitimately cycles `Saved → WritePending → Writing → Saved` on
/// every edit. The CREATE-vs-UPDATE decision must never consult this enum;
/// it reads [`Node::ever_persisted`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleState {
    /// Created in memory, no write scheduled yet
    Unsaved,
    /// A write is scheduled (debouncing or waiting on a dependency)
    WritePending,
    /// A write has been dispatched to the backing store
    Writing,
    /// The last scheduled write completed successfully
    Saved,
    /// The last write exhausted its retries or hit a fatal error
    WriteFailed,
}

impl Default for LifecycleState {
    fn default() -> Self {
        LifecycleState::Unsaved
    }
}

/// Universal node structure for all content types.
///
/// # Fields
///
/// - `id`: client-assigned stable identifier, immutable for the node's
///   lifetime, used both in memory and as the store key
/// - `node_type`: type discriminant (e.g., "text", "task", "date")
/// - `content`: primary text payload
/// - `parent_id`: optional parent reference (NULL = root-level)
/// - `container_node_id`: optional container/page reference (NULL means
///   this node IS a container)
/// - `before_sibling_id`: predecessor pointer in the sibling chain
///   (NULL = first child)
/// - `version`: optimistic-concurrency counter, bumped only by the store
/// - `properties`: JSON object with entity-specific fields
/// - `mentions`: outgoing reference edges (ids of nodes this node mentions)
/// - `embedding`: optional vector for semantic search
///
/// # Coordination fields
///
/// `lifecycle` and `ever_persisted` are never serialized. `ever_persisted`
/// is set exactly once, immediately after the first successful create, and
/// never reset; it is the single source of truth for whether a scheduled
/// write is a CREATE or an UPDATE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Unique identifier (UUID string)
    pub id: String,

    /// Node type (e.g., "text", "task", "date")
    pub node_type: String,

    /// Primary content/text of the node
    pub content: String,

    /// Parent node ID (NULL = root-level under a container)
    pub parent_id: Option<String>,

    /// Container node ID (NULL means this node IS a container)
    pub container_node_id: Option<String>,

    /// Sibling ordering reference (single-pointer linked list)
    pub before_sibling_id: Option<String>,

    /// Optimistic concurrency control version (incremented by the store)
    #[serde(default = "default_version")]
    pub version: i64,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last modification timestamp
    pub modified_at: DateTime<Utc>,

    /// All entity-specific fields as a JSON object
    pub properties: serde_json::Value,

    /// Outgoing mentions - ids of nodes that THIS node references
    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mentions: Vec<String>,

    /// Optional vector embedding for semantic search
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,

    /// In-memory write lifecycle; never persisted
    #[serde(skip)]
    pub lifecycle: LifecycleState,

    /// True once the first create has landed in the store; never reset
    #[serde(skip)]
    pub ever_persisted: bool,
}

impl Node {
    /// Create a new node with an auto-generated UUID.
    ///
    /// `container_node_id` defaults to `parent_id`, which is correct for
    /// root nodes and direct children of a container. For deeper nesting
    /// use [`Node::new_in_container`].
    pub fn new(
        node_type: String,
        content: String,
        parent_id: Option<String>,
        properties: serde_json::Value,
    ) -> Self {
        let container_node_id = parent_id.clone();
        Self::new_in_container(node_type, content, parent_id, container_node_id, properties)
    }

    /// Create a new node with an explicit container reference.
    pub fn new_in_container(
        node_type: String,
        content: String,
        parent_id: Option<String>,
        container_node_id: Option<String>,
        properties: serde_json::Value,
    ) -> Self {
        Self::new_with_id(
            Uuid::new_v4().to_string(),
            node_type,
            content,
            parent_id,
            container_node_id,
            properties,
        )
    }

    /// Create a new node with a caller-provided ID.
    ///
    /// The UI layer pre-generates ids so that its optimistic in-memory copy
    /// and the persisted record share the same key.
    pub fn new_with_id(
        id: String,
        node_type: String,
        content: String,
        parent_id: Option<String>,
        container_node_id: Option<String>,
        properties: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            node_type,
            content,
            parent_id,
            container_node_id,
            before_sibling_id: None,
            version: 1,
            created_at: now,
            modified_at: now,
            properties,
            mentions: Vec::new(),
            embedding: None,
            lifecycle: LifecycleState::Unsaved,
            ever_persisted: false,
        }
    }

    /// Validate node structure and required fields.
    ///
    /// Content may be empty: blank nodes are valid during editing and are
    /// created when users press Enter.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` if:
    /// - `id` or `node_type` is empty
    /// - `properties` is not a JSON object
    /// - the node references itself as parent, container, or sibling
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_empty() {
            return Err(ValidationError::MissingField("id".to_string()));
        }

        if self.node_type.is_empty() {
            return Err(ValidationError::MissingField("node_type".to_string()));
        }

        if !self.properties.is_object() {
            return Err(ValidationError::InvalidProperties(
                "properties must be a JSON object".to_string(),
            ));
        }

        if self.parent_id.as_deref() == Some(self.id.as_str()) {
            return Err(ValidationError::InvalidParent(
                "Node cannot be its own parent".to_string(),
            ));
        }

        if self.container_node_id.as_deref() == Some(self.id.as_str()) {
            return Err(ValidationError::InvalidContainer(
                "Node cannot be its own container".to_string(),
            ));
        }

        if self.before_sibling_id.as_deref() == Some(self.id.as_str()) {
            return Err(ValidationError::InvalidSibling(
                "Node cannot be its own sibling".to_string(),
            ));
        }

        Ok(())
    }

    /// Check if this node is a container (no container reference)
    pub fn is_container(&self) -> bool {
        self.container_node_id.is_none()
    }

    /// Merge properties with existing properties (shallow merge)
    pub fn merge_properties(&mut self, updates: &serde_json::Value) {
        if let (Some(existing), Some(new)) = (self.properties.as_object_mut(), updates.as_object())
        {
            for (key, value) in new {
                existing.insert(key.clone(), value.clone());
            }
            self.modified_at = Utc::now();
        }
    }
}

/// Custom deserializer for optional fields that accepts plain values
///
/// Maps three input formats to the double-Option pattern:
/// - Missing field → None (don't update)
/// - null → Some(None) (set to NULL)
/// - "value" → Some(Some("value")) (set to value)
fn deserialize_optional_field<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Some(Option::<T>::deserialize(deserializer)?))
}

/// Partial node update for PATCH-style writes.
///
/// All fields are optional; only provided fields are applied. The three
/// nullable pointer fields use a double-`Option` to distinguish "don't
/// touch" (`None`) from "set to NULL" (`Some(None)`) from "set to value"
/// (`Some(Some(id))`).
///
/// # Examples
///
/// ```rust
/// # use outline_core::models::NodeUpdate;
/// // Update only content (don't touch parent_id)
/// let update = NodeUpdate {
///     content: Some("Updated content".to_string()),
///     ..Default::default()
/// };
///
/// // Re-parent and clear the sibling pointer (first child)
/// let update = NodeUpdate {
///     parent_id: Some(Some("new-parent".to_string())),
///     before_sibling_id: Some(None),
///     ..Default::default()
/// };
/// assert!(update.is_structural());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeUpdate {
    /// Update node type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,

    /// Update primary content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Update parent reference (double-Option)
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_optional_field"
    )]
    pub parent_id: Option<Option<String>>,

    /// Update container reference (double-Option)
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_optional_field"
    )]
    pub container_node_id: Option<Option<String>>,

    /// Update sibling ordering (double-Option)
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_optional_field"
    )]
    pub before_sibling_id: Option<Option<String>>,

    /// Merge into properties (shallow)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<serde_json::Value>,

    /// Replace the outgoing mention set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mentions: Option<Vec<String>>,
}

impl NodeUpdate {
    /// Create a new empty NodeUpdate
    pub fn new() -> Self {
        Self::default()
    }

    /// Set content update
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// Set properties update
    pub fn with_properties(mut self, properties: serde_json::Value) -> Self {
        self.properties = Some(properties);
        self
    }

    /// Set node type update
    pub fn with_node_type(mut self, node_type: impl Into<String>) -> Self {
        self.node_type = Some(node_type.into());
        self
    }

    /// Check if the update contains any changes
    pub fn is_empty(&self) -> bool {
        self.node_type.is_none()
            && self.content.is_none()
            && self.parent_id.is_none()
            && self.container_node_id.is_none()
            && self.before_sibling_id.is_none()
            && self.properties.is_none()
            && self.mentions.is_none()
    }

    /// True if the update touches hierarchy pointers.
    ///
    /// Structural updates bypass the debounce window so downstream reads
    /// never observe stale structure.
    pub fn is_structural(&self) -> bool {
        self.parent_id.is_some()
            || self.container_node_id.is_some()
            || self.before_sibling_id.is_some()
    }

    /// Layer a later update on top of this one, field-wise last-writer-wins.
    ///
    /// Properties are shallow-merged rather than replaced so rapid edits to
    /// different keys coalesce into one write.
    pub fn merge(&mut self, later: NodeUpdate) {
        if later.node_type.is_some() {
            self.node_type = later.node_type;
        }
        if later.content.is_some() {
            self.content = later.content;
        }
        if later.parent_id.is_some() {
            self.parent_id = later.parent_id;
        }
        if later.container_node_id.is_some() {
            self.container_node_id = later.container_node_id;
        }
        if later.before_sibling_id.is_some() {
            self.before_sibling_id = later.before_sibling_id;
        }
        if let Some(new_props) = later.properties {
            match self.properties.as_mut().and_then(|p| p.as_object_mut()) {
                Some(existing) if new_props.is_object() => {
                    for (key, value) in new_props.as_object().unwrap() {
                        existing.insert(key.clone(), value.clone());
                    }
                }
                _ => self.properties = Some(new_props),
            }
        }
        if later.mentions.is_some() {
            self.mentions = later.mentions;
        }
    }

    /// Apply this update to a node in place (timestamps included).
    pub fn apply_to(&self, node: &mut Node) {
        if let Some(node_type) = &self.node_type {
            node.node_type = node_type.clone();
        }
        if let Some(content) = &self.content {
            node.content = content.clone();
        }
        if let Some(parent_id) = &self.parent_id {
            node.parent_id = parent_id.clone();
        }
        if let Some(container_node_id) = &self.container_node_id {
            node.container_node_id = container_node_id.clone();
        }
        if let Some(before_sibling_id) = &self.before_sibling_id {
            node.before_sibling_id = before_sibling_id.clone();
        }
        if let Some(properties) = &self.properties {
            node.merge_properties(properties);
        }
        if let Some(mentions) = &self.mentions {
            node.mentions = mentions.clone();
        }
        node.modified_at = Utc::now();
    }
}

/// Result of a delete operation.
///
/// Deletes are idempotent: removing an absent node succeeds with
/// `deleted_count == 0`. For cascade deletes the count covers the whole
/// subtree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteResult {
    /// Number of nodes removed from the store
    pub deleted_count: usize,
}

impl DeleteResult {
    /// A delete that removed `count` nodes
    pub fn removed(count: usize) -> Self {
        Self {
            deleted_count: count,
        }
    }

    /// Idempotent no-op: the target didn't exist
    pub fn not_found() -> Self {
        Self { deleted_count: 0 }
    }

    /// Whether the target existed before deletion
    pub fn existed(&self) -> bool {
        self.deleted_count > 0
    }
}

/// Filter criteria for node queries. Fields combine with AND; `None`
/// fields are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeFilter {
    /// Match node type exactly
    pub node_type: Option<String>,
    /// Match parent reference (Some(None) matches root-level nodes)
    pub parent_id: Option<Option<String>>,
    /// Match container reference
    pub container_node_id: Option<String>,
    /// Case-insensitive substring match on content
    pub content_contains: Option<String>,
}

/// Sort order for query results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeOrder {
    CreatedAt,
    ModifiedAt,
    Content,
}

/// Query parameters (filter, ordering, pagination)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeQuery {
    pub filter: Option<NodeFilter>,
    pub order_by: Option<NodeOrder>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Order a set of siblings by walking the `before_sibling_id` chain.
///
/// The chain is a singly-linked list of predecessor pointers: the first
/// child has `before_sibling_id == None`, every other child points at the
/// sibling it follows. Nodes whose predecessor is missing from the set
/// (a chain briefly broken mid-splice) are appended at the end in
/// `created_at` order rather than dropped.
pub fn order_by_sibling_chain(nodes: Vec<Node>) -> Vec<Node> {
    let mut by_predecessor: std::collections::HashMap<Option<String>, Vec<Node>> =
        std::collections::HashMap::new();
    let ids: std::collections::HashSet<String> = nodes.iter().map(|n| n.id.clone()).collect();

    let mut leftovers: Vec<Node> = Vec::new();
    for node in nodes {
        match &node.before_sibling_id {
            Some(pred) if !ids.contains(pred) => leftovers.push(node),
            key => by_predecessor
                .entry(key.clone())
                .or_default()
                .push(node),
        }
    }

    let mut ordered = Vec::with_capacity(ids.len());
    let mut cursor: Option<String> = None;
    loop {
        let Some(mut bucket) = by_predecessor.remove(&cursor) else {
            break;
        };
        // A healthy chain has exactly one node per predecessor; duplicates
        // (transient during concurrent splices) are kept deterministically.
        bucket.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let node = bucket.remove(0);
        leftovers.extend(bucket);
        cursor = Some(node.id.clone());
        ordered.push(node);
    }

    // Anything still unvisited sits on an unreachable chain segment
    for (_, bucket) in by_predecessor {
        leftovers.extend(bucket);
    }
    leftovers.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    ordered.extend(leftovers);
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_node_defaults() {
        let node = Node::new("text".to_string(), "hello".to_string(), None, json!({}));
        assert_eq!(node.version, 1);
        assert_eq!(node.lifecycle, LifecycleState::Unsaved);
        assert!(!node.ever_persisted);
        assert!(node.is_container());
        assert!(node.validate().is_ok());
    }

    #[test]
    fn test_container_defaults_to_parent() {
        let child = Node::new(
            "text".to_string(),
            "child".to_string(),
            Some("parent-1".to_string()),
            json!({}),
        );
        assert_eq!(child.container_node_id.as_deref(), Some("parent-1"));
        assert!(!child.is_container());
    }

    #[test]
    fn test_validate_rejects_self_references() {
        let mut node = Node::new("text".to_string(), "x".to_string(), None, json!({}));
        node.parent_id = Some(node.id.clone());
        assert!(matches!(
            node.validate(),
            Err(ValidationError::InvalidParent(_))
        ));

        node.parent_id = None;
        node.before_sibling_id = Some(node.id.clone());
        assert!(matches!(
            node.validate(),
            Err(ValidationError::InvalidSibling(_))
        ));
    }

    #[test]
    fn test_coordination_fields_not_serialized() {
        let mut node = Node::new("text".to_string(), "x".to_string(), None, json!({}));
        node.ever_persisted = true;
        node.lifecycle = LifecycleState::Saved;

        let value = serde_json::to_value(&node).unwrap();
        assert!(value.get("everPersisted").is_none());
        assert!(value.get("lifecycle").is_none());

        let restored: Node = serde_json::from_value(value).unwrap();
        assert!(!restored.ever_persisted);
        assert_eq!(restored.lifecycle, LifecycleState::Unsaved);
    }

    #[test]
    fn test_update_merge_last_writer_wins() {
        let mut first = NodeUpdate::new().with_content("one");
        first.before_sibling_id = Some(Some("a".to_string()));

        let mut second = NodeUpdate::new().with_content("two");
        second.before_sibling_id = Some(None);

        first.merge(second);
        assert_eq!(first.content.as_deref(), Some("two"));
        assert_eq!(first.before_sibling_id, Some(None));
    }

    #[test]
    fn test_update_merge_shallow_merges_properties() {
        let mut first = NodeUpdate::new().with_properties(json!({"a": 1, "b": 1}));
        let second = NodeUpdate::new().with_properties(json!({"b": 2, "c": 3}));

        first.merge(second);
        assert_eq!(first.properties, Some(json!({"a": 1, "b": 2, "c": 3})));
    }

    #[test]
    fn test_structural_detection() {
        assert!(!NodeUpdate::new().with_content("x").is_structural());

        let mut update = NodeUpdate::new();
        update.parent_id = Some(None);
        assert!(update.is_structural());

        let mut update = NodeUpdate::new();
        update.before_sibling_id = Some(Some("sib".to_string()));
        assert!(update.is_structural());
    }

    #[test]
    fn test_update_deserializes_plain_values() {
        let update: NodeUpdate =
            serde_json::from_value(json!({"beforeSiblingId": "node-1", "content": "hi"})).unwrap();
        assert_eq!(update.before_sibling_id, Some(Some("node-1".to_string())));

        let update: NodeUpdate = serde_json::from_value(json!({"beforeSiblingId": null})).unwrap();
        assert_eq!(update.before_sibling_id, Some(None));
    }

    #[test]
    fn test_apply_to_stamps_modified_at() {
        let mut node = Node::new("text".to_string(), "old".to_string(), None, json!({}));
        let before = node.modified_at;
        std::thread::sleep(std::time::Duration::from_millis(2));

        NodeUpdate::new().with_content("new").apply_to(&mut node);
        assert_eq!(node.content, "new");
        assert!(node.modified_at > before);
    }

    #[test]
    fn test_order_by_sibling_chain() {
        let a = Node::new("text".to_string(), "a".to_string(), None, json!({}));
        let mut b = Node::new("text".to_string(), "b".to_string(), None, json!({}));
        b.before_sibling_id = Some(a.id.clone());
        let mut c = Node::new("text".to_string(), "c".to_string(), None, json!({}));
        c.before_sibling_id = Some(b.id.clone());

        let ordered = order_by_sibling_chain(vec![c.clone(), a.clone(), b.clone()]);
        let ids: Vec<&str> = ordered.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec![a.id.as_str(), b.id.as_str(), c.id.as_str()]);
    }

    #[test]
    fn test_order_by_sibling_chain_keeps_orphans() {
        let a = Node::new("text".to_string(), "a".to_string(), None, json!({}));
        let mut orphan = Node::new("text".to_string(), "orphan".to_string(), None, json!({}));
        orphan.before_sibling_id = Some("missing".to_string());

        let ordered = order_by_sibling_chain(vec![orphan.clone(), a.clone()]);
        assert_eq!(ordered.len(), 2);
        assert_eq!(ordered[0].id, a.id);
        assert_eq!(ordered[1].id, orphan.id);
    }

    #[test]
    fn test_delete_result_idempotence() {
        assert!(!DeleteResult::not_found().existed());
        assert!(DeleteResult::removed(3).existed());
        assert_eq!(DeleteResult::removed(3).deleted_count, 3);
    }
}
