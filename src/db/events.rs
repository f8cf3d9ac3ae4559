//! Domain Events
//!
//! Change notifications emitted by the node cache whenever the in-memory
//! graph mutates. Events are delivered over a tokio broadcast channel so
//! any number of subscribers (UI adapters, tests) observe mutations
//! without coupling to the cache internals.
//!
//! Cache notification is synchronous with the mutation: subscribers see
//! the new value before any backing-store I/O happens.

use crate::models::{LifecycleState, Node};
use serde::{Deserialize, Serialize};

/// Why a cache mutation happened. Carried on upsert events so subscribers
/// can tell user edits from engine-internal splices and bulk loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeSource {
    /// Direct user edit (typing, property change)
    User,
    /// Structural splice issued by the hierarchy engine
    Hierarchy,
    /// Initial load from the backing store
    Load,
}

/// Domain events emitted on cache mutation
#[derive(Debug, Clone)]
pub enum DomainEvent {
    /// A node was inserted into or overwritten in the cache
    NodeUpserted { node: Node, source: ChangeSource },

    /// A node was removed from the cache
    NodeRemoved { id: String },

    /// A node's write lifecycle changed (pending → writing → saved/failed)
    LifecycleChanged { id: String, state: LifecycleState },

    /// A mention edge was added to the index
    MentionAdded {
        source_id: String,
        target_id: String,
    },

    /// A mention edge was removed from the index
    MentionRemoved {
        source_id: String,
        target_id: String,
    },
}

impl DomainEvent {
    /// Get a string representation of the event type
    pub fn event_type(&self) -> &str {
        match self {
            DomainEvent::NodeUpserted { .. } => "node:upserted",
            DomainEvent::NodeRemoved { .. } => "node:removed",
            DomainEvent::LifecycleChanged { .. } => "node:lifecycle",
            DomainEvent::MentionAdded { .. } => "mention:added",
            DomainEvent::MentionRemoved { .. } => "mention:removed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Node;
    use serde_json::json;

    #[test]
    fn test_event_type_names() {
        let node = Node::new("text".to_string(), "x".to_string(), None, json!({}));
        let event = DomainEvent::NodeUpserted {
            node,
            source: ChangeSource::User,
        };
        assert_eq!(event.event_type(), "node:upserted");

        let event = DomainEvent::NodeRemoved {
            id: "n1".to_string(),
        };
        assert_eq!(event.event_type(), "node:removed");
    }

    #[test]
    fn test_change_source_serialization_contract() {
        // Frontend event types rely on the camelCase discriminators
        assert_eq!(
            serde_json::to_value(ChangeSource::User).unwrap(),
            json!("user")
        );
        assert_eq!(
            serde_json::to_value(ChangeSource::Hierarchy).unwrap(),
            json!("hierarchy")
        );
    }
}
