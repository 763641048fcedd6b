//! Typed access to in-memory document models.
//!
//! The converter and the query path never inspect arbitrary struct fields at
//! runtime. Instead every node kind implements `AstNode` and enumerates its
//! own referencable fields, so traversal stays explicit and back-references
//! that must not be serialized simply are not reported.

use serde_json::Value;
use std::sync::{Arc, RwLock};

/// One node of a parsed document model.
///
/// Implementations are expected to be cheap to query: `properties` is called
/// once per node per traversal and should return the fields in declaration
/// order.
pub trait AstNode: Send + Sync {
    /// Type tag for this node (e.g. `Entity`, `Property`).
    fn node_type(&self) -> &str;

    /// Stable name, if the node has one. Combined with the type tag it forms
    /// the preferred synthetic id during conversion.
    fn name(&self) -> Option<&str> {
        None
    }

    /// The node's fields, scalars and children alike.
    fn properties(&self) -> Vec<(String, PropertyValue)>;
}

/// A single field value reported by [`AstNode::properties`].
#[derive(Clone)]
pub enum PropertyValue {
    /// Primitive or null; passed through to the projection unchanged.
    Scalar(Value),
    /// Single child node. May alias an ancestor, forming a cycle.
    Node(Arc<dyn AstNode>),
    /// Ordered list of child nodes.
    Nodes(Vec<Arc<dyn AstNode>>),
}

impl std::fmt::Debug for PropertyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropertyValue::Scalar(v) => f.debug_tuple("Scalar").field(v).finish(),
            PropertyValue::Node(n) => f.debug_tuple("Node").field(&n.node_type()).finish(),
            PropertyValue::Nodes(ns) => f.debug_tuple("Nodes").field(&ns.len()).finish(),
        }
    }
}

/// A plain `AstNode` implementation for hosts that assemble models
/// imperatively (and for tests).
///
/// Properties live behind a lock so children can be attached after the node
/// is already shared, which is how cyclic graphs are built.
pub struct BasicNode {
    node_type: String,
    name: Option<String>,
    properties: RwLock<Vec<(String, PropertyValue)>>,
}

impl BasicNode {
    /// Create an anonymous node of the given type.
    pub fn new(node_type: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            node_type: node_type.into(),
            name: None,
            properties: RwLock::new(Vec::new()),
        })
    }

    /// Create a named node of the given type.
    pub fn named(node_type: impl Into<String>, name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            node_type: node_type.into(),
            name: Some(name.into()),
            properties: RwLock::new(Vec::new()),
        })
    }

    /// Append a scalar field.
    pub fn set_scalar(self: &Arc<Self>, field: impl Into<String>, value: Value) -> Arc<Self> {
        self.push(field.into(), PropertyValue::Scalar(value));
        Arc::clone(self)
    }

    /// Append a single-child field.
    pub fn set_child(self: &Arc<Self>, field: impl Into<String>, child: Arc<dyn AstNode>) -> Arc<Self> {
        self.push(field.into(), PropertyValue::Node(child));
        Arc::clone(self)
    }

    /// Append a child-list field.
    pub fn set_children(
        self: &Arc<Self>,
        field: impl Into<String>,
        children: Vec<Arc<dyn AstNode>>,
    ) -> Arc<Self> {
        self.push(field.into(), PropertyValue::Nodes(children));
        Arc::clone(self)
    }

    fn push(&self, field: String, value: PropertyValue) {
        let mut properties = self.properties.write().unwrap();
        properties.retain(|(existing, _)| *existing != field);
        properties.push((field, value));
    }
}

impl AstNode for BasicNode {
    fn node_type(&self) -> &str {
        &self.node_type
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn properties(&self) -> Vec<(String, PropertyValue)> {
        self.properties.read().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_basic_node_properties() {
        let node = BasicNode::named("Entity", "Customer");
        node.set_scalar("persistent", json!(true));

        assert_eq!(node.node_type(), "Entity");
        assert_eq!(node.name(), Some("Customer"));

        let properties = node.properties();
        assert_eq!(properties.len(), 1);
        assert_eq!(properties[0].0, "persistent");
    }

    #[test]
    fn test_set_scalar_replaces_existing_field() {
        let node = BasicNode::new("Entity");
        node.set_scalar("weight", json!(1));
        node.set_scalar("weight", json!(2));

        let properties = node.properties();
        assert_eq!(properties.len(), 1);
        match &properties[0].1 {
            PropertyValue::Scalar(v) => assert_eq!(*v, json!(2)),
            other => panic!("unexpected property value: {:?}", other),
        }
    }

    #[test]
    fn test_children_can_be_attached_after_sharing() {
        let parent = BasicNode::named("Entity", "Order");
        let child = BasicNode::named("Property", "total");

        let shared: Arc<dyn AstNode> = parent.clone();
        parent.set_children("properties", vec![child]);

        assert_eq!(shared.properties().len(), 1);
    }
}
