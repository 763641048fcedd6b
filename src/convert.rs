//! AST-to-tree conversion: a cycle-safe, depth-bounded JSON projection.
//!
//! Both the full-model query path and the notification content path go
//! through here. All traversal state (the on-path set, the synthetic-id map)
//! is scoped to a single `convert` call, so concurrent conversions never
//! share mutable state.

use crate::config::ServerConfig;
use crate::error::ExecuteError;
use crate::node::{AstNode, PropertyValue};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Backing-reference fields that must never be serialized, even if a node
/// reports them.
const INTERNAL_FIELDS: &[&str] = &["container", "document", "owner", "parent", "ref"];

/// Identity fields kept regardless of any allow/deny list.
const IDENTITY_FIELDS: &[&str] = &["name", "id"];

/// Options governing one conversion.
#[derive(Debug, Clone)]
pub struct ConvertOptions {
    /// Depth at which traversal stops with a truncation marker.
    pub max_depth: usize,
    /// Exclusive allow-list; when non-empty, only these fields (plus
    /// identity fields) survive.
    pub include_fields: Vec<String>,
    /// Deny-list, consulted only when the allow-list is empty.
    pub exclude_fields: Vec<String>,
    /// Emit `$id` on every compound node.
    pub track_identity: bool,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            max_depth: 100,
            include_fields: Vec::new(),
            exclude_fields: Vec::new(),
            track_identity: true,
        }
    }
}

impl ConvertOptions {
    /// Defaults with the depth bound taken from server configuration.
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            max_depth: config.max_convert_depth,
            ..Default::default()
        }
    }
}

/// One detected cycle: where traversal was when it hit a node already on
/// the current path, and the id the emitted marker points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircularRef {
    pub from_path: String,
    pub ref_id: String,
}

/// Result of one conversion.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvertedTree {
    pub data: Value,
    pub has_circular: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub circular_refs: Vec<CircularRef>,
}

/// Converts node graphs to JSON-safe trees.
#[derive(Debug, Clone, Default)]
pub struct TreeConverter {
    options: ConvertOptions,
}

impl TreeConverter {
    pub fn new(options: ConvertOptions) -> Self {
        Self { options }
    }

    /// Convert with this converter's default options.
    pub fn convert(&self, root: &Arc<dyn AstNode>) -> ConvertedTree {
        self.convert_with(root, &self.options)
    }

    /// Convert with per-call options.
    pub fn convert_with(&self, root: &Arc<dyn AstNode>, options: &ConvertOptions) -> ConvertedTree {
        let mut walker = Walker {
            options,
            on_path: HashSet::new(),
            ids: HashMap::new(),
            next_id: 0,
            circular: Vec::new(),
        };
        let data = walker.convert_node(root, 0, "");
        ConvertedTree {
            data,
            has_circular: !walker.circular.is_empty(),
            circular_refs: walker.circular,
        }
    }
}

/// Per-call traversal state.
struct Walker<'a> {
    options: &'a ConvertOptions,
    /// Nodes on the current root-to-here path, by pointer identity.
    on_path: HashSet<usize>,
    /// Synthetic ids assigned so far, by pointer identity.
    ids: HashMap<usize, String>,
    next_id: u64,
    circular: Vec<CircularRef>,
}

fn node_key(node: &Arc<dyn AstNode>) -> usize {
    Arc::as_ptr(node).cast::<()>() as usize
}

impl Walker<'_> {
    fn convert_node(&mut self, node: &Arc<dyn AstNode>, depth: usize, path: &str) -> Value {
        if depth >= self.options.max_depth {
            return json!({"$truncated": true, "$type": node.node_type()});
        }

        let key = node_key(node);
        if self.on_path.contains(&key) {
            // Already being converted further up the path: emit a marker
            // instead of re-descending.
            let ref_id = self.id_for(key, node);
            self.circular.push(CircularRef {
                from_path: path.to_string(),
                ref_id: ref_id.clone(),
            });
            return json!({"$ref": ref_id});
        }

        self.on_path.insert(key);
        let id = self.id_for(key, node);

        let mut map = Map::new();
        map.insert("$type".to_string(), Value::String(node.node_type().to_string()));
        if self.options.track_identity {
            map.insert("$id".to_string(), Value::String(id));
        }
        if let Some(name) = node.name() {
            map.insert("name".to_string(), Value::String(name.to_string()));
        }

        for (field, value) in node.properties() {
            if INTERNAL_FIELDS.contains(&field.as_str()) {
                continue;
            }
            if !self.field_included(&field) {
                continue;
            }
            let child_path = if path.is_empty() {
                field.clone()
            } else {
                format!("{path}.{field}")
            };
            let converted = match value {
                PropertyValue::Scalar(scalar) => scalar,
                PropertyValue::Node(child) => self.convert_node(&child, depth + 1, &child_path),
                PropertyValue::Nodes(children) => Value::Array(
                    children
                        .iter()
                        .enumerate()
                        .map(|(index, child)| {
                            self.convert_node(child, depth + 1, &format!("{child_path}[{index}]"))
                        })
                        .collect(),
                ),
            };
            map.insert(field, converted);
        }

        self.on_path.remove(&key);
        Value::Object(map)
    }

    fn id_for(&mut self, key: usize, node: &Arc<dyn AstNode>) -> String {
        if let Some(existing) = self.ids.get(&key) {
            return existing.clone();
        }
        let id = match node.name() {
            Some(name) => format!("{}:{}", node.node_type(), name),
            None => {
                self.next_id += 1;
                format!("node_{}", self.next_id)
            }
        };
        self.ids.insert(key, id.clone());
        id
    }

    fn field_included(&self, field: &str) -> bool {
        if IDENTITY_FIELDS.contains(&field) {
            return true;
        }
        if !self.options.include_fields.is_empty() {
            return self.options.include_fields.iter().any(|f| f == field);
        }
        !self.options.exclude_fields.iter().any(|f| f == field)
    }
}

/// Find the first node (depth-first) whose `$id` or `id` equals `id`.
pub fn find_node_by_id<'a>(tree: &'a Value, id: &str) -> Option<&'a Value> {
    match tree {
        Value::Object(map) => {
            let matches = map.get("$id").and_then(Value::as_str) == Some(id)
                || map.get("id").and_then(Value::as_str) == Some(id);
            if matches {
                return Some(tree);
            }
            map.values().find_map(|value| find_node_by_id(value, id))
        }
        Value::Array(items) => items.iter().find_map(|value| find_node_by_id(value, id)),
        _ => None,
    }
}

/// Collect every node (depth-first) whose `$type` equals `node_type`.
pub fn find_nodes_by_type<'a>(tree: &'a Value, node_type: &str) -> Vec<&'a Value> {
    let mut found = Vec::new();
    collect_by_type(tree, node_type, &mut found);
    found
}

fn collect_by_type<'a>(tree: &'a Value, node_type: &str, found: &mut Vec<&'a Value>) {
    match tree {
        Value::Object(map) => {
            if map.get("$type").and_then(Value::as_str) == Some(node_type) {
                found.push(tree);
            }
            for value in map.values() {
                collect_by_type(value, node_type, found);
            }
        }
        Value::Array(items) => {
            for value in items {
                collect_by_type(value, node_type, found);
            }
        }
        _ => {}
    }
}

#[derive(Debug, PartialEq, Eq)]
enum PathSegment {
    Field(String),
    Index(usize),
}

/// Navigate a converted tree by a dot-and-bracket path such as
/// `states[2].transitions[0].target`.
pub fn get_node_by_path<'a>(tree: &'a Value, path: &str) -> Result<&'a Value, ExecuteError> {
    let segments = parse_path(path)?;
    let mut current = tree;
    let mut walked = String::new();

    for segment in segments {
        match segment {
            PathSegment::Field(name) => {
                push_field(&mut walked, &name);
                current = current
                    .get(&name)
                    .ok_or_else(|| ExecuteError::NodeNotFound(walked.clone()))?;
            }
            PathSegment::Index(index) => {
                walked.push_str(&format!("[{index}]"));
                current = current
                    .get(index)
                    .ok_or_else(|| ExecuteError::NodeNotFound(walked.clone()))?;
            }
        }
    }
    Ok(current)
}

fn push_field(walked: &mut String, name: &str) {
    if !walked.is_empty() {
        walked.push('.');
    }
    walked.push_str(name);
}

fn parse_path(path: &str) -> Result<Vec<PathSegment>, ExecuteError> {
    if path.is_empty() {
        return Err(ExecuteError::InvalidQuery("empty path".to_string()));
    }

    let mut segments = Vec::new();
    for part in path.split('.') {
        if part.is_empty() {
            return Err(ExecuteError::InvalidQuery(format!(
                "empty segment in '{path}'"
            )));
        }

        let mut rest = part;
        let field_end = rest.find('[').unwrap_or(rest.len());
        let field = &rest[..field_end];
        if field.is_empty() {
            return Err(ExecuteError::InvalidQuery(format!(
                "segment '{part}' has no field name"
            )));
        }
        segments.push(PathSegment::Field(field.to_string()));
        rest = &rest[field_end..];

        while !rest.is_empty() {
            if !rest.starts_with('[') {
                return Err(ExecuteError::InvalidQuery(format!(
                    "malformed segment '{part}'"
                )));
            }
            let close = rest.find(']').ok_or_else(|| {
                ExecuteError::InvalidQuery(format!("unclosed bracket in '{part}'"))
            })?;
            let index: usize = rest[1..close].parse().map_err(|_| {
                ExecuteError::InvalidQuery(format!("non-numeric index in '{part}'"))
            })?;
            segments.push(PathSegment::Index(index));
            rest = &rest[close + 1..];
        }
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::BasicNode;

    fn count_refs(value: &Value) -> usize {
        match value {
            Value::Object(map) => {
                let own = usize::from(map.contains_key("$ref"));
                own + map.values().map(count_refs).sum::<usize>()
            }
            Value::Array(items) => items.iter().map(count_refs).sum(),
            _ => 0,
        }
    }

    fn sample_machine() -> Arc<BasicNode> {
        let idle = BasicNode::named("State", "idle");
        let busy = BasicNode::named("State", "busy");
        let machine = BasicNode::named("Machine", "traffic");
        machine.set_scalar("persistent", json!(true));
        machine.set_children("states", vec![idle, busy]);
        machine
    }

    #[test]
    fn test_acyclic_graph_has_no_markers() {
        let converter = TreeConverter::default();
        let machine = sample_machine();

        let tree = converter.convert(&(machine.clone() as Arc<dyn AstNode>));
        assert!(!tree.has_circular);
        assert!(tree.circular_refs.is_empty());
        assert_eq!(count_refs(&tree.data), 0);

        assert_eq!(tree.data["$type"], "Machine");
        assert_eq!(tree.data["name"], "traffic");
        assert_eq!(tree.data["states"][0]["name"], "idle");

        // Deterministic: converting the same input again yields the same tree
        let again = converter.convert(&(machine as Arc<dyn AstNode>));
        assert_eq!(tree.data, again.data);
    }

    #[test]
    fn test_cycle_emits_exactly_one_ref_to_origin() {
        let a = BasicNode::named("Entity", "A");
        let b = BasicNode::named("Entity", "B");
        b.set_child("target", a.clone());
        a.set_child("target", b);

        let converter = TreeConverter::default();
        let tree = converter.convert(&(a as Arc<dyn AstNode>));

        assert!(tree.has_circular);
        assert_eq!(tree.circular_refs.len(), 1);
        assert_eq!(count_refs(&tree.data), 1);
        // The marker points back at A's synthetic id, at the point of recurrence
        assert_eq!(tree.data["target"]["target"]["$ref"], "Entity:A");
        assert_eq!(tree.circular_refs[0].ref_id, "Entity:A");
        assert_eq!(tree.circular_refs[0].from_path, "target.target");
    }

    #[test]
    fn test_self_reference() {
        let node = BasicNode::named("Entity", "loop");
        node.set_child("next", node.clone());

        let tree = TreeConverter::default().convert(&(node as Arc<dyn AstNode>));
        assert!(tree.has_circular);
        assert_eq!(tree.data["next"]["$ref"], "Entity:loop");
    }

    #[test]
    fn test_depth_bound_truncates() {
        let mut current = BasicNode::named("Node", "leaf");
        for depth in 0..10 {
            let parent = BasicNode::named("Node", format!("n{depth}"));
            parent.set_child("child", current);
            current = parent;
        }

        let converter = TreeConverter::new(ConvertOptions {
            max_depth: 3,
            ..Default::default()
        });
        let tree = converter.convert(&(current as Arc<dyn AstNode>));

        let truncated = &tree.data["child"]["child"]["child"];
        assert_eq!(truncated["$truncated"], true);
        assert_eq!(truncated["$type"], "Node");
        // Truncation is not a cycle
        assert!(!tree.has_circular);
    }

    #[test]
    fn test_internal_fields_are_stripped() {
        let child = BasicNode::named("Property", "total");
        let parent = BasicNode::named("Entity", "Order");
        child.set_child("parent", parent.clone());
        child.set_scalar("ref", json!("Order"));
        parent.set_children("properties", vec![child]);

        let tree = TreeConverter::default().convert(&(parent as Arc<dyn AstNode>));
        let property = &tree.data["properties"][0];
        assert!(property.get("parent").is_none());
        assert!(property.get("ref").is_none());
        // And stripping the back-reference also means no cycle was seen
        assert!(!tree.has_circular);
    }

    #[test]
    fn test_allow_list_is_exclusive_but_keeps_identity() {
        let machine = sample_machine();
        let converter = TreeConverter::new(ConvertOptions {
            include_fields: vec!["persistent".to_string()],
            ..Default::default()
        });

        let tree = converter.convert(&(machine as Arc<dyn AstNode>));
        assert_eq!(tree.data["persistent"], true);
        assert!(tree.data.get("states").is_none());
        // Identity fields survive any list
        assert_eq!(tree.data["name"], "traffic");
        assert_eq!(tree.data["$type"], "Machine");
    }

    #[test]
    fn test_deny_list_drops_fields() {
        let machine = sample_machine();
        let converter = TreeConverter::new(ConvertOptions {
            exclude_fields: vec!["states".to_string()],
            ..Default::default()
        });

        let tree = converter.convert(&(machine as Arc<dyn AstNode>));
        assert!(tree.data.get("states").is_none());
        assert_eq!(tree.data["persistent"], true);
    }

    #[test]
    fn test_identity_tracking_can_be_disabled() {
        let machine = sample_machine();
        let converter = TreeConverter::new(ConvertOptions {
            track_identity: false,
            ..Default::default()
        });

        let tree = converter.convert(&(machine.clone() as Arc<dyn AstNode>));
        assert!(tree.data.get("$id").is_none());

        // Cycle markers still work without emitted ids
        let cyclic = BasicNode::named("Entity", "self");
        cyclic.set_child("me", cyclic.clone());
        let tree = converter.convert(&(cyclic as Arc<dyn AstNode>));
        assert!(tree.has_circular);
    }

    #[test]
    fn test_anonymous_nodes_get_counter_ids() {
        let child = BasicNode::new("Transition");
        let root = BasicNode::new("Machine");
        root.set_child("initial", child);

        let tree = TreeConverter::default().convert(&(root as Arc<dyn AstNode>));
        assert_eq!(tree.data["$id"], "node_1");
        assert_eq!(tree.data["initial"]["$id"], "node_2");
    }

    #[test]
    fn test_find_node_by_id() {
        let tree = TreeConverter::default().convert(&(sample_machine() as Arc<dyn AstNode>));
        let found = find_node_by_id(&tree.data, "State:busy").unwrap();
        assert_eq!(found["name"], "busy");
        assert!(find_node_by_id(&tree.data, "State:unknown").is_none());
    }

    #[test]
    fn test_find_nodes_by_type() {
        let tree = TreeConverter::default().convert(&(sample_machine() as Arc<dyn AstNode>));
        let states = find_nodes_by_type(&tree.data, "State");
        assert_eq!(states.len(), 2);
        assert!(find_nodes_by_type(&tree.data, "Transition").is_empty());
    }

    #[test]
    fn test_get_node_by_path() {
        let tree = TreeConverter::default().convert(&(sample_machine() as Arc<dyn AstNode>));

        let state = get_node_by_path(&tree.data, "states[1]").unwrap();
        assert_eq!(state["name"], "busy");

        let name = get_node_by_path(&tree.data, "states[0].name").unwrap();
        assert_eq!(name, "idle");

        match get_node_by_path(&tree.data, "states[7]") {
            Err(ExecuteError::NodeNotFound(at)) => assert_eq!(at, "states[7]"),
            other => panic!("expected NodeNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_paths_are_invalid_queries() {
        let tree = TreeConverter::default().convert(&(sample_machine() as Arc<dyn AstNode>));

        for path in ["", "a..b", "states[x]", "states[0", "[0]", "states]0["] {
            match get_node_by_path(&tree.data, path) {
                Err(ExecuteError::InvalidQuery(_)) => {}
                other => panic!("path '{}' should be invalid, got {:?}", path, other),
            }
        }
    }
}
