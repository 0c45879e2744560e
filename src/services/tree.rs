//! Schema-less tree walking.
//!
//! Responses are arbitrary JSON trees in which the interesting nodes sit at
//! unpredictable depths under unpredictable keys. The walker here only knows
//! how to visit; what counts as interesting is decided by a
//! [`NodeClassifier`] or by the visitor closure.

use serde_json::{Map, Value};

/// Decides whether an object node is an entity.
pub trait NodeClassifier {
    fn is_entity(&self, node: &Map<String, Value>) -> bool;
}

/// What the walker should do after visiting a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    /// Visit this node's children
    Descend,
    /// Skip this node's children
    Skip,
}

/// One visited position in the tree.
#[derive(Debug, Clone, Copy)]
pub struct NodeRef<'a> {
    /// Key under which the value sits (`None` for the root and array items)
    pub key: Option<&'a str>,
    pub value: &'a Value,
    pub depth: usize,
}

/// Depth-first, document-order walk over every value in `root`.
pub fn walk<'a, F>(root: &'a Value, visitor: &mut F)
where
    F: FnMut(NodeRef<'a>) -> Visit,
{
    walk_inner(None, root, 0, visitor);
}

fn walk_inner<'a, F>(key: Option<&'a str>, value: &'a Value, depth: usize, visitor: &mut F)
where
    F: FnMut(NodeRef<'a>) -> Visit,
{
    if visitor(NodeRef { key, value, depth }) == Visit::Skip {
        return;
    }
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                walk_inner(Some(k.as_str()), v, depth + 1, visitor);
            }
        }
        Value::Array(items) => {
            for item in items {
                walk_inner(key, item, depth + 1, visitor);
            }
        }
        _ => {}
    }
}

/// Walk the subtree below `node`, skipping nested entities.
///
/// Used to read a record's own fields without picking up values that belong
/// to an entity embedded in it (a shared post, a nested comment).
pub fn walk_own<'a, C, F>(node: &'a Map<String, Value>, classifier: &C, visitor: &mut F)
where
    C: NodeClassifier + ?Sized,
    F: FnMut(NodeRef<'a>),
{
    for (k, v) in node {
        walk_inner(Some(k.as_str()), v, 1, &mut |n: NodeRef<'a>| {
            if let Value::Object(child) = n.value {
                if classifier.is_entity(child) {
                    return Visit::Skip;
                }
            }
            visitor(n);
            Visit::Descend
        });
    }
}

/// Every entity node in the tree, in document order.
pub fn find_entities<'a, C>(root: &'a Value, classifier: &C) -> Vec<&'a Map<String, Value>>
where
    C: NodeClassifier + ?Sized,
{
    let mut found = Vec::new();
    walk(root, &mut |n| {
        if let Value::Object(map) = n.value {
            if classifier.is_entity(map) {
                found.push(map);
            }
        }
        Visit::Descend
    });
    found
}

/// Every `(key, value, depth)` whose key is in `names`.
pub fn collect_fields<'a>(root: &'a Value, names: &[String]) -> Vec<(&'a str, &'a Value, usize)> {
    let mut hits = Vec::new();
    walk(root, &mut |n| {
        if let Some(key) = n.key {
            if !n.value.is_array() && names.iter().any(|name| name == key) {
                hits.push((key, n.value, n.depth));
            }
        }
        Visit::Descend
    });
    hits
}
