//! Helpers for editing a JSON document as a tree of keyed nodes.
//!
//! The tree never stores `null` or empty containers: writing one removes the
//! node, and removing the last child of a node removes the node too.

use super::is_valid_key;
use serde_json::{Map, Value};

/// True for values the tree treats as "nothing stored here".
pub fn is_empty_node(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Strip nulls and empty containers. Returns `None` when nothing is left.
///
/// Arrays with holes become index-keyed objects.
pub fn normalize(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(map) => {
            let out: Map<String, Value> = map
                .into_iter()
                .filter_map(|(k, v)| normalize(v).map(|v| (k, v)))
                .collect();
            if out.is_empty() {
                None
            } else {
                Some(Value::Object(out))
            }
        }
        Value::Array(items) => {
            let items: Vec<Option<Value>> = items.into_iter().map(normalize).collect();
            if items.iter().all(Option::is_none) {
                None
            } else if items.iter().all(Option::is_some) {
                Some(Value::Array(items.into_iter().flatten().collect()))
            } else {
                Some(Value::Object(
                    items
                        .into_iter()
                        .enumerate()
                        .filter_map(|(i, v)| v.map(|v| (i.to_string(), v)))
                        .collect(),
                ))
            }
        }
        other => Some(other),
    }
}

/// The node at `segments` below `root`, if anything is stored there.
pub fn get_at<'a>(root: &'a Value, segments: &[String]) -> Option<&'a Value> {
    let mut node = root;
    for segment in segments {
        node = match node {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    if is_empty_node(node) {
        None
    } else {
        Some(node)
    }
}

/// Direct children of a node, ordered by key.
pub fn children_of(node: &Value) -> Vec<(String, Value)> {
    match node {
        Value::Object(map) => map
            .iter()
            .filter(|(_, v)| !is_empty_node(v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .filter(|(_, v)| !is_empty_node(v))
            .map(|(i, v)| (i.to_string(), v.clone()))
            .collect(),
        _ => Vec::new(),
    }
}

/// First object key anywhere inside `value` that cannot be a path segment.
pub fn find_invalid_key(value: &Value) -> Option<&str> {
    match value {
        Value::Object(map) => map.iter().find_map(|(key, child)| {
            if is_valid_key(key) {
                find_invalid_key(child)
            } else {
                Some(key.as_str())
            }
        }),
        Value::Array(items) => items.iter().find_map(find_invalid_key),
        _ => None,
    }
}

/// Write `value` at `segments` below `root`. `None` removes the node and
/// prunes parents left empty. `value` is expected to be normalized.
pub fn set_at(root: &mut Value, segments: &[String], value: Option<Value>) {
    let Some((first, rest)) = segments.split_first() else {
        *root = value.unwrap_or_else(|| Value::Object(Map::new()));
        return;
    };

    if value.is_none() && !matches!(root, Value::Object(_) | Value::Array(_)) {
        return;
    }

    let map = as_object_mut(root);
    if rest.is_empty() {
        match value {
            Some(value) => {
                map.insert(first.clone(), value);
            }
            None => {
                map.remove(first);
            }
        }
        return;
    }

    if value.is_none() && !map.contains_key(first) {
        return;
    }
    let child = map.entry(first.clone()).or_insert(Value::Null);
    set_at(child, rest, value);
    if is_empty_node(child) {
        map.remove(first);
    }
}

/// Coerce a node into an object so it can hold keyed children.
/// Array entries survive under their index keys.
fn as_object_mut(node: &mut Value) -> &mut Map<String, Value> {
    if let Value::Array(items) = node {
        let converted: Map<String, Value> = std::mem::take(items)
            .into_iter()
            .enumerate()
            .filter(|(_, v)| !v.is_null())
            .map(|(i, v)| (i.to_string(), v))
            .collect();
        *node = Value::Object(converted);
    } else if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("node was just converted to an object"),
    }
}
