//! Custom-type resolution.
//!
//! Server defaults may define named schema fragments whose `type` keyword can
//! itself reference another fragment. Resolution substitutes every reference
//! with the underlying standard types and folds the fragment's sibling
//! keywords into the referencing node.
//!
//! A reference that still names a custom type after substitution is
//! re-resolved at the same position. Each position gets a bounded number of
//! re-resolutions (the count of distinct custom-type names); once exhausted
//! the residual name stays in place, so malformed cyclic definitions surface
//! as validator compile failures instead of hanging the compiler.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::merge::deep_merge;

/// Keywords whose values contain nested schemas to descend into.
const NESTED_LISTS: [&str; 3] = ["oneOf", "anyOf", "allOf"];

/// Resolves the custom-type definitions against themselves.
///
/// Returns a map in which every fragment's `type` refers only to standard
/// type names (or to residual names when the definitions are cyclic).
#[must_use]
pub fn resolve_self(types: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
    let mut resolved = types.clone();

    // Each pass substitutes one level of indirection; chains can be at most
    // as long as the number of definitions.
    for _ in 0..=types.len() {
        let snapshot = resolved.clone();
        let mut changed = false;
        for fragment in resolved.values_mut() {
            if let Value::Object(node) = fragment {
                changed |= resolve_node(node, &snapshot);
            }
        }
        if !changed {
            break;
        }
    }

    resolved
}

/// Resolves every custom-type reference inside `schema`.
///
/// Descends into `properties`, `items`, `oneOf`, `anyOf`, and `allOf`. The
/// `types` map must already be self-resolved (see [`resolve_self`]).
pub fn resolve(schema: &mut Value, types: &BTreeMap<String, Value>) {
    if types.is_empty() {
        return;
    }
    walk(schema, types);
}

fn walk(value: &mut Value, types: &BTreeMap<String, Value>) {
    let Value::Object(node) = value else {
        return;
    };

    resolve_node(node, types);

    if let Some(Value::Object(properties)) = node.get_mut("properties") {
        for property in properties.values_mut() {
            walk(property, types);
        }
    }
    if let Some(items) = node.get_mut("items") {
        walk(items, types);
    }
    for keyword in NESTED_LISTS {
        if let Some(Value::Array(alternatives)) = node.get_mut(keyword) {
            for alternative in alternatives.iter_mut() {
                walk(alternative, types);
            }
        }
    }
}

/// Rewrites the `type` keyword of one node, folding in fragment siblings.
///
/// Returns true when anything changed.
fn resolve_node(node: &mut Map<String, Value>, types: &BTreeMap<String, Value>) -> bool {
    let mut entries = match node.get("type") {
        Some(Value::String(name)) => vec![name.clone()],
        Some(Value::Array(list)) => list
            .iter()
            .filter_map(|entry| entry.as_str().map(str::to_string))
            .collect(),
        _ => return false,
    };

    let budget = types.len();
    let mut rewinds: Vec<usize> = vec![0; entries.len()];
    let mut changed = false;
    let mut index = 0;

    while index < entries.len() {
        let Some(fragment) = types.get(&entries[index]) else {
            index += 1;
            continue;
        };
        let Value::Object(fragment_node) = fragment else {
            index += 1;
            continue;
        };
        if rewinds[index] >= budget {
            // Malformed cycle: leave the residual name for the compiler.
            index += 1;
            continue;
        }
        rewinds[index] += 1;

        let replacement = match fragment_node.get("type") {
            Some(Value::String(name)) => vec![name.clone()],
            Some(Value::Array(list)) => list
                .iter()
                .filter_map(|entry| entry.as_str().map(str::to_string))
                .collect(),
            _ => {
                // A fragment without a type cannot substitute anything.
                index += 1;
                continue;
            }
        };

        merge_siblings(node, fragment_node);
        let rewind_count = rewinds[index];
        entries.splice(index..=index, replacement.iter().cloned());
        rewinds.splice(index..=index, replacement.iter().map(|_| rewind_count));
        changed = true;
        // Do not advance: the spliced entry may itself be a custom name.
    }

    dedup_preserving_order(&mut entries);
    let rewritten = if entries.len() == 1 {
        Value::String(entries.remove(0))
    } else {
        Value::Array(entries.into_iter().map(Value::String).collect())
    };
    if node.get("type") != Some(&rewritten) {
        node.insert("type".to_string(), rewritten);
        changed = true;
    }

    changed
}

/// Copies fragment keywords into the node without overriding its own values.
///
/// Scalar keywords only land when absent; object-valued keywords deep-merge
/// with the node's value winning.
fn merge_siblings(node: &mut Map<String, Value>, fragment: &Map<String, Value>) {
    for (keyword, fragment_value) in fragment {
        if keyword == "type" {
            continue;
        }
        match node.get(keyword) {
            None => {
                node.insert(keyword.clone(), fragment_value.clone());
            }
            Some(node_value @ Value::Object(_)) => {
                let merged = deep_merge(fragment_value, node_value);
                node.insert(keyword.clone(), merged);
            }
            Some(_) => {}
        }
    }
}

fn dedup_preserving_order(entries: &mut Vec<String>) {
    let mut seen = Vec::new();
    entries.retain(|entry| {
        if seen.contains(entry) {
            false
        } else {
            seen.push(entry.clone());
            true
        }
    });
}
