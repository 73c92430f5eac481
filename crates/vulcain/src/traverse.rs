// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Walks a JSON document alongside a [`SelectorTree`], pruning and rewriting it

use serde_json::{Map, Value};

use crate::selector::{DirectiveKind, Node, SelectorTree};

/// Builds a pruned/rewritten copy of `document`.
///
/// When the tree carries a `fields` selection, only members leading to a selected node
/// are kept; the subtree below a fields-selected node is kept whole. Members leading to
/// a preload selection are kept as well, so requested relations stay in the document.
/// Pruned array elements are dropped from the end of the array and replaced by `null`
/// elsewhere, so that pointers into the pruned document still address the same elements.
///
/// `resolve` is called, in document order, for every string whose node is selected by
/// `preload`. Returning `Some` replaces the string in the output; `None` keeps it.
pub fn rewrite<F>(document: &Value, tree: &SelectorTree, mut resolve: F) -> Value
where
    F: FnMut(&Node, &str) -> Option<String>,
{
    let root = tree.root();
    let prune = tree.fields_active() && !root.is_selected(DirectiveKind::Fields);
    walk(document, Some(root), tree, prune, &mut resolve)
}

fn walk<F>(
    value: &Value,
    node: Option<&Node>,
    tree: &SelectorTree,
    prune: bool,
    resolve: &mut F,
) -> Value
where
    F: FnMut(&Node, &str) -> Option<String>,
{
    match value {
        Value::Object(members) => {
            let mut rewritten = Map::new();
            for (key, member) in members {
                if let Some(member) = walk_member(member, node, key, tree, prune, resolve) {
                    rewritten.insert(key.clone(), member);
                }
            }
            Value::Object(rewritten)
        }
        Value::Array(elements) => {
            let mut rewritten: Vec<Option<Value>> = elements
                .iter()
                .enumerate()
                .map(|(index, element)| {
                    walk_member(element, node, &index.to_string(), tree, prune, resolve)
                })
                .collect();
            // pruned elements followed by kept ones become nulls so indices stay stable
            while rewritten.last().is_some_and(Option::is_none) {
                rewritten.pop();
            }
            Value::Array(
                rewritten
                    .into_iter()
                    .map(|element| element.unwrap_or(Value::Null))
                    .collect(),
            )
        }
        Value::String(raw) => match node {
            Some(node) if node.is_selected(DirectiveKind::Preload) => {
                resolve(node, raw).map_or_else(|| value.clone(), Value::String)
            }
            _ => value.clone(),
        },
        Value::Null | Value::Bool(_) | Value::Number(_) => value.clone(),
    }
}

/// Rewrites one object member or array element, or returns `None` if it is pruned.
fn walk_member<F>(
    member: &Value,
    parent: Option<&Node>,
    segment: &str,
    tree: &SelectorTree,
    prune: bool,
    resolve: &mut F,
) -> Option<Value>
where
    F: FnMut(&Node, &str) -> Option<String>,
{
    let child = parent.and_then(|parent| parent.match_child(segment));
    if !prune {
        return Some(walk(member, child, tree, false, resolve));
    }

    let child = child.filter(|child| {
        tree.is_selected_for_fields(child) || child.has_in_subtree(DirectiveKind::Preload)
    })?;
    let prune_below = !child.is_selected(DirectiveKind::Fields);
    Some(walk(member, Some(child), tree, prune_below, resolve))
}
