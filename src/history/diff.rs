//! Structural deltas between documents.
//!
//! Deltas use the jsondiffpatch shape so stored history stays readable by existing tooling:
//!
//! | change          | delta                                   |
//! |-----------------|-----------------------------------------|
//! | added           | `[new]`                                 |
//! | modified        | `[old, new]`                            |
//! | removed         | `[old, 0, 0]`                           |
//! | nested document | nested delta                            |
//! | array           | `{_t: "a", "<i>": delta, "_<i>": [old, 0, 0]}` |
//!
//! Arrays are compared index by index: common indices carry modifications, a longer new array
//! adds at the tail and a shorter one removes from the tail.

use bson::{Bson, Document};
use std::fmt;

const ARRAY_MARKER_KEY: &str = "_t";
const ARRAY_MARKER: &str = "a";

/// A delta that does not have the expected shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaError {
    pub path: String,
    pub reason: &'static str,
}

impl fmt::Display for DeltaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid delta at '{}': {}", self.path, self.reason)
    }
}

impl std::error::Error for DeltaError {}

fn invalid(path: &str, reason: &'static str) -> DeltaError {
    DeltaError {
        path: path.to_string(),
        reason,
    }
}

/// Delta turning `old` into `new`, `None` when they are equal.
#[must_use]
pub fn diff(old: &Document, new: &Document) -> Option<Document> {
    let mut delta = Document::new();
    for (key, old_value) in old {
        match new.get(key) {
            Some(new_value) => {
                if let Some(change) = diff_value(old_value, new_value) {
                    delta.insert(key, change);
                }
            }
            None => {
                delta.insert(key, removed(old_value));
            }
        }
    }
    for (key, new_value) in new {
        if !old.contains_key(key) {
            delta.insert(key, added(new_value));
        }
    }
    (!delta.is_empty()).then_some(delta)
}

fn diff_value(old: &Bson, new: &Bson) -> Option<Bson> {
    if old == new {
        return None;
    }
    match (old, new) {
        (Bson::Document(old), Bson::Document(new)) => diff(old, new).map(Bson::Document),
        (Bson::Array(old), Bson::Array(new)) => diff_array(old, new).map(Bson::Document),
        _ => Some(Bson::Array(vec![old.clone(), new.clone()])),
    }
}

fn diff_array(old: &[Bson], new: &[Bson]) -> Option<Document> {
    let mut delta = Document::new();
    for (index, (old_value, new_value)) in old.iter().zip(new).enumerate() {
        if let Some(change) = diff_value(old_value, new_value) {
            delta.insert(index.to_string(), change);
        }
    }
    for (index, new_value) in new.iter().enumerate().skip(old.len()) {
        delta.insert(index.to_string(), added(new_value));
    }
    for (index, old_value) in old.iter().enumerate().skip(new.len()) {
        delta.insert(format!("_{index}"), removed(old_value));
    }
    if delta.is_empty() {
        return None;
    }
    delta.insert(ARRAY_MARKER_KEY, ARRAY_MARKER);
    Some(delta)
}

fn added(value: &Bson) -> Bson {
    Bson::Array(vec![value.clone()])
}

fn removed(value: &Bson) -> Bson {
    Bson::Array(vec![value.clone(), Bson::Int32(0), Bson::Int32(0)])
}

/// One entry of a delta.
enum Change<'a> {
    Added(&'a Bson),
    Modified(&'a Bson, &'a Bson),
    Removed(&'a Bson),
    Nested(&'a Document),
}

fn change<'a>(path: &str, delta: &'a Bson) -> Result<Change<'a>, DeltaError> {
    match delta {
        Bson::Array(items) => match items.as_slice() {
            [new] => Ok(Change::Added(new)),
            [old, new] => Ok(Change::Modified(old, new)),
            [old, _, _] => Ok(Change::Removed(old)),
            _ => Err(invalid(path, "unexpected delta array length")),
        },
        Bson::Document(nested) => Ok(Change::Nested(nested)),
        _ => Err(invalid(path, "delta entries must be arrays or documents")),
    }
}

fn is_array_delta(delta: &Document) -> bool {
    matches!(delta.get(ARRAY_MARKER_KEY), Some(Bson::String(marker)) if marker == ARRAY_MARKER)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

/// Apply `delta` to `target`, turning the old document into the new one.
///
/// # Errors
///
/// Returns a [`DeltaError`] when the delta is malformed or does not fit `target`.
pub fn patch(target: &mut Document, delta: &Document) -> Result<(), DeltaError> {
    apply_document(target, delta, Direction::Forward, "")
}

/// Revert `delta` on `target`, turning the new document back into the old one.
///
/// # Errors
///
/// Returns a [`DeltaError`] when the delta is malformed or does not fit `target`.
pub fn unpatch(target: &mut Document, delta: &Document) -> Result<(), DeltaError> {
    apply_document(target, delta, Direction::Reverse, "")
}

fn child_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

fn apply_document(
    target: &mut Document,
    delta: &Document,
    direction: Direction,
    path: &str,
) -> Result<(), DeltaError> {
    for (key, entry) in delta {
        let path = child_path(path, key);
        match (change(&path, entry)?, direction) {
            (Change::Added(value), Direction::Forward)
            | (Change::Modified(_, value), Direction::Forward)
            | (Change::Modified(value, _), Direction::Reverse)
            | (Change::Removed(value), Direction::Reverse) => {
                target.insert(key, value.clone());
            }
            (Change::Added(_), Direction::Reverse) | (Change::Removed(_), Direction::Forward) => {
                target.remove(key);
            }
            (Change::Nested(nested), _) => {
                let value = target
                    .get_mut(key)
                    .ok_or_else(|| invalid(&path, "nested delta for a missing field"))?;
                apply_nested(value, nested, direction, &path)?;
            }
        }
    }
    Ok(())
}

fn apply_nested(
    value: &mut Bson,
    delta: &Document,
    direction: Direction,
    path: &str,
) -> Result<(), DeltaError> {
    match value {
        Bson::Array(items) if is_array_delta(delta) => apply_array(items, delta, direction, path),
        Bson::Document(document) if !is_array_delta(delta) => {
            apply_document(document, delta, direction, path)
        }
        _ => Err(invalid(path, "delta does not match the value type")),
    }
}

fn apply_array(
    items: &mut Vec<Bson>,
    delta: &Document,
    direction: Direction,
    path: &str,
) -> Result<(), DeltaError> {
    let mut additions: Vec<(usize, &Bson)> = Vec::new();
    let mut removals: Vec<(usize, &Bson)> = Vec::new();
    let mut modifications: Vec<(usize, Change<'_>)> = Vec::new();

    for (key, entry) in delta {
        if key == ARRAY_MARKER_KEY {
            continue;
        }
        let entry_path = child_path(path, key);
        let (removed_side, index) = match key.strip_prefix('_') {
            Some(index) => (true, index),
            None => (false, key.as_str()),
        };
        let index: usize = index
            .parse()
            .map_err(|_| invalid(&entry_path, "array delta keys must be indices"))?;
        match change(&entry_path, entry)? {
            Change::Removed(old) if removed_side => removals.push((index, old)),
            Change::Added(new) if !removed_side => additions.push((index, new)),
            other if !removed_side => modifications.push((index, other)),
            _ => return Err(invalid(&entry_path, "unexpected change on the removed side")),
        }
    }

    let (mut inserts, mut deletes) = match direction {
        Direction::Forward => (additions, removals),
        Direction::Reverse => (removals, additions),
    };

    deletes.sort_by(|a, b| b.0.cmp(&a.0));
    for (index, _) in deletes {
        if index < items.len() {
            items.remove(index);
        }
    }
    for (index, change) in modifications {
        let item = items
            .get_mut(index)
            .ok_or_else(|| invalid(path, "array delta index out of range"))?;
        match (change, direction) {
            (Change::Modified(_, value), Direction::Forward)
            | (Change::Modified(value, _), Direction::Reverse) => *item = value.clone(),
            (Change::Nested(nested), _) => {
                apply_nested(item, nested, direction, &child_path(path, &index.to_string()))?;
            }
            _ => return Err(invalid(path, "unexpected array modification")),
        }
    }
    inserts.sort_by_key(|(index, _)| *index);
    for (index, value) in inserts {
        items.insert(index.min(items.len()), value.clone());
    }
    Ok(())
}
