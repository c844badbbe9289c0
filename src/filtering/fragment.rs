//! Combinators for filter fragments.
//!
//! A fragment is an ordered [`Document`] mapping field names (or logical operators such as
//! `$and`) to literals or operator objects. Fragments are only ever combined through the
//! functions here, so precedence stays explicit: [`merge`] for same-level key merging and
//! [`and`]/[`or`] for wrapping.

use bson::{Bson, Document};

pub const AND: &str = "$and";
pub const OR: &str = "$or";

/// AND-collapse a list of fragments: nothing gives `{}`, a single fragment is returned
/// unwrapped, anything more becomes `{$and: [...]}`.
#[must_use]
pub fn and(mut fragments: Vec<Document>) -> Document {
    match fragments.len() {
        0 => Document::new(),
        1 => fragments.remove(0),
        _ => wrap(AND, fragments),
    }
}

/// `{$or: [...]}`, keeping alternatives in the given order.
#[must_use]
pub fn or(alternatives: Vec<Document>) -> Document {
    wrap(OR, alternatives)
}

fn wrap(operator: &str, fragments: Vec<Document>) -> Document {
    let mut wrapped = Document::new();
    wrapped.insert(
        operator,
        fragments.into_iter().map(Bson::Document).collect::<Vec<_>>(),
    );
    wrapped
}

/// True when every key of the document is an operator (`$gte`, `$in`, ...).
#[must_use]
pub fn is_operator_object(document: &Document) -> bool {
    !document.is_empty() && document.keys().all(|key| key.starts_with('$'))
}

/// Deep-merge `source` into `target`.
///
/// Later sources win on key collision, except when both sides hold operator objects: those
/// are unioned operator by operator (e.g. `{$gte: a}` + `{$lt: b}` → `{$gte: a, $lt: b}`).
pub fn merge(target: &mut Document, source: Document) {
    for (key, value) in source {
        match (target.get_mut(&key), value) {
            (Some(Bson::Document(existing)), Bson::Document(incoming))
                if is_operator_object(existing) && is_operator_object(&incoming) =>
            {
                for (operator, operand) in incoming {
                    existing.insert(operator, operand);
                }
            }
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}

/// Keep only the listed top-level fields of a fragment, in fragment order.
#[must_use]
pub fn project(fragment: &Document, fields: &[String]) -> Document {
    fragment
        .iter()
        .filter(|(key, _)| fields.iter().any(|field| field == *key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}
