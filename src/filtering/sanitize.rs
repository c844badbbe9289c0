//! Neutralisation of operator injection in literal filter values.
//!
//! A key that starts with `$` or contains `.` could be read by the store as an operator or a
//! path traversal. Such keys are rewritten (leading `$` and every `.` become `_`) at any depth,
//! never rejected and never dropped.

use bson::{Bson, Document};

pub const REPLACE_WITH: &str = "_";

/// True if the key would be interpreted by the store.
#[must_use]
pub fn is_forbidden_key(key: &str) -> bool {
    key.starts_with('$') || key.contains('.')
}

/// Rewrite a single key: leading `$` and every `.` become [`REPLACE_WITH`].
#[must_use]
pub fn sanitize_key(key: &str) -> String {
    let key = match key.strip_prefix('$') {
        Some(rest) => format!("{REPLACE_WITH}{rest}"),
        None => key.to_string(),
    };
    key.replace('.', REPLACE_WITH)
}

/// Recursively sanitize every document key inside a value.
#[must_use]
pub fn sanitize_value(value: Bson) -> Bson {
    match value {
        Bson::Document(document) => Bson::Document(sanitize_document(document)),
        Bson::Array(items) => Bson::Array(items.into_iter().map(sanitize_value).collect()),
        other => other,
    }
}

/// Recursively sanitize the keys of a document.
#[must_use]
pub fn sanitize_document(document: Document) -> Document {
    document
        .into_iter()
        .map(|(key, value)| {
            let key = if is_forbidden_key(&key) {
                let replaced = sanitize_key(&key);
                tracing::debug!(key = %key, replaced = %replaced, "Sanitized filter key");
                replaced
            } else {
                key
            };
            (key, sanitize_value(value))
        })
        .collect()
}

/// Literal field filter from the remaining parameters: empty strings mean "not provided" and
/// are dropped, everything else is sanitized.
#[must_use]
pub fn sanitize_literals(raw: Document) -> Document {
    let provided: Document = raw
        .into_iter()
        .filter(|(_, value)| !matches!(value, Bson::String(s) if s.is_empty()))
        .collect();
    sanitize_document(provided)
}
