//! # Sub-document queries
//!
//! Searching the elements of an embedded array (e.g. `comments` inside a post) cannot be
//! expressed as a plain find. A filter fragment built for the array elements is split into:
//!
//! - an element-wise predicate, evaluated by `$filter` against each element as `$$subdoc`
//!   (set membership, exact values, ids)
//! - a post-join predicate, applied by `$match` after the elements are unwound and their
//!   relations joined (partial text matches, ranges, fields of joined documents)
//!
//! and assembled into an aggregation pipeline:
//!
//! ```text
//! $match root -> $project {sub: $filter, count: $size} -> $unwind -> $skip -> $limit
//!             -> ($lookup, $project)* -> $match post-join
//! ```

use bson::{Bson, Document, doc, oid::ObjectId};

use crate::filtering::text_regex;
use crate::models::PopulateRequest;
use crate::options::SubOptions;
use crate::query::{CreateQueryOptions, Query};

/// Variable name of the current element inside `$filter`.
pub const ELEMENT: &str = "subdoc";

/// Top-level keys of an unwound item that are not joined relations.
const RESERVED_KEYS: [&str; 4] = ["_id", "count", "skip", "limit"];

/// A sub-document filter split into its two evaluation points.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubFilter {
    /// The `$filter` expression (`input`, `as`, `cond`).
    pub filter: Document,
    /// Values to match after unwinding, keyed by element field, not yet compiled.
    pub to_match: Document,
}

fn element_path(key: &str) -> String {
    format!("$${ELEMENT}.{key}")
}

/// Strings of 24 hex characters are element ids.
#[must_use]
pub fn to_id_value(value: &Bson) -> Bson {
    match value {
        Bson::String(s) if s.len() == 24 => ObjectId::parse_str(s)
            .map(Bson::ObjectId)
            .unwrap_or_else(|_| value.clone()),
        other => other.clone(),
    }
}

fn is_id_shaped(value: &str) -> bool {
    value.len() == 24 && ObjectId::parse_str(value).is_ok()
}

fn id_values(values: &[Bson]) -> Vec<Bson> {
    values.iter().map(to_id_value).collect()
}

/// Split a filter fragment for the elements of `sub`.
///
/// Logical keys (`$and`, `$or`, `$text`, ...) and array values cannot be evaluated per
/// element and are skipped.
#[must_use]
pub fn compile_sub_filter(sub_query: &Document, sub: &str) -> SubFilter {
    let mut conditions: Vec<Bson> = Vec::new();
    let mut to_match = Document::new();

    for (key, value) in sub_query {
        if key.starts_with('$') || matches!(value, Bson::Array(_)) {
            tracing::debug!(key = %key, sub = %sub, "Skipping key in sub-document filter");
            continue;
        }
        match value {
            Bson::Null => {}
            Bson::String(s) if s.is_empty() => {}
            Bson::String(s) if is_id_shaped(s) => {
                conditions.push(doc! { "$eq": [element_path(key), to_id_value(value)] }.into());
            }
            Bson::String(_) => {
                to_match.insert(key, value.clone());
            }
            Bson::Document(operators) => {
                if let Ok(values) = operators.get_array("$in") {
                    conditions.push(doc! { "$in": [element_path(key), id_values(values)] }.into());
                } else if let Ok(values) = operators.get_array("$nin") {
                    conditions.extend(values.iter().map(|v| {
                        Bson::from(doc! { "$ne": [element_path(key), to_id_value(v)] })
                    }));
                } else {
                    to_match.insert(key, value.clone());
                }
            }
            scalar => {
                conditions.push(doc! { "$eq": [element_path(key), scalar.clone()] }.into());
            }
        }
    }

    SubFilter {
        filter: doc! {
            "input": format!("${sub}"),
            "as": ELEMENT,
            "cond": { "$and": conditions },
        },
        to_match,
    }
}

/// Compile the post-join `$match`.
///
/// Keys whose first segment is a populated path keep their `<path>.<field>` form; all
/// others are element fields and become `<sub>.<key>`. Strings become case-insensitive
/// partial matches, operator objects are kept.
#[must_use]
pub fn compile_post_match(to_match: Document, sub: &str, populated: &[String]) -> Document {
    let mut compiled = Document::new();
    for (key, value) in to_match {
        let joined = key
            .split_once('.')
            .is_some_and(|(path, _)| populated.iter().any(|p| p == path));
        let target = if joined { key } else { format!("{sub}.{key}") };
        let value = match value {
            Bson::String(s) => text_regex(&s),
            other => other,
        };
        compiled.insert(target, value);
    }
    compiled
}

/// `$lookup` (and optional `$project`) stages for the requested relations allowed on `sub`.
#[must_use]
pub fn lookup_stages(options: &SubOptions, requests: &[PopulateRequest]) -> Vec<Document> {
    let sub = options.sub.as_str();
    let mut stages = Vec::new();
    let mut joined: Vec<&str> = Vec::new();

    for request in requests {
        let Some(rule) = options.rule(&request.path) else {
            continue;
        };
        stages.push(doc! {
            "$lookup": {
                "from": rule.lookup_collection(),
                "localField": format!("{sub}.{}", rule.path),
                "foreignField": "_id",
                "as": rule.path.clone(),
            }
        });

        if let Some(requested) = &request.select {
            let mut selected: Vec<&String> = rule
                .select
                .iter()
                .filter(|field| requested.contains(field))
                .collect();
            if selected.is_empty() {
                selected = rule.select.iter().collect();
            }
            let mut project = doc! { "_id": 1, sub: 1, "count": 1 };
            for path in &joined {
                project.insert(*path, 1);
            }
            let fields: Document = selected
                .into_iter()
                .map(|field| (field.clone(), Bson::Int32(1)))
                .collect();
            project.insert(&rule.path, fields);
            stages.push(doc! { "$project": project });
        }
        joined.push(&rule.path);
    }
    stages
}

/// Assemble the full sub-document search pipeline.
#[must_use]
pub fn build_pipeline(
    root_match: Document,
    sub: &str,
    sub_filter: SubFilter,
    window: (Option<u64>, Option<u64>),
    lookups: Vec<Document>,
    post_match: Document,
) -> Vec<Document> {
    let (skip, limit) = window;
    let filter = sub_filter.filter;
    let mut pipeline = vec![
        doc! { "$match": root_match },
        doc! {
            "$project": {
                sub: { "$filter": filter.clone() },
                "count": { "$size": { "$filter": filter } },
            }
        },
        doc! { "$unwind": format!("${sub}") },
    ];
    if let Some(skip) = skip.filter(|skip| *skip > 0) {
        pipeline.push(doc! { "$skip": to_bson_count(skip) });
    }
    if let Some(limit) = limit.filter(|limit| *limit > 0) {
        pipeline.push(doc! { "$limit": to_bson_count(limit) });
    }
    pipeline.extend(lookups);
    if !post_match.is_empty() {
        pipeline.push(doc! { "$match": post_match });
    }
    pipeline
}

fn to_bson_count(value: u64) -> Bson {
    i64::try_from(value).map_or(Bson::Int64(i64::MAX), Bson::Int64)
}

/// Search pipeline for the elements of `options.sub` inside documents matching `root_match`.
///
/// The query's document query (without root fragments) filters the elements; its populate
/// requests and skip/limit window apply to them.
pub fn search_pipeline(query: &mut Query, options: &SubOptions, root_match: Document) -> Vec<Document> {
    let sub = options.sub.as_str();
    let sub_query = query.create_query(CreateQueryOptions::new().no_root());
    let mut sub_filter = compile_sub_filter(&sub_query, sub);

    let populated: Vec<String> = query.populate().iter().map(|p| p.path.clone()).collect();
    let post_match = compile_post_match(std::mem::take(&mut sub_filter.to_match), sub, &populated);
    let lookups = lookup_stages(options, query.populate());

    build_pipeline(
        root_match,
        sub,
        sub_filter,
        (query.skip(), query.limit()),
        lookups,
        post_match,
    )
}

/// Flatten unwound pipeline items into sub-documents.
///
/// Each item's `sub` element becomes the result; joined relations are attached to it, taking
/// the first joined document. Returns the documents and the element count.
#[must_use]
pub fn flatten_results(items: Vec<Document>, sub: &str) -> (Vec<Document>, u64) {
    let mut count = 0;
    let mut data = Vec::with_capacity(items.len());

    for mut item in items {
        if let Some(total) = item.get("count").and_then(count_value) {
            count = total;
        }
        let mut element = match item.remove(sub) {
            Some(Bson::Document(element)) => element,
            _ => Document::new(),
        };
        for (key, value) in item {
            if RESERVED_KEYS.contains(&key.as_str()) {
                continue;
            }
            match value {
                Bson::Array(mut joined) => {
                    if !joined.is_empty() {
                        element.insert(key, joined.swap_remove(0));
                    }
                }
                other => {
                    element.insert(key, other);
                }
            }
        }
        data.push(element);
    }
    (data, count)
}

fn count_value(value: &Bson) -> Option<u64> {
    match value {
        Bson::Int32(n) => u64::try_from(*n).ok(),
        Bson::Int64(n) => u64::try_from(*n).ok(),
        _ => None,
    }
}
