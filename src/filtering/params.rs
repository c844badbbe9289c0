//! Extraction of the well-known pagination, sort, select, populate and text keys.
//!
//! Every step removes the keys it consumed from the raw parameter document and falls back to
//! its own defaults when the input is malformed; nothing here returns an error.

use bson::{Bson, Document};

use crate::models::PopulateRequest;

pub const DEFAULT_SKIP: u64 = 0;
pub const DEFAULT_LIMIT: u64 = 20;

const POPULATE_SPLIT: char = ';';
const POPULATE_PATH_SPLIT: char = ':';

/// Pagination window. `skip` and `limit` are both `None` when `page=0` asked for everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub skip: Option<u64>,
    pub limit: Option<u64>,
    pub page: Option<u64>,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            skip: Some(DEFAULT_SKIP),
            limit: Some(DEFAULT_LIMIT),
            page: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SortSelect {
    pub sort: Vec<String>,
    pub select: Vec<String>,
}

/// Everything the parameter parser pulls out of a raw parameter document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedParams {
    pub pagination: Pagination,
    pub sort: Vec<String>,
    pub select: Vec<String>,
    pub populate: Vec<PopulateRequest>,
    pub text: Option<String>,
}

/// Run every extraction step over `raw`, leaving only filter keys behind.
pub fn parse_params(raw: &mut Document) -> ParsedParams {
    let pagination = parse_skip_limit(raw);
    let SortSelect { sort, select } = parse_sort_select(raw);
    let populate = parse_populate(raw);
    let text = parse_text(raw);
    ParsedParams {
        pagination,
        sort,
        select,
        populate,
        text,
    }
}

/// Split on commas and whitespace, dropping empty tokens.
#[must_use]
pub fn split_values(value: &str) -> Vec<String> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

/// JavaScript-style truthiness of a raw parameter value.
#[must_use]
pub fn is_truthy(value: &Bson) -> bool {
    match value {
        Bson::Null | Bson::Undefined => false,
        Bson::String(s) => !s.is_empty(),
        Bson::Boolean(b) => *b,
        Bson::Int32(n) => *n != 0,
        Bson::Int64(n) => *n != 0,
        Bson::Double(n) => *n != 0.0 && !n.is_nan(),
        _ => true,
    }
}

/// String form of a scalar parameter value; `None` for documents, arrays and null.
#[must_use]
pub fn scalar_to_string(value: &Bson) -> Option<String> {
    match value {
        Bson::String(s) => Some(s.clone()),
        Bson::Boolean(b) => Some(b.to_string()),
        Bson::Int32(n) => Some(n.to_string()),
        Bson::Int64(n) => Some(n.to_string()),
        Bson::Double(n) if n.is_finite() && n.fract() == 0.0 => Some(format!("{n:.0}")),
        Bson::Double(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Integer value of a parameter, read the way `parseInt(value, 10)` reads strings: optional
/// leading whitespace and sign followed by at least one digit, trailing garbage ignored.
#[must_use]
pub fn parse_int(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(n) => Some(i64::from(*n)),
        Bson::Int64(n) => Some(*n),
        #[allow(clippy::cast_possible_truncation)]
        Bson::Double(n) if n.is_finite() => Some(n.trunc() as i64),
        Bson::String(s) => parse_leading_int(s),
        _ => None,
    }
}

fn parse_leading_int(s: &str) -> Option<i64> {
    let trimmed = s.trim_start();
    let (negative, rest) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };
    let digits_end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    let number: i64 = rest[..digits_end].parse().ok()?;
    Some(if negative { -number } else { number })
}

/// Non-negative count from a parameter, `default` when absent, empty, malformed or negative.
fn to_valid_count(value: Option<&Bson>, default: u64) -> u64 {
    value
        .and_then(parse_int)
        .and_then(|n| u64::try_from(n).ok())
        .unwrap_or(default)
}

/// Resolve `skip`, `limit` and `page`.
///
/// `page=N` (N > 0) overrides skip with `limit * (N - 1)`; `page=0` clears both skip and limit.
pub fn parse_skip_limit(raw: &mut Document) -> Pagination {
    let mut pagination = Pagination::default();

    if let Some(skip) = raw.remove("skip") {
        pagination.skip = Some(to_valid_count(Some(&skip), DEFAULT_SKIP));
    }
    let mut limit = DEFAULT_LIMIT;
    if let Some(value) = raw.remove("limit") {
        limit = to_valid_count(Some(&value), DEFAULT_LIMIT);
        pagination.limit = Some(limit);
    }
    if let Some(value) = raw.remove("page") {
        let page = to_valid_count(Some(&value), 0);
        if page == 0 {
            pagination.skip = None;
            pagination.limit = None;
        } else {
            pagination.skip = Some(limit.saturating_mul(page - 1));
            pagination.page = Some(page);
        }
    }
    pagination
}

fn split_param(value: &Bson) -> Result<Vec<String>, String> {
    if !is_truthy(value) {
        return Ok(Vec::new());
    }
    scalar_to_string(value)
        .map(|s| split_values(&s))
        .ok_or_else(|| format!("expected a string, got {:?}", value.element_type()))
}

/// Resolve `sort` and `select` token lists. A malformed value resets both.
pub fn parse_sort_select(raw: &mut Document) -> SortSelect {
    let sort = raw.remove("sort");
    let select = raw.remove("select");

    let parsed = || -> Result<SortSelect, String> {
        Ok(SortSelect {
            sort: sort.as_ref().map(split_param).transpose()?.unwrap_or_default(),
            select: select.as_ref().map(split_param).transpose()?.unwrap_or_default(),
        })
    };
    parsed().unwrap_or_else(|reason| {
        tracing::debug!(reason = %reason, "Ignoring malformed sort/select parameters");
        SortSelect::default()
    })
}

/// Resolve `$populate` (checked first) or `populate` into populate requests.
pub fn parse_populate(raw: &mut Document) -> Vec<PopulateRequest> {
    let dollar = raw.remove("$populate");
    let plain = raw.remove("populate");
    let Some(value) = dollar
        .into_iter()
        .chain(plain)
        .find(is_truthy)
    else {
        return Vec::new();
    };
    let Some(value) = scalar_to_string(&value) else {
        tracing::debug!("Ignoring non-string populate parameter");
        return Vec::new();
    };

    value
        .split(POPULATE_SPLIT)
        .filter(|group| !group.is_empty())
        .filter_map(|group| {
            let mut parts = group.split(POPULATE_PATH_SPLIT);
            let path = parts.next().unwrap_or_default();
            if path.is_empty() {
                return None;
            }
            let select = parts
                .next()
                .filter(|selects| !selects.is_empty())
                .map(split_values);
            Some(PopulateRequest {
                path: path.to_string(),
                select,
            })
        })
        .collect()
}

/// Take the full-text search term from `$text`, or from the deprecated `text` alias.
pub fn parse_text(raw: &mut Document) -> Option<String> {
    let value = match raw.remove("$text") {
        Some(value) => Some(value),
        None => {
            let legacy = raw.remove("text");
            if legacy.is_some() {
                tracing::debug!("`text` parameter is deprecated, use `$text`");
            }
            legacy
        }
    };
    value
        .filter(is_truthy)
        .and_then(|v| scalar_to_string(&v))
}
