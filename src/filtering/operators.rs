//! Compilation of prefixed parameter keys into filter operators.
//!
//! Keys are classified by an ordered rule list, first match wins:
//!
//! | key              | fragment                                   |
//! |------------------|--------------------------------------------|
//! | `!field`         | `{field: {$ne: value}}`                    |
//! | `$gte_field` ... | `{field: {$gte: Date}}` (merged per field) |
//! | `$in_field`      | `{field: {$in: [..]}}`                     |
//! | `$field`         | `{field: {$regex: /value/i}}`              |
//!
//! Anything else is a literal field and is left for the sanitizer.

use bson::{Bson, Document, Regex};
use chrono::{DateTime, NaiveDate, NaiveDateTime};

use super::fragment;
use super::params::{scalar_to_string, split_values};

const OFFSET_DATE_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%dT%H:%M:%S%z",
    "%Y-%m-%dT%H:%M%z",
];
const DATE_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
];
const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%m.%d.%Y",
    "%m/%d/%Y",
    "%m-%d-%Y",
    "%b %d %Y",
    "%b %d, %Y",
    "%a %b %d %Y",
    "%d %b %Y",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOperator {
    Gte,
    Gt,
    Lte,
    Lt,
}

impl RangeOperator {
    fn from_operation(operation: &str) -> Option<Self> {
        match operation {
            "$gte" => Some(Self::Gte),
            "$gt" => Some(Self::Gt),
            "$lte" => Some(Self::Lte),
            "$lt" => Some(Self::Lt),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gte => "$gte",
            Self::Gt => "$gt",
            Self::Lte => "$lte",
            Self::Lt => "$lt",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOperator {
    In,
    Nin,
}

impl SetOperator {
    fn from_operation(operation: &str) -> Option<Self> {
        match operation {
            "$in" => Some(Self::In),
            "$nin" => Some(Self::Nin),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::In => "$in",
            Self::Nin => "$nin",
        }
    }
}

/// A compiled operator on one field.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    NotEqual {
        field: String,
        value: String,
    },
    Range {
        field: String,
        operator: RangeOperator,
        value: Bson,
    },
    Set {
        field: String,
        operator: SetOperator,
        values: Vec<String>,
    },
    Match {
        field: String,
        pattern: String,
    },
}

impl Operation {
    #[must_use]
    pub fn field(&self) -> &str {
        match self {
            Self::NotEqual { field, .. }
            | Self::Range { field, .. }
            | Self::Set { field, .. }
            | Self::Match { field, .. } => field,
        }
    }

    /// Render as a single-field fragment.
    #[must_use]
    pub fn to_fragment(&self) -> Document {
        let condition = match self {
            Self::NotEqual { value, .. } => bson::doc! { "$ne": value.as_str() },
            Self::Range {
                operator, value, ..
            } => {
                let mut condition = Document::new();
                condition.insert(operator.as_str(), value.clone());
                condition
            }
            Self::Set {
                operator, values, ..
            } => {
                let mut condition = Document::new();
                condition.insert(operator.as_str(), values.clone());
                condition
            }
            Self::Match { pattern, .. } => bson::doc! { "$regex": text_regex(pattern) },
        };
        let mut fragment = Document::new();
        fragment.insert(self.field(), condition);
        fragment
    }

    /// Add this operation to the fragment being compiled. Ranges on a field that already
    /// has a range are merged; every other operation replaces what was there.
    pub fn apply(&self, compiled: &mut Document) {
        match self {
            Self::Range { .. } => fragment::merge(compiled, self.to_fragment()),
            _ => {
                for (key, value) in self.to_fragment() {
                    compiled.insert(key, value);
                }
            }
        }
    }
}

/// Case-insensitive regular expression matching `text` literally.
#[must_use]
pub fn text_regex(text: &str) -> Bson {
    Bson::RegularExpression(Regex {
        pattern: regex::escape(text),
        options: "i".to_string(),
    })
}

/// Parse a date the way loosely formatted query strings send them: RFC 3339, ISO variants with
/// or without seconds and offset (`datetime-local` inputs), slashed and dotted dates, and
/// textual months (`Jan 15 2022`). Values without an offset are UTC. Unparseable input is
/// passed through unchanged as a string.
#[must_use]
pub fn parse_date(value: &str) -> Bson {
    let value = value.trim();
    let millis = DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.timestamp_millis())
        .ok()
        .or_else(|| {
            OFFSET_DATE_TIME_FORMATS
                .iter()
                .find_map(|format| DateTime::parse_from_str(value, format).ok())
                .map(|dt| dt.timestamp_millis())
        })
        .or_else(|| {
            DATE_TIME_FORMATS
                .iter()
                .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
                .map(|dt| dt.and_utc().timestamp_millis())
        })
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|format| NaiveDate::parse_from_str(value, format).ok())
                .and_then(|date| date.and_hms_opt(0, 0, 0))
                .map(|dt| dt.and_utc().timestamp_millis())
        });

    match millis {
        Some(millis) => Bson::DateTime(bson::DateTime::from_millis(millis)),
        None => {
            tracing::debug!(value = %value, "Unparseable date in range filter, passing through");
            Bson::String(value.to_string())
        }
    }
}

type Extractor = fn(&str, &Bson) -> Result<Option<Operation>, String>;

struct Rule {
    name: &'static str,
    matches: fn(&str) -> bool,
    extract: Extractor,
}

const RULES: &[Rule] = &[
    Rule {
        name: "negation",
        matches: |key| key.starts_with('!'),
        extract: extract_not_equal,
    },
    Rule {
        name: "range",
        matches: |key| ["$gte_", "$gt_", "$lte_", "$lt_"].iter().any(|p| key.starts_with(p)),
        extract: extract_range,
    },
    Rule {
        name: "set",
        matches: |key| key.starts_with("$in_") || key.starts_with("$nin_"),
        extract: extract_set,
    },
    Rule {
        name: "match",
        matches: |key| key.starts_with('$'),
        extract: extract_match,
    },
];

/// `$gte_created_at` → (`$gte`, `created_at`).
fn split_key(key: &str) -> (&str, &str) {
    key.split_once('_').unwrap_or((key, ""))
}

fn non_empty(field: &str) -> Option<String> {
    (!field.is_empty()).then(|| field.to_string())
}

fn extract_not_equal(key: &str, value: &Bson) -> Result<Option<Operation>, String> {
    let value = scalar_to_string(value).ok_or("negation needs a scalar value")?;
    Ok(non_empty(&key[1..]).map(|field| Operation::NotEqual { field, value }))
}

fn extract_range(key: &str, value: &Bson) -> Result<Option<Operation>, String> {
    let (operation, field) = split_key(key);
    let operator = RangeOperator::from_operation(operation)
        .ok_or_else(|| format!("unknown range operator {operation}"))?;
    let value = scalar_to_string(value).ok_or("range needs a string value")?;
    Ok(non_empty(field).map(|field| Operation::Range {
        field,
        operator,
        value: parse_date(&value),
    }))
}

fn extract_set(key: &str, value: &Bson) -> Result<Option<Operation>, String> {
    let (operation, field) = split_key(key);
    let operator = SetOperator::from_operation(operation)
        .ok_or_else(|| format!("unknown set operator {operation}"))?;
    let value = scalar_to_string(value).ok_or("set membership needs a string value")?;
    Ok(non_empty(field).map(|field| Operation::Set {
        field,
        operator,
        values: split_values(&value),
    }))
}

fn extract_match(key: &str, value: &Bson) -> Result<Option<Operation>, String> {
    let pattern = scalar_to_string(value).ok_or("match needs a string value")?;
    Ok(non_empty(&key[1..]).map(|field| Operation::Match { field, pattern }))
}

/// Compile every operator key of `raw` into one fragment, removing the consumed keys.
///
/// `$`-prefixed keys whose value is not a string are left untouched so the sanitizer can
/// neutralise them. Empty values and rules that fail contribute nothing.
pub fn compile_operations(raw: &mut Document) -> Document {
    let mut compiled = Document::new();
    let keys: Vec<String> = raw.keys().cloned().collect();

    for key in keys {
        let Some(rule) = RULES.iter().find(|rule| (rule.matches)(&key)) else {
            continue;
        };
        if key.starts_with('$') && !matches!(raw.get(&key), Some(Bson::String(_))) {
            continue;
        }
        let Some(value) = raw.remove(&key) else {
            continue;
        };
        if matches!(&value, Bson::String(s) if s.is_empty()) {
            continue;
        }

        match (rule.extract)(&key, &value) {
            Ok(Some(operation)) => operation.apply(&mut compiled),
            Ok(None) => {}
            Err(reason) => {
                tracing::debug!(key = %key, rule = rule.name, reason = %reason, "Skipping operator");
            }
        }
    }

    compiled
}
