use bson::Document;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

/// A relation-expansion request parsed from `populate=path:field,field;other`.
///
/// `select` is `None` when the request carried no `:` section, which means "use the
/// configured selection for this path".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopulateRequest {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub select: Option<Vec<String>>,
}

impl PopulateRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            select: None,
        }
    }

    #[must_use]
    pub fn with_select<I, S>(mut self, select: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select = Some(select.into_iter().map(Into::into).collect());
        self
    }
}

/// A populate request resolved against the allow-list, ready for the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopulateSpec {
    pub path: String,
    #[serde(default)]
    pub select: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub populate: Vec<PopulateSpec>,
    /// Collection/model the path refers to, when configured explicitly.
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl PopulateSpec {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

/// Store-level modifiers produced by the options binding layer.
///
/// `projection` carries execution metadata such as the text relevance score and the
/// one-shot projection override; `select` is the field inclusion/exclusion list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub skip: Option<u64>,
    pub limit: Option<u64>,
    pub sort: Option<Document>,
    pub select: Option<Vec<String>>,
    pub projection: Option<Document>,
    pub populate: Vec<PopulateSpec>,
}

impl FindOptions {
    /// Selection rendered as a projection document (`name` → 1, `-name` → 0).
    #[must_use]
    pub fn select_document(&self) -> Option<Document> {
        let select = self.select.as_ref()?;
        let mut projection = Document::new();
        for field in select {
            if let Some(excluded) = field.strip_prefix('-') {
                projection.insert(excluded, 0);
            } else {
                projection.insert(field.trim_start_matches('+'), 1);
            }
        }
        Some(projection)
    }
}

/// One page of search results together with the total match count.
#[derive(Debug, Clone, Default, PartialEq, Serialize, ToSchema)]
pub struct SearchPage {
    #[schema(value_type = Vec<Object>)]
    pub data: Vec<Document>,
    pub count: u64,
    pub limit: Option<u64>,
    pub skip: Option<u64>,
}

/// Well-known query parameters understood by [`crate::Query`].
///
/// Any other key is treated as a filter on a document field:
/// - `field=value`: literal equality (sanitized)
/// - `!field=value`: not equal
/// - `$field=value`: case-insensitive partial match
/// - `$gte_field`, `$gt_field`, `$lte_field`, `$lt_field`: date ranges
/// - `$in_field=a,b`, `$nin_field=a,b`: set membership
#[derive(Debug, Clone, Default, Deserialize, Serialize, IntoParams, ToSchema)]
#[into_params(parameter_in = Query)]
pub struct SearchParams {
    /// Number of documents to skip. Defaults to 0.
    #[param(example = 0)]
    pub skip: Option<String>,
    /// Page size. Defaults to 20.
    #[param(example = 20)]
    pub limit: Option<String>,
    /// 1-based page; `0` disables windowing.
    #[param(example = 1)]
    pub page: Option<String>,
    /// Comma or space separated sort fields, `-` for descending.
    #[param(example = "-createdAt,name")]
    pub sort: Option<String>,
    /// Comma or space separated fields to return.
    #[param(example = "name,email")]
    pub select: Option<String>,
    /// Relations to expand: `path:field,field;path`.
    #[param(example = "user:name,email;organization")]
    pub populate: Option<String>,
    /// Full-text search term.
    #[serde(rename = "$text")]
    #[param(example = "search terms")]
    pub text: Option<String>,
}

impl SearchParams {
    /// Raw parameter document for the keys that are set.
    #[must_use]
    pub fn into_raw(self) -> Document {
        let pairs = [
            ("skip", self.skip),
            ("limit", self.limit),
            ("page", self.page),
            ("sort", self.sort),
            ("select", self.select),
            ("populate", self.populate),
            ("$text", self.text),
        ];
        pairs
            .into_iter()
            .filter_map(|(key, value)| value.map(|v| (key.to_string(), bson::Bson::String(v))))
            .collect()
    }
}
