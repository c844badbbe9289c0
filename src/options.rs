//! # Per-entity query configuration
//!
//! [`QueryOptions`] is the static allow-list for one collection: which fields may be filtered,
//! selected, sorted and populated, and which may never leave the server. It binds a request's
//! [`Query`] to the [`FindOptions`] the store executes with.
//!
//! Options are usually declared on the resource type through [`QueryResource`], or loaded from
//! JSON:
//!
//! ```json
//! {
//!   "query": ["name", "status", "createdAt"],
//!   "select": ["name", "status", "owner"],
//!   "sort": ["name", "createdAt"],
//!   "privateFields": ["secret"],
//!   "populate": [{ "path": "owner", "select": ["name"], "ref": "users", "onFindOne": true }],
//!   "subs": [{ "sub": "comments", "populate": [{ "path": "author", "select": ["name"] }] }],
//!   "updateDateKey": "updatedAt"
//! }
//! ```

use bson::Document;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::errors::{FieldError, QueryError};
use crate::filtering::{
    DEFAULT_LIMIT,
    sort::{filter_sorts, sort_document},
};
use crate::models::{FindOptions, PopulateRequest, PopulateSpec};
use crate::query::{CreateQueryOptions, Query};

/// Operation kinds a populate rule can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopulateOn {
    FindOne,
    Patch,
    Post,
    Search,
}

/// An allowed relation expansion.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PopulateRule {
    pub path: String,
    /// Fields that may be selected on the related document; also the default selection.
    pub select: Vec<String>,
    #[serde(rename = "ref")]
    pub reference: Option<String>,
    /// Collection used by sub-document `$lookup` stages, `<path>s` when unset.
    pub lookup_ref: Option<String>,
    pub on_find_one: bool,
    pub on_patch: bool,
    pub on_post: bool,
    pub on_search: bool,
    pub on_all: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub populate: Vec<PopulateSpec>,
}

impl PopulateRule {
    pub fn new<I, S>(path: impl Into<String>, select: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            path: path.into(),
            select: select.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// True if the rule is bound to `on` (or to every operation).
    #[must_use]
    pub fn applies_on(&self, on: PopulateOn) -> bool {
        self.on_all
            || match on {
                PopulateOn::FindOne => self.on_find_one,
                PopulateOn::Patch => self.on_patch,
                PopulateOn::Post => self.on_post,
                PopulateOn::Search => self.on_search,
            }
    }

    /// Collection joined by sub-document lookups.
    #[must_use]
    pub fn lookup_collection(&self) -> String {
        self.lookup_ref
            .clone()
            .unwrap_or_else(|| format!("{}s", self.path))
    }

    /// The rule's full configured expansion.
    #[must_use]
    pub fn to_spec(&self) -> PopulateSpec {
        self.resolve(None)
    }

    /// Resolve a request against this rule: requested fields outside the allowed selection
    /// are dropped, and an empty result falls back to the allowed selection.
    #[must_use]
    pub fn resolve(&self, requested: Option<&[String]>) -> PopulateSpec {
        let select: Vec<String> = requested
            .map(|requested| {
                requested
                    .iter()
                    .filter(|field| self.select.contains(field))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        PopulateSpec {
            path: self.path.clone(),
            select: if select.is_empty() {
                self.select.clone()
            } else {
                select
            },
            populate: self.populate.clone(),
            reference: self.reference.clone(),
        }
    }
}

/// Populate allow-list for an embedded array field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubOptions {
    pub sub: String,
    pub populate: Vec<PopulateRule>,
}

impl SubOptions {
    #[must_use]
    pub fn rule(&self, path: &str) -> Option<&PopulateRule> {
        self.populate.iter().find(|rule| rule.path == path)
    }
}

/// Static query configuration for one collection.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryOptions {
    /// Fields a request body may set; `None` accepts every field.
    pub edit_fields: Option<Vec<String>>,
    /// Fields stripped by [`QueryOptions::to_json`].
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub private_fields: Vec<String>,
    /// Fields the document query may filter on; `None` allows all.
    pub query: Option<Vec<String>>,
    /// Fields a request may select.
    pub select: Option<Vec<String>>,
    /// Selection used when the request chose nothing valid.
    pub default_select: Option<Vec<String>>,
    /// Fields a request may sort by; `None` allows all.
    pub sort: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub populate: Vec<PopulateRule>,
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub subs: Vec<SubOptions>,
    /// Field stamped with the current time on every update.
    pub update_date_key: Option<String>,
}

impl QueryOptions {
    /// Load options from a JSON document (camelCase keys).
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error when the document does not match the options shape.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    #[must_use]
    pub fn sub_options(&self, sub: &str) -> Option<&SubOptions> {
        self.subs.iter().find(|options| options.sub == sub)
    }

    /// Final search filter, restricted to the `query` allow-list.
    pub fn create_search_query(&self, query: &mut Query) -> Document {
        query.create_query(CreateQueryOptions {
            fields: self.query.clone(),
            ..CreateQueryOptions::default()
        })
    }

    /// Resolve populate requests against the allow-list (or a sub-document's allow-list).
    /// Requests for unknown paths are dropped.
    #[must_use]
    pub fn get_valid_populate(
        &self,
        requests: &[PopulateRequest],
        sub: Option<&str>,
    ) -> Vec<PopulateSpec> {
        let rules = match sub {
            Some(sub) => match self.sub_options(sub) {
                Some(options) => options.populate.as_slice(),
                None => return Vec::new(),
            },
            None => self.populate.as_slice(),
        };

        requests
            .iter()
            .filter_map(|request| {
                let Some(rule) = rules.iter().find(|rule| rule.path == request.path) else {
                    tracing::debug!(path = %request.path, "Dropping populate request outside allow-list");
                    return None;
                };
                Some(rule.resolve(request.select.as_deref()))
            })
            .collect()
    }

    /// Configured populates bound to an operation kind.
    #[must_use]
    pub fn get_populates(&self, on: PopulateOn) -> Vec<PopulateSpec> {
        self.populate
            .iter()
            .filter(|rule| rule.applies_on(on))
            .map(PopulateRule::to_spec)
            .collect()
    }

    /// Configured populates of a sub-document bound to an operation kind.
    #[must_use]
    pub fn get_sub_populates(&self, sub: &str, on: PopulateOn) -> Vec<PopulateSpec> {
        self.sub_options(sub)
            .map(|options| {
                options
                    .populate
                    .iter()
                    .filter(|rule| rule.applies_on(on))
                    .map(PopulateRule::to_spec)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Valid user-requested populates followed by the query's root populates.
    pub fn set_populate(&self, find: &mut FindOptions, query: &Query) {
        let mut populate = if query.populate().is_empty() {
            Vec::new()
        } else {
            self.get_valid_populate(query.populate(), None)
        };
        populate.extend(query.root_populate().iter().cloned());
        find.populate = populate;
    }

    /// Window the result set. Export mode fetches everything.
    pub fn set_limit_and_skip(&self, find: &mut FindOptions, query: &Query) {
        if query.export() {
            find.skip = None;
            find.limit = None;
            return;
        }
        find.skip = Some(query.skip().unwrap_or(0));
        find.limit = Some(query.limit().or(self.limit).unwrap_or(DEFAULT_LIMIT));
    }

    /// Apply the selection.
    ///
    /// Requested fields are kept when they match an allowed field or a sub-path of one
    /// (`address` allows `address.city`). With nothing valid requested the default selection
    /// applies, then the allow-list itself. `valid` overrides the configured allow-list; an
    /// empty override disables request-driven selection.
    pub fn set_select(&self, find: &mut FindOptions, query: &Query, valid: Option<&[String]>) {
        let valid = valid.or(self.select.as_deref()).unwrap_or_default();
        let requested = query.select();

        let mut selects: Vec<String> = Vec::new();
        if !valid.is_empty() && !requested.is_empty() {
            selects = requested
                .iter()
                .filter(|field| valid.iter().any(|allowed| is_valid_select(field, allowed)))
                .cloned()
                .collect();
        }
        if selects.is_empty() {
            selects = self
                .default_select
                .clone()
                .unwrap_or_else(|| valid.to_vec());
        }

        if !selects.is_empty() {
            find.select = Some(selects);
        }
    }

    /// Sort by the permitted tokens.
    pub fn set_sort(&self, find: &mut FindOptions, query: &Query) {
        if query.sort().is_empty() {
            return;
        }
        let tokens = filter_sorts(query.sort(), self.sort.as_deref());
        if !tokens.is_empty() {
            find.sort = Some(sort_document(&tokens, query.has_text_search()));
        }
    }

    /// Move the query's one-shot projection into `find`, on top of any text-score projection.
    pub fn set_projection(&self, find: &mut FindOptions, query: &mut Query) {
        let Some(projection) = query.take_projection() else {
            return;
        };
        let mut merged = find.projection.take().unwrap_or_default();
        for (key, value) in projection {
            merged.insert(key, value);
        }
        find.projection = Some(merged);
    }

    /// Body keys outside the `edit_fields` allow-list.
    #[must_use]
    pub fn invalid_fields(&self, body: &Document) -> Vec<String> {
        let Some(editable) = &self.edit_fields else {
            return Vec::new();
        };
        body.keys()
            .filter(|key| !editable.contains(key))
            .cloned()
            .collect()
    }

    /// Reject a body that sets non-editable fields.
    ///
    /// # Errors
    ///
    /// Returns a `400 Bad Request` listing every non-editable field.
    pub fn validate_body(&self, body: &Document) -> Result<(), QueryError> {
        let invalid = self.invalid_fields(body);
        if invalid.is_empty() {
            return Ok(());
        }
        Err(QueryError::BadRequest {
            message: "Invalid fields".to_string(),
            errors: invalid
                .into_iter()
                .map(|field| FieldError::new(field, "Field is not editable"))
                .collect(),
        })
    }

    /// Strip private fields before a document leaves the server.
    #[must_use]
    pub fn to_json(&self, mut document: Document) -> Document {
        for field in &self.private_fields {
            document.remove(field);
        }
        document
    }
}

fn is_valid_select(field: &str, allowed: &str) -> bool {
    field
        .strip_prefix(allowed)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('.'))
}

/// A collection exposed through query parameters.
///
/// ```rust,ignore
/// struct Article;
///
/// impl QueryResource for Article {
///     const RESOURCE_NAME: &'static str = "Article";
///
///     fn query_options() -> QueryOptions {
///         QueryOptions {
///             query: Some(vec!["title".into(), "status".into()]),
///             sort: Some(vec!["createdAt".into()]),
///             ..QueryOptions::default()
///         }
///     }
/// }
///
/// let handler = QueryHandler::for_resource::<Article>(store);
/// ```
pub trait QueryResource {
    /// Singular name used in error messages.
    const RESOURCE_NAME: &'static str;

    fn query_options() -> QueryOptions;
}
