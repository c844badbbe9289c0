//! # Request-scoped query composition
//!
//! A [`Query`] is built once per request from raw parameters. Host code then scopes it
//! (root fragments, model-scoped additions, `$or` alternatives, projections) before calling
//! [`Query::create_query`], which assembles the final filter.
//!
//! ## Precedence
//!
//! User input only ever lands in the *document query*. The root fragment, the one-shot
//! root-next fragment and the document query are separate branches of an `$and`, so no user
//! key can replace or remove a root constraint:
//!
//! ```rust,ignore
//! let mut query = Query::from_query_string("owner=someone-else&$name=report");
//! query.add_root(doc! { "owner": current_user_id });
//! query.create_query(CreateQueryOptions::default());
//! // {$and: [{owner: current_user_id}, {name: {$regex: /report/i}, owner: "someone-else"}]}
//! ```

use std::collections::BTreeMap;

use bson::{Bson, Document, doc};
use url::form_urlencoded;

use crate::filtering::{
    fragment, operators::compile_operations, params::parse_params, sanitize::sanitize_literals,
};
use crate::models::{PopulateRequest, PopulateSpec};

/// Options for [`Query::create_query`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateQueryOptions {
    /// Activate this model before composing.
    pub param: Option<String>,
    /// Keep only these document-query fields; `None` keeps all.
    pub fields: Option<Vec<String>>,
    /// Leave out the root and root-next fragments.
    pub no_root: bool,
}

impl CreateQueryOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn param(mut self, model: impl Into<String>) -> Self {
        self.param = Some(model.into());
        self
    }

    #[must_use]
    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub const fn no_root(mut self) -> Self {
        self.no_root = true;
        self
    }
}

/// One-shot fragment state. `consume` moves `Pending` to `Empty`.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RootNext {
    #[default]
    Empty,
    Pending(Document),
}

impl RootNext {
    /// Hand out the pending fragment exactly once.
    pub fn consume(&mut self) -> Option<Document> {
        match std::mem::take(self) {
            Self::Pending(fragment) if !fragment.is_empty() => Some(fragment),
            Self::Pending(_) | Self::Empty => None,
        }
    }

    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }
}

/// Remaining filter parameters, compiled into the document query on first use.
#[derive(Debug, Clone, Default)]
struct DocumentQuery {
    pending: Option<Document>,
    compiled: Document,
}

/// Filter-building context for one request.
#[derive(Debug, Clone)]
pub struct Query {
    skip: Option<u64>,
    limit: Option<u64>,
    page: Option<u64>,
    sort: Vec<String>,
    select: Vec<String>,
    populate: Vec<PopulateRequest>,
    options: Document,
    text: Option<String>,
    document_query: DocumentQuery,
    root: Document,
    root_next: RootNext,
    root_populate: Vec<PopulateSpec>,
    or: Vec<Document>,
    model: Option<String>,
    model_queries: BTreeMap<String, Document>,
    export: bool,
    projection: Option<Document>,
}

impl Default for Query {
    fn default() -> Self {
        Self::new(Document::new())
    }
}

impl Query {
    /// Build a query from raw parameters (string, number or nested values).
    #[must_use]
    pub fn new(mut raw: Document) -> Self {
        let parsed = parse_params(&mut raw);
        let mut options = Document::new();
        if parsed.text.is_some() {
            options.insert("score", doc! { "$meta": "textScore" });
        }

        Self {
            skip: parsed.pagination.skip,
            limit: parsed.pagination.limit,
            page: parsed.pagination.page,
            sort: parsed.sort,
            select: parsed.select,
            populate: parsed.populate,
            options,
            text: parsed.text,
            document_query: DocumentQuery {
                pending: Some(raw),
                compiled: Document::new(),
            },
            root: Document::new(),
            root_next: RootNext::Empty,
            root_populate: Vec::new(),
            or: Vec::new(),
            model: None,
            model_queries: BTreeMap::new(),
            export: false,
            projection: None,
        }
    }

    /// Build a query from string pairs. A repeated key keeps its last value.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let raw: Document = pairs
            .into_iter()
            .map(|(key, value)| (key.into(), Bson::String(value.into())))
            .collect();
        Self::new(raw)
    }

    /// Build a query from a URL-encoded query string (without the leading `?`).
    #[must_use]
    pub fn from_query_string(query: &str) -> Self {
        Self::from_pairs(form_urlencoded::parse(query.as_bytes()).into_owned())
    }

    #[must_use]
    pub const fn skip(&self) -> Option<u64> {
        self.skip
    }

    #[must_use]
    pub const fn limit(&self) -> Option<u64> {
        self.limit
    }

    #[must_use]
    pub const fn page(&self) -> Option<u64> {
        self.page
    }

    #[must_use]
    pub fn sort(&self) -> &[String] {
        &self.sort
    }

    #[must_use]
    pub fn select(&self) -> &[String] {
        &self.select
    }

    #[must_use]
    pub fn populate(&self) -> &[PopulateRequest] {
        &self.populate
    }

    /// Execution metadata, e.g. `{score: {$meta: "textScore"}}` for text searches.
    #[must_use]
    pub const fn options(&self) -> &Document {
        &self.options
    }

    #[must_use]
    pub const fn has_text_search(&self) -> bool {
        self.text.is_some()
    }

    #[must_use]
    pub fn root_populate(&self) -> &[PopulateSpec] {
        &self.root_populate
    }

    #[must_use]
    pub fn or(&self) -> &[Document] {
        &self.or
    }

    #[must_use]
    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        self.model = Some(model.into());
    }

    #[must_use]
    pub const fn export(&self) -> bool {
        self.export
    }

    /// Export mode drops the skip/limit window entirely.
    pub fn set_export(&mut self, export: bool) {
        self.export = export;
    }

    #[must_use]
    pub const fn projection(&self) -> Option<&Document> {
        self.projection.as_ref()
    }

    pub fn set_projection(&mut self, projection: Option<Document>) {
        self.projection = projection;
    }

    /// Take the projection override; it applies to one store call only.
    pub fn take_projection(&mut self) -> Option<Document> {
        self.projection.take()
    }

    #[must_use]
    pub const fn root_next(&self) -> &RootNext {
        &self.root_next
    }

    pub fn set_skip_and_limit(&mut self, skip: Option<u64>, limit: Option<u64>) {
        self.skip = skip;
        self.limit = limit;
    }

    /// Root fragment combined with the active model-scoped addition, `None` when both are
    /// empty.
    #[must_use]
    pub fn root(&self) -> Option<Document> {
        let addition = self
            .model
            .as_ref()
            .and_then(|model| self.model_queries.get(model))
            .filter(|addition| !addition.is_empty());

        match (self.root.is_empty(), addition) {
            (false, Some(addition)) => Some(fragment::and(vec![self.root.clone(), addition.clone()])),
            (true, Some(addition)) => Some(addition.clone()),
            (false, None) => Some(self.root.clone()),
            (true, None) => None,
        }
    }

    /// The compiled document query (operators, sanitized literals and text search).
    pub fn document_query(&mut self) -> &Document {
        self.document_query_mut()
    }

    fn document_query_mut(&mut self) -> &mut Document {
        if let Some(raw) = self.document_query.pending.take() {
            self.document_query.compiled = compile_document_query(raw, self.text.as_deref());
        }
        &mut self.document_query.compiled
    }

    /// Set a document-query key directly, bypassing sanitization.
    pub fn set_query(&mut self, key: impl Into<String>, value: impl Into<Bson>) {
        self.document_query_mut().insert(key.into(), value.into());
    }

    pub fn remove_query(&mut self, key: &str) -> Option<Bson> {
        self.document_query_mut().remove(key)
    }

    pub fn delete_keys_from_query(&mut self, keys: &[&str]) {
        let document = self.document_query_mut();
        for key in keys {
            document.remove(*key);
        }
    }

    pub fn delete_keys_from_root(&mut self, keys: &[&str]) {
        for key in keys {
            self.root.remove(*key);
        }
    }

    /// Add an alternative; the final filter becomes `{$or: [alternatives..., query]}`.
    pub fn add_or(&mut self, alternative: Document) {
        self.or.push(alternative);
    }

    /// Use `select` when the request did not choose fields itself.
    pub fn default_select<I, S>(&mut self, select: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.select.is_empty() {
            self.select = select.into_iter().map(Into::into).collect();
        }
    }

    /// Populate that is always applied and cannot be requested by the client.
    pub fn add_populate(&mut self, populate: impl IntoIterator<Item = PopulateSpec>) {
        self.root_populate.extend(populate);
    }

    /// Merge into the root fragment, which is always ANDed into the final filter.
    pub fn add_root(&mut self, fragment: Document) -> &Document {
        fragment::merge(&mut self.root, fragment);
        &self.root
    }

    /// Merge into the root-next fragment, applied by the next `create_query` only.
    pub fn add_root_next(&mut self, addition: Document) -> &Document {
        let mut pending = match std::mem::take(&mut self.root_next) {
            RootNext::Pending(pending) => pending,
            RootNext::Empty => Document::new(),
        };
        fragment::merge(&mut pending, addition);
        self.root_next = RootNext::Pending(pending);
        match &self.root_next {
            RootNext::Pending(pending) => pending,
            RootNext::Empty => &self.root,
        }
    }

    /// Register a fragment for one or more models; it is merged into the root when that model
    /// is active.
    pub fn add_to_model_query<I, S>(&mut self, models: I, addition: &Document)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for model in models {
            let entry = self.model_queries.entry(model.into()).or_default();
            fragment::merge(entry, addition.clone());
        }
    }

    /// Assemble the final filter.
    ///
    /// Root (with the model addition), pending root-next and the document query are ANDed;
    /// any `$or` alternatives are placed before that result. Consumes root-next, so two calls
    /// differ when root-next was set.
    pub fn create_query(&mut self, options: CreateQueryOptions) -> Document {
        if let Some(model) = options.param {
            self.model = Some(model);
        }

        let mut candidates = Vec::new();
        if !options.no_root {
            if let Some(root) = self.root() {
                candidates.push(root);
            }
            if let Some(next) = self.root_next.consume() {
                candidates.push(next);
            }
        }

        let document = self.document_query_mut();
        let document = match &options.fields {
            Some(fields) => fragment::project(document, fields),
            None => document.clone(),
        };
        if !document.is_empty() {
            candidates.push(document);
        }

        let composed = fragment::and(candidates);
        let filter = if self.or.is_empty() {
            composed
        } else {
            let mut alternatives = self.or.clone();
            alternatives.push(composed);
            fragment::or(alternatives)
        };
        tracing::debug!(filter = %filter, "Composed query filter");
        filter
    }
}

/// Operators first, then sanitized literals, then the text search; later keys win.
fn compile_document_query(mut raw: Document, text: Option<&str>) -> Document {
    let mut document = compile_operations(&mut raw);
    for (key, value) in sanitize_literals(raw) {
        document.insert(key, value);
    }
    if let Some(text) = text {
        document.insert("$text", doc! { "$search": text });
    }
    document
}
