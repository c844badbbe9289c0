use bson::{Bson, DateTime, Document, doc, oid::ObjectId};
use futures_util::future::try_join;

use crate::core::store::{DeleteResult, DocumentStore, UpdateResult};
use crate::errors::QueryError;
use crate::models::{FindOptions, PopulateSpec, SearchPage};
use crate::options::{PopulateOn, QueryOptions, QueryResource};
use crate::query::{CreateQueryOptions, Query};
use crate::subdoc;

/// Options for [`QueryHandler::find_one`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FindOneOptions {
    /// Apply the requested (and root) populates.
    pub populate: bool,
    /// Honour the request's `select` against the configured allow-list.
    pub select: bool,
}

/// Executes composed queries for one collection.
pub struct QueryHandler<S> {
    store: S,
    options: QueryOptions,
    resource: String,
}

impl<S: DocumentStore> QueryHandler<S> {
    pub fn new(store: S, options: QueryOptions) -> Self {
        Self {
            store,
            options,
            resource: "Document".to_string(),
        }
    }

    /// Handler configured from a [`QueryResource`].
    pub fn for_resource<R: QueryResource>(store: S) -> Self {
        Self {
            store,
            options: R::query_options(),
            resource: R::RESOURCE_NAME.to_string(),
        }
    }

    pub const fn store(&self) -> &S {
        &self.store
    }

    pub const fn options(&self) -> &QueryOptions {
        &self.options
    }

    /// Resource name used in not-found errors.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Insert a new document; store validation errors surface as `400`.
    ///
    /// # Errors
    ///
    /// Returns the converted store error when the insert fails.
    pub async fn create(&self, body: Document) -> Result<Document, QueryError> {
        Ok(self.store.insert_one(body).await?)
    }

    /// Client representation of a document (private fields removed).
    #[must_use]
    pub fn json(&self, document: Document) -> Document {
        self.options.to_json(document)
    }

    /// Search one page and count all matches concurrently.
    ///
    /// # Errors
    ///
    /// Returns the converted store error if either the page or the count fails.
    pub async fn search(&self, query: &mut Query) -> Result<SearchPage, QueryError> {
        let filter = self.options.create_search_query(query);
        let mut find = FindOptions::default();
        if !query.options().is_empty() {
            find.projection = Some(query.options().clone());
        }
        self.options.set_populate(&mut find, query);
        self.options.set_limit_and_skip(&mut find, query);
        self.options.set_sort(&mut find, query);
        self.options.set_select(&mut find, query, None);

        let skip = find.skip.or(query.skip());
        let limit = find.limit.or(query.limit());
        let (data, count) =
            try_join(self.store.find(filter.clone(), find), self.store.count(filter)).await?;

        tracing::debug!(count, returned = data.len(), "Search completed");
        Ok(SearchPage {
            data,
            count,
            limit,
            skip,
        })
    }

    /// Find one document by the query's root, or by the composed query when no root is set.
    ///
    /// # Errors
    ///
    /// Returns the converted store error when the lookup fails.
    pub async fn find_one(
        &self,
        query: &mut Query,
        opts: FindOneOptions,
    ) -> Result<Option<Document>, QueryError> {
        let filter = match query.root() {
            Some(root) => root,
            None => query.create_query(CreateQueryOptions::default()),
        };
        let mut find = FindOptions::default();
        if opts.populate {
            self.options.set_populate(&mut find, query);
        }
        let valid: Option<&[String]> = if opts.select { None } else { Some(&[]) };
        self.options.set_select(&mut find, query, valid);
        self.options.set_projection(&mut find, query);

        Ok(self.store.find_one(filter, find).await?)
    }

    /// Update the first match and return it after the update.
    ///
    /// With `update_date_key` configured, the key is stamped with the current time inside
    /// `$set` when present, otherwise at the top level.
    ///
    /// # Errors
    ///
    /// Returns the converted store error when the update fails.
    pub async fn find_one_and_update(
        &self,
        query: &Query,
        filter: Document,
        mut update: Document,
    ) -> Result<Option<Document>, QueryError> {
        if let Some(key) = &self.options.update_date_key {
            let now = Bson::DateTime(DateTime::now());
            if update.contains_key("$set") {
                if let Ok(set) = update.get_document_mut("$set") {
                    set.insert(key, now);
                }
            } else {
                update.insert(key, now);
            }
        }
        let mut find = FindOptions::default();
        self.options.set_populate(&mut find, query);
        self.options.set_select(&mut find, query, None);

        Ok(self.store.find_one_and_update(filter, update, find).await?)
    }

    /// # Errors
    ///
    /// Returns the converted store error when the delete fails.
    pub async fn delete_one(&self, filter: Document) -> Result<DeleteResult, QueryError> {
        Ok(self.store.delete_one(filter).await?)
    }

    /// `$set` `body` on the documents among `ids` that also match `filter`.
    ///
    /// # Errors
    ///
    /// Returns the converted store error when the update fails.
    pub async fn update_many(
        &self,
        filter: Document,
        ids: Vec<ObjectId>,
        body: Document,
    ) -> Result<UpdateResult, QueryError> {
        let filter = scoped_to_ids(filter, ids);
        Ok(self.store.update_many(filter, doc! { "$set": body }).await?)
    }

    /// Delete the documents among `ids` that also match `filter`.
    ///
    /// # Errors
    ///
    /// Returns the converted store error when the delete fails.
    pub async fn delete_many(
        &self,
        filter: Document,
        ids: Vec<ObjectId>,
    ) -> Result<DeleteResult, QueryError> {
        Ok(self.store.delete_many(scoped_to_ids(filter, ids)).await?)
    }

    /// Populate `document` with the populates configured for `on` plus the valid requested
    /// ones. Failures are logged and never returned.
    pub async fn populate(&self, query: &Query, document: &mut Document, on: Option<PopulateOn>) {
        let mut populates = on.map(|on| self.get_populates(on)).unwrap_or_default();
        populates.extend(self.options.get_valid_populate(query.populate(), None));
        self.populate_document(document, &populates, None).await;
    }

    #[must_use]
    pub fn get_populates(&self, on: PopulateOn) -> Vec<PopulateSpec> {
        self.options.get_populates(on)
    }

    /// Push `body` onto the `sub` array of the root document and return the stored element.
    /// An `_id` is generated when the body has none.
    ///
    /// # Errors
    ///
    /// Returns the converted store error when the update or the reload fails.
    pub async fn sub_create(
        &self,
        sub: &str,
        query: &Query,
        mut body: Document,
    ) -> Result<Option<Document>, QueryError> {
        if !body.contains_key("_id") {
            body.insert("_id", ObjectId::new());
        }
        let id = body.get("_id").cloned().unwrap_or(Bson::Null);
        let filter = query.root().unwrap_or_default();
        self.store
            .update_one(filter, doc! { "$push": { sub: body } })
            .await?;
        self.sub_find_one(sub, query, doc! { "_id": id }).await
    }

    /// Search the elements of `sub` inside the documents matching `root_match`.
    ///
    /// # Errors
    ///
    /// Returns `501 Not Implemented` when `sub` has no configuration, or the converted store
    /// error when the aggregation fails.
    pub async fn sub_search(
        &self,
        sub: &str,
        query: &mut Query,
        root_match: Document,
    ) -> Result<SearchPage, QueryError> {
        let options = self
            .options
            .sub_options(sub)
            .ok_or_else(QueryError::missing_subdocument)?;
        let pipeline = subdoc::search_pipeline(query, options, root_match);
        tracing::debug!(sub = %sub, stages = pipeline.len(), "Running sub-document search");

        let items = self.store.aggregate(pipeline).await?;
        let (data, count) = subdoc::flatten_results(items, sub);
        Ok(SearchPage {
            data,
            count,
            limit: query.limit(),
            skip: query.skip(),
        })
    }

    /// First element of `sub` matching `sub_query` within the query's root document.
    ///
    /// # Errors
    ///
    /// Returns the converted store error when the lookup fails.
    pub async fn sub_find_one(
        &self,
        sub: &str,
        query: &Query,
        sub_query: Document,
    ) -> Result<Option<Document>, QueryError> {
        let mut positional = Document::new();
        positional.insert(format!("{sub}.$"), 1);
        let find = FindOptions {
            projection: Some(positional),
            ..FindOptions::default()
        };
        let parent = self
            .store
            .find_one(element_filter(sub, query, sub_query), find)
            .await?;
        Ok(parent.and_then(|parent| first_element(parent, sub)))
    }

    /// `$set` the fields of `body` on the element matching `sub_query` and return it.
    ///
    /// # Errors
    ///
    /// Returns the converted store error when the update or the reload fails.
    pub async fn sub_find_one_and_update(
        &self,
        sub: &str,
        query: &Query,
        sub_query: Document,
        body: Document,
    ) -> Result<Option<Document>, QueryError> {
        let set: Document = body
            .into_iter()
            .map(|(key, value)| (format!("{sub}.$.{key}"), value))
            .collect();
        self.store
            .update_one(
                element_filter(sub, query, sub_query.clone()),
                doc! { "$set": set },
            )
            .await?;
        self.sub_find_one(sub, query, sub_query).await
    }

    /// Remove the element matching `sub_query`, returning it; `None` when nothing matched.
    ///
    /// # Errors
    ///
    /// Returns the converted store error when the lookup or the update fails.
    pub async fn sub_delete(
        &self,
        sub: &str,
        query: &Query,
        sub_query: Document,
    ) -> Result<Option<Document>, QueryError> {
        let Some(element) = self.sub_find_one(sub, query, sub_query.clone()).await? else {
            return Ok(None);
        };
        let id = element.get("_id").cloned().unwrap_or(Bson::Null);
        self.store
            .update_one(
                element_filter(sub, query, sub_query),
                doc! { "$pull": { sub: { "_id": id } } },
            )
            .await?;
        Ok(Some(element))
    }

    /// Populate a sub-document with the populates configured for `on` plus the valid
    /// requested ones. Failures are logged and never returned.
    pub async fn sub_populate(
        &self,
        query: &Query,
        element: &mut Document,
        sub: &str,
        on: Option<PopulateOn>,
    ) {
        let mut populates = on
            .map(|on| self.get_sub_populate(sub, on))
            .unwrap_or_default();
        populates.extend(self.options.get_valid_populate(query.populate(), Some(sub)));
        self.populate_document(element, &populates, Some(sub)).await;
    }

    #[must_use]
    pub fn get_sub_populate(&self, sub: &str, on: PopulateOn) -> Vec<PopulateSpec> {
        self.options.get_sub_populates(sub, on)
    }

    /// # Errors
    ///
    /// Returns `400 Bad Request` listing the fields outside `edit_fields`.
    pub fn validate_body(&self, body: &Document) -> Result<(), QueryError> {
        self.options.validate_body(body)
    }

    async fn populate_document(
        &self,
        document: &mut Document,
        populates: &[PopulateSpec],
        sub: Option<&str>,
    ) {
        for populate in populates {
            if let Err(error) = self.store.populate(document, populate).await {
                tracing::error!(
                    error = %error,
                    path = %populate.path,
                    sub = ?sub,
                    resource = %self.resource,
                    "Populate failed"
                );
            }
        }
    }
}

fn scoped_to_ids(mut filter: Document, ids: Vec<ObjectId>) -> Document {
    filter.insert("_id", doc! { "$in": ids });
    filter
}

fn element_filter(sub: &str, query: &Query, sub_query: Document) -> Document {
    let mut filter = query.root().unwrap_or_default();
    filter.insert(sub, doc! { "$elemMatch": sub_query });
    filter
}

fn first_element(mut parent: Document, sub: &str) -> Option<Document> {
    match parent.remove(sub) {
        Some(Bson::Array(elements)) => elements.into_iter().find_map(|element| match element {
            Bson::Document(element) => Some(element),
            _ => None,
        }),
        _ => None,
    }
}
