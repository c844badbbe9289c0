use async_trait::async_trait;
use bson::Document;
use std::fmt;

use crate::errors::FieldError;
use crate::models::{FindOptions, PopulateSpec};

/// Failures reported by a [`DocumentStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A unique index rejected the write; carries the store's message.
    DuplicateKey(String),
    /// Schema validation failed for one or more fields.
    Validation(Vec<FieldError>),
    Other(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateKey(message) => write!(f, "duplicate key: {message}"),
            Self::Validation(errors) => {
                let paths: Vec<&str> = errors.iter().map(|e| e.path.as_str()).collect();
                write!(f, "validation failed: {}", paths.join(", "))
            }
            Self::Other(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for StoreError {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateResult {
    pub matched: u64,
    pub modified: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteResult {
    pub deleted: u64,
}

/// The document store a [`crate::QueryHandler`] executes against.
///
/// Filters, updates and pipelines are passed through untouched; the store owns indexing,
/// atomicity and validation.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Validate and insert a document, returning it as stored (with its `_id`).
    async fn insert_one(&self, document: Document) -> Result<Document, StoreError>;

    async fn find(
        &self,
        filter: Document,
        options: FindOptions,
    ) -> Result<Vec<Document>, StoreError>;

    async fn count(&self, filter: Document) -> Result<u64, StoreError>;

    async fn find_one(
        &self,
        filter: Document,
        options: FindOptions,
    ) -> Result<Option<Document>, StoreError>;

    /// Apply `update` to the first match and return the document after the update.
    async fn find_one_and_update(
        &self,
        filter: Document,
        update: Document,
        options: FindOptions,
    ) -> Result<Option<Document>, StoreError>;

    async fn update_one(&self, filter: Document, update: Document)
    -> Result<UpdateResult, StoreError>;

    async fn update_many(
        &self,
        filter: Document,
        update: Document,
    ) -> Result<UpdateResult, StoreError>;

    async fn delete_one(&self, filter: Document) -> Result<DeleteResult, StoreError>;

    async fn delete_many(&self, filter: Document) -> Result<DeleteResult, StoreError>;

    async fn aggregate(&self, pipeline: Vec<Document>) -> Result<Vec<Document>, StoreError>;

    /// Replace the reference(s) at `populate.path` in `document` with the referenced
    /// documents, restricted to `populate.select`. The store resolves the referenced
    /// collection when `populate.reference` is unset.
    async fn populate(
        &self,
        document: &mut Document,
        populate: &PopulateSpec,
    ) -> Result<(), StoreError>;
}
