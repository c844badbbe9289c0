//! # Change history
//!
//! Every tracked document carries a `history` array, newest entry first. Each entry stores the
//! structural delta between the document before and after one change, so any change can later
//! be reverted on top of the current state.
//!
//! ```rust,ignore
//! let mut history = QueryHistory::new(&store, user_id);
//! history.set_old_doc(before, false);
//! handler.find_one_and_update(&query, filter, update).await?;
//! history.find_updated().await?;
//! history.compute_and_append(&id).await?;
//!
//! // later
//! QueryHistory::new(&store, user_id).revert(&id, entry_id).await?;
//! ```

pub mod diff;

use bson::{Bson, DateTime, Document, doc, oid::ObjectId};
use futures_util::future::try_join;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::core::store::DocumentStore;
use crate::errors::QueryError;
use crate::models::FindOptions;

pub use diff::{DeltaError, patch, unpatch};

/// Name of the array holding the history entries.
pub const HISTORY_FIELD: &str = "history";

/// One recorded change, stored at position 0 of the document's `history` array.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub reference_date: DateTime,
    pub diff_date: DateTime,
    pub diff: Document,
    pub user: ObjectId,
    pub meta: Option<Document>,
}

impl From<DeltaError> for QueryError {
    fn from(err: DeltaError) -> Self {
        Self::internal("Could not revert history entry", Some(err.to_string()))
    }
}

/// Records and reverts changes of one document on behalf of a user.
pub struct QueryHistory<'a, S> {
    store: &'a S,
    user: ObjectId,
    old: Option<Document>,
    updated: Option<Document>,
    ignore_fields: Vec<String>,
    reference_date: Option<DateTime>,
    kind: Option<String>,
    meta: Option<Document>,
}

impl<'a, S: DocumentStore> QueryHistory<'a, S> {
    pub fn new(store: &'a S, user: ObjectId) -> Self {
        Self {
            store,
            user,
            old: None,
            updated: None,
            ignore_fields: Vec::new(),
            reference_date: None,
            kind: None,
            meta: None,
        }
    }

    /// Date the change refers to; the diff date when unset.
    pub fn set_reference_date(&mut self, date: DateTime) {
        self.reference_date = Some(date);
    }

    /// Fields left out of diffs and reverts (`history` is always left out).
    pub fn set_ignore_fields<I, F>(&mut self, fields: I)
    where
        I: IntoIterator<Item = F>,
        F: Into<String>,
    {
        self.ignore_fields = fields.into_iter().map(Into::into).collect();
    }

    /// Keep the first old document seen unless `force` is set.
    pub fn set_old_doc(&mut self, document: Document, force: bool) {
        if self.old.is_none() || force {
            self.old = Some(document);
        }
    }

    pub fn set_updated_doc(&mut self, document: Document) {
        self.updated = Some(document);
    }

    pub fn set_type(&mut self, kind: impl Into<String>) {
        self.kind = Some(kind.into());
    }

    pub fn set_meta(&mut self, meta: Document) {
        self.meta = Some(meta);
    }

    fn strip(&self, mut document: Document) -> Document {
        document.remove(HISTORY_FIELD);
        for field in &self.ignore_fields {
            document.remove(field);
        }
        document
    }

    fn without_ignored(&self) -> FindOptions {
        let mut select: Vec<String> = self.ignore_fields.iter().map(|f| format!("-{f}")).collect();
        select.push(format!("-{HISTORY_FIELD}"));
        FindOptions {
            select: Some(select),
            ..FindOptions::default()
        }
    }

    fn old(&self) -> Result<&Document, QueryError> {
        self.old
            .as_ref()
            .ok_or_else(|| QueryError::internal("Missing old document in history", None))
    }

    fn updated(&self) -> Result<&Document, QueryError> {
        self.updated
            .as_ref()
            .ok_or_else(|| QueryError::internal("Missing updated document in history", None))
    }

    /// Reload the updated document from the store by the old document's `_id`.
    ///
    /// # Errors
    ///
    /// Returns `404 Not Found` when the document no longer exists, or an internal error when
    /// no old document was set.
    pub async fn find_updated(&mut self) -> Result<&Document, QueryError> {
        let id = self
            .old()?
            .get("_id")
            .cloned()
            .ok_or_else(|| QueryError::internal("Old document has no _id", None))?;
        let updated = self
            .store
            .find_one(doc! { "_id": id.clone() }, self.without_ignored())
            .await?
            .ok_or_else(|| QueryError::not_found("Document", Some(id_string(&id))))?;
        Ok(self.updated.insert(updated))
    }

    /// Diff the old and updated documents and push the change onto the history of `id`.
    /// Returns `None` without touching the store when nothing changed.
    ///
    /// # Errors
    ///
    /// Returns an internal error when either document is missing, or the converted store
    /// error when the update fails.
    pub async fn compute_and_append(
        &self,
        id: &Bson,
    ) -> Result<Option<HistoryEntry>, QueryError> {
        let old = self.strip(self.old()?.clone());
        let updated = self.strip(self.updated()?.clone());
        let Some(delta) = diff::diff(&old, &updated) else {
            tracing::debug!(id = %id, "No changes to record in history");
            return Ok(None);
        };

        let diff_date = DateTime::now();
        let entry = HistoryEntry {
            id: ObjectId::new(),
            kind: self.kind.clone(),
            reference_date: self.reference_date.unwrap_or(diff_date),
            diff_date,
            diff: delta,
            user: self.user,
            meta: self.meta.clone(),
        };
        let stored = bson::to_document(&entry).map_err(|err| {
            QueryError::internal("Could not encode history entry", Some(err.to_string()))
        })?;

        self.store
            .update_one(
                doc! { "_id": id.clone() },
                doc! { "$push": { HISTORY_FIELD: { "$each": [stored], "$position": 0 } } },
            )
            .await?;
        tracing::debug!(id = %id, history_id = %entry.id, "Recorded history entry");
        Ok(Some(entry))
    }

    /// Revert one history entry on the current document and remove the entry, in one update.
    /// Returns the restored document (without ignored fields).
    ///
    /// # Errors
    ///
    /// Returns `404 Not Found` when the document or the entry does not exist, an internal
    /// error when the stored delta no longer applies, or the converted store error.
    pub async fn revert(&self, id: &Bson, history_id: ObjectId) -> Result<Document, QueryError> {
        let mut positional = Document::new();
        positional.insert(format!("{HISTORY_FIELD}.$"), 1);
        let history_find = FindOptions {
            projection: Some(positional),
            ..FindOptions::default()
        };

        let (document, owner) = try_join(
            self.store
                .find_one(doc! { "_id": id.clone() }, self.without_ignored()),
            self.store.find_one(
                doc! { "_id": id.clone(), "history._id": history_id },
                history_find,
            ),
        )
        .await?;

        let document =
            document.ok_or_else(|| QueryError::not_found("Document", Some(id_string(id))))?;
        let entry = owner
            .as_ref()
            .and_then(|owner| owner.get_array(HISTORY_FIELD).ok())
            .and_then(|entries| entries.first())
            .and_then(Bson::as_document)
            .ok_or_else(|| QueryError::not_found("History", Some(history_id.to_hex())))?;
        let delta = entry
            .get_document("diff")
            .map_err(|err| QueryError::internal("History entry has no diff", Some(err.to_string())))?;

        let current = self.strip(document);
        let mut restored = current.clone();
        unpatch(&mut restored, delta)?;

        self.store
            .update_one(
                doc! { "_id": id.clone() },
                revert_update(&current, &restored, history_id),
            )
            .await?;
        tracing::debug!(id = %id, history_id = %history_id, "Reverted history entry");
        Ok(restored)
    }
}

/// One update turning `current` into `restored`: `$set` what `restored` holds, `$unset` the
/// top-level fields it no longer has, and `$pull` the reverted entry.
fn revert_update(current: &Document, restored: &Document, history_id: ObjectId) -> Document {
    let mut set = restored.clone();
    set.remove("_id");
    let unset: Document = current
        .keys()
        .filter(|key| !restored.contains_key(key.as_str()))
        .map(|key| (key.clone(), Bson::String(String::new())))
        .collect();

    let mut update = Document::new();
    if !set.is_empty() {
        update.insert("$set", set);
    }
    if !unset.is_empty() {
        update.insert("$unset", unset);
    }
    update.insert("$pull", doc! { HISTORY_FIELD: { "_id": history_id } });
    update
}

fn id_string(id: &Bson) -> String {
    match id {
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::String(s) => s.clone(),
        other => other.to_string(),
    }
}
