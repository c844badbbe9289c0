mod common;

use axum::http::StatusCode;
use bson::{Bson, DateTime, doc, oid::ObjectId};
use common::MemoryStore;
use docfilter::{DocumentStore, HistoryEntry, QueryHistory};

fn store(id: ObjectId) -> MemoryStore {
    MemoryStore::new(vec![doc! {
        "_id": id,
        "title": "Draft",
        "tags": ["a"],
        "updatedAt": DateTime::from_millis(0),
        "history": [],
    }])
}

async fn edit(store: &MemoryStore, id: ObjectId, set: bson::Document) {
    store
        .update_one(doc! { "_id": id }, doc! { "$set": set })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_records_diff_at_head_of_history() {
    let id = ObjectId::new();
    let user = ObjectId::new();
    let store = store(id);
    let mut history = QueryHistory::new(&store, user);
    history.set_old_doc(store.document(&Bson::ObjectId(id)).unwrap(), false);
    history.set_type("update");
    history.set_meta(doc! { "reason": "typo" });

    edit(&store, id, doc! { "title": "Final", "tags": ["a", "b"] }).await;
    let updated = history.find_updated().await.unwrap();
    assert_eq!(updated.get_str("title").unwrap(), "Final");
    assert!(!updated.contains_key("history"));

    let entry = history
        .compute_and_append(&Bson::ObjectId(id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.user, user);
    assert_eq!(entry.kind.as_deref(), Some("update"));
    assert_eq!(entry.reference_date, entry.diff_date);
    assert_eq!(
        entry.diff,
        doc! {
            "title": ["Draft", "Final"],
            "tags": { "_t": "a", "1": ["b"] },
        }
    );

    let stored = store.document(&Bson::ObjectId(id)).unwrap();
    let entries = stored.get_array("history").unwrap();
    assert_eq!(entries.len(), 1);
    let decoded: HistoryEntry =
        bson::from_bson(entries[0].clone()).unwrap();
    assert_eq!(decoded, entry);
}

#[tokio::test]
async fn test_newest_entry_comes_first() {
    let id = ObjectId::new();
    let store = store(id);

    let mut ids = Vec::new();
    for title in ["Second", "Third"] {
        let mut history = QueryHistory::new(&store, ObjectId::new());
        history.set_old_doc(store.document(&Bson::ObjectId(id)).unwrap(), false);
        edit(&store, id, doc! { "title": title }).await;
        history.find_updated().await.unwrap();
        let entry = history.compute_and_append(&Bson::ObjectId(id)).await.unwrap().unwrap();
        ids.push(entry.id);
    }

    let stored = store.document(&Bson::ObjectId(id)).unwrap();
    let first = stored.get_array("history").unwrap()[0].as_document().unwrap().clone();
    assert_eq!(first.get_object_id("_id").unwrap(), ids[1]);
}

#[tokio::test]
async fn test_unchanged_document_records_nothing() {
    let id = ObjectId::new();
    let store = store(id);
    let mut history = QueryHistory::new(&store, ObjectId::new());
    history.set_ignore_fields(["updatedAt"]);
    history.set_old_doc(store.document(&Bson::ObjectId(id)).unwrap(), false);

    edit(&store, id, doc! { "updatedAt": DateTime::from_millis(1_000) }).await;
    history.find_updated().await.unwrap();

    let updates_before = store.updates.lock().unwrap().len();
    let entry = history.compute_and_append(&Bson::ObjectId(id)).await.unwrap();
    assert!(entry.is_none());
    assert_eq!(store.updates.lock().unwrap().len(), updates_before);
}

#[tokio::test]
async fn test_first_old_document_is_kept() {
    let id = ObjectId::new();
    let store = store(id);
    let mut history = QueryHistory::new(&store, ObjectId::new());
    history.set_old_doc(doc! { "_id": id, "title": "Draft" }, false);
    history.set_old_doc(doc! { "_id": id, "title": "Ignored" }, false);
    history.set_updated_doc(doc! { "_id": id, "title": "Final" });

    let entry = history.compute_and_append(&Bson::ObjectId(id)).await.unwrap().unwrap();
    assert_eq!(entry.diff, doc! { "title": ["Draft", "Final"] });

    history.set_old_doc(doc! { "_id": id, "title": "Forced" }, true);
    let entry = history.compute_and_append(&Bson::ObjectId(id)).await.unwrap().unwrap();
    assert_eq!(entry.diff, doc! { "title": ["Forced", "Final"] });
}

#[tokio::test]
async fn test_revert_restores_and_removes_entry() {
    let id = ObjectId::new();
    let store = store(id);
    let mut history = QueryHistory::new(&store, ObjectId::new());
    history.set_ignore_fields(["updatedAt"]);
    history.set_old_doc(store.document(&Bson::ObjectId(id)).unwrap(), false);

    edit(&store, id, doc! { "title": "Final", "tags": ["a", "b"] }).await;
    history.find_updated().await.unwrap();
    let entry = history.compute_and_append(&Bson::ObjectId(id)).await.unwrap().unwrap();

    let restored = history.revert(&Bson::ObjectId(id), entry.id).await.unwrap();
    assert_eq!(restored, doc! { "_id": id, "title": "Draft", "tags": ["a"] });

    let stored = store.document(&Bson::ObjectId(id)).unwrap();
    assert_eq!(stored.get_str("title").unwrap(), "Draft");
    assert_eq!(stored.get_array("tags").unwrap(), &vec![Bson::from("a")]);
    assert!(stored.get_array("history").unwrap().is_empty());
    assert_eq!(stored.get_datetime("updatedAt").unwrap(), &DateTime::from_millis(0));
}

#[tokio::test]
async fn test_revert_removes_added_and_restores_removed_fields() {
    let id = ObjectId::new();
    let store = MemoryStore::new(vec![doc! {
        "_id": id,
        "title": "Draft",
        "summary": "short",
        "history": [],
    }]);
    let mut history = QueryHistory::new(&store, ObjectId::new());
    history.set_old_doc(store.document(&Bson::ObjectId(id)).unwrap(), false);

    store
        .update_one(
            doc! { "_id": id },
            doc! { "$set": { "published": true }, "$unset": { "summary": "" } },
        )
        .await
        .unwrap();
    history.find_updated().await.unwrap();
    let entry = history.compute_and_append(&Bson::ObjectId(id)).await.unwrap().unwrap();
    assert_eq!(
        entry.diff,
        doc! { "summary": ["short", 0, 0], "published": [true] }
    );

    let restored = history.revert(&Bson::ObjectId(id), entry.id).await.unwrap();
    assert_eq!(restored, doc! { "_id": id, "title": "Draft", "summary": "short" });

    let stored = store.document(&Bson::ObjectId(id)).unwrap();
    assert_eq!(
        stored,
        doc! { "_id": id, "title": "Draft", "summary": "short", "history": [] }
    );
    let (_, update) = store.last_update();
    assert_eq!(update.get_document("$unset").unwrap(), &doc! { "published": "" });
}

#[tokio::test]
async fn test_revert_reports_missing_records() {
    let id = ObjectId::new();
    let store = store(id);
    let history = QueryHistory::new(&store, ObjectId::new());

    let err = history
        .revert(&Bson::ObjectId(id), ObjectId::new())
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    assert!(err.user_message().contains("History"));

    let err = history
        .revert(&Bson::ObjectId(ObjectId::new()), ObjectId::new())
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    assert!(err.user_message().contains("Document"));
}

#[tokio::test]
async fn test_missing_documents_are_internal_errors() {
    let store = MemoryStore::default();
    let history = QueryHistory::new(&store, ObjectId::new());
    let err = history
        .compute_and_append(&Bson::ObjectId(ObjectId::new()))
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
}
