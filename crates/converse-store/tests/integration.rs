//! Integration tests for converse-store against an on-disk database.

use std::sync::Arc;
use std::time::Duration;

use converse_store::{
    Database, HashingEmbedder, MemoryStore, MessageStatus, NewMessage, RecordMetadata,
    SqliteMemoryStore,
};

async fn open_store(dir: &tempfile::TempDir) -> SqliteMemoryStore {
    let db = Database::open_and_migrate(dir.path().join("converse.db"))
        .await
        .unwrap();
    SqliteMemoryStore::new(db, Arc::new(HashingEmbedder::default()))
}

// ═══════════════════════════════════════════════════════════════════════
//  Persistence across reopen
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn data_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = open_store(&dir).await;
        store.set_fact("me", "name", "Ada").await.unwrap();
        store.append_message("s1", NewMessage::user("hello")).await.unwrap();
        store
            .add_vector("Ada likes tea", RecordMetadata::new("note").owner("me"))
            .await
            .unwrap();
    }

    let store = open_store(&dir).await;
    assert_eq!(store.get_fact("me", "name").await.unwrap().unwrap().value, "Ada");
    assert_eq!(store.list_messages("s1", None).await.unwrap().len(), 1);
    let hits = store.query_vector("what does Ada like", 3, Some("me")).await.unwrap();
    assert_eq!(hits.len(), 1);
}

// ═══════════════════════════════════════════════════════════════════════
//  Memory record lifecycle
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn soft_delete_restore_purge_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;

    let id = store
        .add_vector("the wifi password is hunter2", RecordMetadata::new("note"))
        .await
        .unwrap();

    store.soft_delete(&id).await.unwrap();
    assert!(store.query_vector("wifi password", 5, None).await.unwrap().is_empty());

    store.restore(&id).await.unwrap();
    let hits = store.query_vector("wifi password", 5, None).await.unwrap();
    assert_eq!(hits[0].record.id, id);

    // Restoring twice is fine.
    store.restore(&id).await.unwrap();

    store.soft_delete(&id).await.unwrap();
    let report = store.purge_expired(Duration::ZERO).await.unwrap();
    assert_eq!(report.memory_records, 1);
    assert!(store.query_vector("wifi password", 5, None).await.unwrap().is_empty());
}

// ═══════════════════════════════════════════════════════════════════════
//  Concurrency
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn concurrent_writers_do_not_lose_records() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(open_store(&dir).await);

    let mut handles = Vec::new();
    for i in 0..16 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store
                .add_vector(&format!("record number {i}"), RecordMetadata::new("note"))
                .await
                .unwrap();
            store.set_fact("shared", &format!("k{i}"), "v").await.unwrap();
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    assert_eq!(store.vectors().count().await.unwrap(), 16);
    assert_eq!(store.list_facts("shared").await.unwrap().len(), 16);
}

#[tokio::test]
async fn message_order_is_append_order() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;

    let first = store.append_message("s", NewMessage::user("msg1")).await.unwrap();
    store.set_message_status(first, MessageStatus::Cancelled).await.unwrap();
    store.append_message("s", NewMessage::user("msg2")).await.unwrap();
    store.append_message("s", NewMessage::assistant("reply2")).await.unwrap();

    let log = store.list_messages("s", None).await.unwrap();
    let view: Vec<_> = log.iter().map(|m| (m.content.as_str(), m.status)).collect();
    assert_eq!(
        view,
        [
            ("msg1", MessageStatus::Cancelled),
            ("msg2", MessageStatus::Complete),
            ("reply2", MessageStatus::Complete),
        ]
    );
}
