//! Concurrent attach/detach stress: the final ref_count must equal the net
//! of all increments and decrements, with no lost updates.

use depot_metadata::models::{NewContentObject, NewReference};
use depot_metadata::repos::{ContentRepo, ReferenceRepo};
use depot_metadata::SqliteStore;
use std::sync::Arc;
use uuid::Uuid;

const HASH: &str = "1111111111111111111111111111111111111111111111111111111111111111";

fn content() -> NewContentObject {
    NewContentObject {
        content_hash: HASH.to_string(),
        size_bytes: 42,
        mime_type: "text/plain".to_string(),
        extension: "txt".to_string(),
    }
}

fn reference(i: usize) -> NewReference {
    NewReference {
        reference_id: Uuid::new_v4(),
        content_hash: HASH.to_string(),
        entity_type: "ticket".to_string(),
        entity_id: format!("T-{i}"),
        filename: format!("file-{i}.txt"),
        uploader_id: "stress".to_string(),
        description: None,
        tags: Vec::new(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_attach_detach_has_no_lost_updates() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<SqliteStore> = Arc::new(
        SqliteStore::new(dir.path().join("metadata.db"))
            .await
            .unwrap(),
    );

    const ATTACHES: usize = 64;
    const DETACHES: usize = 24;

    // Phase 1: concurrent attaches of the same hash from many tasks.
    let mut handles = Vec::new();
    for i in 0..ATTACHES {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.attach(&content(), &reference(i)).await.unwrap()
        }));
    }
    let mut attached = Vec::new();
    for handle in handles {
        attached.push(handle.await.unwrap());
    }

    let row = store.get_content(HASH).await.unwrap().unwrap();
    assert_eq!(row.ref_count as usize, ATTACHES, "attach increments lost");

    // Phase 2: concurrent detaches of a subset, racing further attaches.
    let mut handles = Vec::new();
    for reference_row in attached.drain(..DETACHES) {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.detach(reference_row.reference_id).await.unwrap();
        }));
    }
    for i in 0..DETACHES {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .attach(&content(), &reference(ATTACHES + i))
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    // Net effect: ATTACHES + DETACHES attaches minus DETACHES detaches.
    let row = store.get_content(HASH).await.unwrap().unwrap();
    assert_eq!(row.ref_count as usize, ATTACHES);

    // The stored count matches the live reference count exactly.
    assert!(store.verify_integrity().await.unwrap().is_empty());
}
