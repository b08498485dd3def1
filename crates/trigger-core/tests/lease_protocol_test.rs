//! Lease and watermark rules, exercised directly through the store API.

use serde_json::json;
use std::sync::Arc;
use trigger_core::{
    candidate_version, ChangeTrackingBackend, ChangeTrackingStore, MemoryDatabase, TriggerConfig,
    TriggerTarget, UserFunctionId,
};

const TABLE: &str = "dbo.Products";

fn function_id() -> UserFunctionId {
    UserFunctionId::new("test-host", "ProductsTrigger")
}

fn products_db() -> MemoryDatabase {
    let db = MemoryDatabase::new();
    db.create_table(TABLE, &[("ProductId", "int")], &["ProductId", "Name"])
        .unwrap();
    db.enable_change_tracking(TABLE).unwrap();
    db
}

async fn open_store(db: &MemoryDatabase, max_batch_size: usize) -> Arc<dyn ChangeTrackingStore> {
    let config = TriggerConfig {
        max_batch_size,
        ..Default::default()
    };
    let target = TriggerTarget::new(function_id(), TABLE);
    db.open(&target, &config).await.unwrap()
}

#[tokio::test]
async fn test_workers_lease_disjoint_rows() {
    let db = products_db();
    for id in 1..=5 {
        db.insert(TABLE, json!({"ProductId": id})).unwrap();
    }
    let first = open_store(&db, 3).await;
    let second = open_store(&db, 3).await;

    let a = first.poll_changes().await.unwrap();
    let b = second.poll_changes().await.unwrap();
    assert_eq!(a.len(), 3);
    assert_eq!(b.len(), 2);
    for row in &a {
        assert!(!b.iter().any(|other| other.primary_key == row.primary_key));
    }
    assert!(first.poll_changes().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_watermark_waits_for_slow_row() {
    let db = products_db();
    for id in 1..=3 {
        db.insert(TABLE, json!({"ProductId": id})).unwrap();
    }
    let slow = open_store(&db, 1).await;
    let fast = open_store(&db, 10).await;

    let slow_rows = slow.poll_changes().await.unwrap();
    assert_eq!(slow_rows[0].version, 1);
    let fast_rows = fast.poll_changes().await.unwrap();
    assert_eq!(fast_rows.len(), 2);

    let candidate = candidate_version(&fast_rows).unwrap();
    assert_eq!(candidate, 2);
    assert!(!fast.release_leases(&fast_rows, candidate).await.unwrap());
    assert_eq!(db.watermark(&function_id(), TABLE), Some(0));

    assert!(slow.release_leases(&slow_rows, 1).await.unwrap());
    assert_eq!(db.watermark(&function_id(), TABLE), Some(1));

    // The next successful batch carries the watermark past the released rows.
    db.insert(TABLE, json!({"ProductId": 4})).unwrap();
    let rows = fast.poll_changes().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].version, 4);
    assert!(fast.release_leases(&rows, 4).await.unwrap());
    assert_eq!(db.watermark(&function_id(), TABLE), Some(4));
}

#[tokio::test]
async fn test_watermark_never_moves_backwards() {
    let db = products_db();
    for id in 1..=3 {
        db.insert(TABLE, json!({"ProductId": id})).unwrap();
    }
    let store = open_store(&db, 10).await;
    let rows = store.poll_changes().await.unwrap();
    assert!(store.release_leases(&rows, 3).await.unwrap());

    db.insert(TABLE, json!({"ProductId": 4})).unwrap();
    let rows = store.poll_changes().await.unwrap();
    assert!(!store.release_leases(&rows, 2).await.unwrap());
    assert_eq!(db.watermark(&function_id(), TABLE), Some(3));
}

#[tokio::test]
async fn test_release_of_older_version_keeps_newer_lease() {
    let db = products_db();
    db.insert(TABLE, json!({"ProductId": 1, "Name": "v1"}))
        .unwrap();
    for n in 2..=5 {
        db.update(TABLE, json!({"ProductId": 1, "Name": format!("v{n}")}))
            .unwrap();
    }
    let store = open_store(&db, 10).await;
    let rows = store.poll_changes().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].version, 5);

    let mut stale = rows[0].clone();
    stale.version = 3;
    store.release_leases(&[stale], 3).await.unwrap();

    let lease = db
        .lease(&function_id(), TABLE, json!({"ProductId": 1}))
        .unwrap();
    assert_eq!(lease.change_version, 5);
    assert_eq!(lease.attempt_count, 1);
    assert!(lease.held);

    store.release_leases(&rows, 5).await.unwrap();
    assert_eq!(db.watermark(&function_id(), TABLE), Some(5));
}

#[tokio::test]
async fn test_newer_change_to_released_row_is_polled_again() {
    let db = products_db();
    db.insert(TABLE, json!({"ProductId": 1})).unwrap();
    db.insert(TABLE, json!({"ProductId": 2})).unwrap();
    let store = open_store(&db, 10).await;

    let rows = store.poll_changes().await.unwrap();
    assert_eq!(rows.len(), 2);
    // Two distinct versions: the watermark only moves to the lower one.
    assert!(store.release_leases(&rows, 1).await.unwrap());
    assert!(store.poll_changes().await.unwrap().is_empty());

    db.update(TABLE, json!({"ProductId": 2, "Name": "changed"}))
        .unwrap();
    let rows = store.poll_changes().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].version, 3);
    assert_eq!(rows[0].attempt_count, 1);
    assert_eq!(rows[0].data.as_ref().unwrap()["Name"], json!("changed"));
}
