//! No transaction may straddle a migration: a commit after the active
//! backend moved must fail retry-class with the wrapped transaction rolled
//! back.

mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn flag_target(db: Arc<TestClusterDb>) -> fallback_kv::FallbackTarget {
    let flag = db.reachable_flag();
    fast_target(db).with_checker(Arc::new(FlagChecker::new(flag)))
}

#[tokio::test]
async fn commit_after_migration_fails_retry_class() {
    let dir = tempdir().unwrap();
    let alpha = TestClusterDb::new();
    let beta = TestClusterDb::new();
    let facade =
        build_facade(&dir, vec![flag_target(alpha.clone()), flag_target(beta.clone())]).await;
    facade.start().await.unwrap();

    // Open a transaction against the preferred cluster and leave it pending.
    let tx = facade.create_transaction().await.unwrap();
    tx.put(b"stale", b"write").await.unwrap();

    // Complete a migration underneath it.
    beta.set_reachable(false);
    wait_for_index(&facade, 0, Duration::from_secs(5)).await;

    let err = tx.commit().await.unwrap_err();
    assert!(err.is_retryable(), "expected retry-class error, got {err:?}");

    // The wrapped transaction was rolled back and its write never landed.
    assert_eq!(beta.rollbacks(), 1);
    assert_eq!(beta.read_local(b"stale").await, None);

    // A fresh transaction binds to the new backend and commits fine.
    facade_put(&facade, b"fresh", b"write").await;
    assert_eq!(alpha.read_local(b"fresh").await, Some(b"write".to_vec()));

    facade.stop().await;
}

#[tokio::test]
async fn rollback_is_unconditional_across_migration() {
    let dir = tempdir().unwrap();
    let alpha = TestClusterDb::new();
    let beta = TestClusterDb::new();
    let facade =
        build_facade(&dir, vec![flag_target(alpha.clone()), flag_target(beta.clone())]).await;
    facade.start().await.unwrap();

    let tx = facade.create_transaction().await.unwrap();
    tx.put(b"discard", b"me").await.unwrap();

    beta.set_reachable(false);
    wait_for_index(&facade, 0, Duration::from_secs(5)).await;

    tx.rollback().await.unwrap();
    assert_eq!(beta.rollbacks(), 1);

    facade.stop().await;
}
