//! Lifecycle surface: idempotent start/stop, frozen configuration while
//! started, and restartability.

mod common;

use common::*;
use fallback_kv::{Error, FallbackTarget, MemoryKvDatabase, TransactionOptions};
use std::sync::Arc;
use tempfile::tempdir;

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let dir = tempdir().unwrap();
    let facade = build_facade(&dir, vec![fast_target(TestClusterDb::new())]).await;

    facade.start().await.unwrap();
    facade.start().await.unwrap();

    facade.stop().await;
    facade.stop().await;

    // And the facade can be started again after a stop.
    facade.start().await.unwrap();
    facade_put(&facade, b"again", b"1").await;
    facade.stop().await;
}

#[tokio::test]
async fn configuration_is_frozen_while_started() {
    let dir = tempdir().unwrap();
    let facade = build_facade(&dir, vec![fast_target(TestClusterDb::new())]).await;
    facade.start().await.unwrap();

    assert!(matches!(
        facade.set_state_file(dir.path().join("other.state")).await,
        Err(Error::AlreadyStarted)
    ));
    assert!(matches!(
        facade
            .set_standalone_target(Arc::new(MemoryKvDatabase::new()))
            .await,
        Err(Error::AlreadyStarted)
    ));
    assert!(matches!(
        facade
            .set_fallback_target(FallbackTarget::new(TestClusterDb::new()))
            .await,
        Err(Error::AlreadyStarted)
    ));

    facade.stop().await;

    // After stop the configuration thaws.
    facade
        .set_state_file(dir.path().join("other.state"))
        .await
        .unwrap();
}

#[tokio::test]
async fn options_surface_accepts_empty_options() {
    let dir = tempdir().unwrap();
    let facade = build_facade(&dir, vec![fast_target(TestClusterDb::new())]).await;
    facade.start().await.unwrap();

    let tx = facade
        .create_transaction_with_options(TransactionOptions::default())
        .await
        .unwrap();
    tx.put(b"k", b"v").await.unwrap();
    tx.commit().await.unwrap();

    facade.stop().await;
}
