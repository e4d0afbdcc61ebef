//! Shared test harness: a controllable stand-in for a consensus-backed
//! store, plus timing helpers for the scenario tests.
#![allow(dead_code)]

use async_trait::async_trait;
use fallback_kv::{
    AvailabilityChecker, ClusteredKvDatabase, Consistency, Error, FallbackKvDatabase,
    FallbackTarget, KvDatabase, KvTransaction, MemoryKvDatabase, MergeStrategy,
    OverwriteMergeStrategy, Result,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Probe period used by scenario tests.
pub const FAST_CHECK: Duration = Duration::from_millis(25);
/// Availability dwell used by scenario tests.
pub const DWELL: Duration = Duration::from_millis(400);

/// A stand-in for a consensus-backed store.
///
/// Reachability is a shared flag standing in for "this node can talk to a
/// cluster majority". While unreachable, opening or committing a
/// quorum-requiring transaction fails retry-class, but eventual-committed
/// transactions keep working against locally known state — the property the
/// migration controller depends on to leave a partitioned cluster.
pub struct TestClusterDb {
    local: MemoryKvDatabase,
    reachable: Arc<AtomicBool>,
    eventual_begins: AtomicU64,
    rollbacks: Arc<AtomicU64>,
}

impl TestClusterDb {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            local: MemoryKvDatabase::new(),
            reachable: Arc::new(AtomicBool::new(true)),
            eventual_begins: AtomicU64::new(0),
            rollbacks: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    pub fn reachable_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.reachable)
    }

    /// How many eventual-committed transactions were opened.
    pub fn eventual_begins(&self) -> u64 {
        self.eventual_begins.load(Ordering::SeqCst)
    }

    /// How many transactions were rolled back.
    pub fn rollbacks(&self) -> u64 {
        self.rollbacks.load(Ordering::SeqCst)
    }

    /// Peek at locally committed data, bypassing the facade and reachability.
    pub async fn read_local(&self, key: &[u8]) -> Option<Vec<u8>> {
        let tx = self.local.begin().await.expect("local begin");
        let value = tx.get(key).await.expect("local get");
        tx.rollback().await.expect("local rollback");
        value
    }
}

#[async_trait]
impl KvDatabase for TestClusterDb {
    async fn start(&self) -> Result<()> {
        self.local.start().await
    }

    async fn stop(&self) -> Result<()> {
        self.local.stop().await
    }

    async fn begin(&self) -> Result<Box<dyn KvTransaction>> {
        self.begin_with_consistency(Consistency::Linearizable).await
    }
}

#[async_trait]
impl ClusteredKvDatabase for TestClusterDb {
    async fn begin_with_consistency(
        &self,
        consistency: Consistency,
    ) -> Result<Box<dyn KvTransaction>> {
        let needs_quorum = matches!(consistency, Consistency::Linearizable);
        if needs_quorum && !self.is_reachable() {
            return Err(Error::TransactionRetry("cluster unreachable".into()));
        }
        if !needs_quorum {
            self.eventual_begins.fetch_add(1, Ordering::SeqCst);
        }
        let inner = self.local.begin().await?;
        Ok(Box::new(QuorumTx {
            inner,
            needs_quorum,
            reachable: Arc::clone(&self.reachable),
            rollbacks: Arc::clone(&self.rollbacks),
        }))
    }
}

struct QuorumTx {
    inner: Box<dyn KvTransaction>,
    needs_quorum: bool,
    reachable: Arc<AtomicBool>,
    rollbacks: Arc<AtomicU64>,
}

#[async_trait]
impl KvTransaction for QuorumTx {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.put(key, value).await
    }

    async fn delete(&self, key: &[u8]) -> Result<()> {
        self.inner.delete(key).await
    }

    async fn scan(&self, after: Option<&[u8]>, limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.inner.scan(after, limit).await
    }

    async fn clear(&self) -> Result<()> {
        self.inner.clear().await
    }

    fn set_read_only(&self) {
        self.inner.set_read_only();
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        if self.needs_quorum && !self.reachable.load(Ordering::SeqCst) {
            // The failed commit consumes the transaction.
            return Err(Error::TransactionRetry("cluster unreachable".into()));
        }
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        self.inner.rollback().await
    }
}

/// Availability checker driven directly by a shared flag, for tests that need
/// probing without any transaction traffic.
pub struct FlagChecker {
    available: Arc<AtomicBool>,
}

impl FlagChecker {
    pub fn new(available: Arc<AtomicBool>) -> Self {
        Self { available }
    }
}

#[async_trait]
impl AvailabilityChecker for FlagChecker {
    async fn check(&self, _db: &dyn ClusteredKvDatabase) -> Result<bool> {
        Ok(self.available.load(Ordering::SeqCst))
    }
}

/// Merge strategy that counts its invocations and then overwrites.
pub struct RecordingStrategy {
    label: &'static str,
    calls: Arc<AtomicU64>,
}

impl RecordingStrategy {
    pub fn new(label: &'static str) -> (Arc<Self>, Arc<AtomicU64>) {
        let calls = Arc::new(AtomicU64::new(0));
        (
            Arc::new(Self {
                label,
                calls: Arc::clone(&calls),
            }),
            calls,
        )
    }
}

impl fmt::Display for RecordingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label)
    }
}

#[async_trait]
impl MergeStrategy for RecordingStrategy {
    async fn merge(
        &self,
        src: &dyn KvTransaction,
        dst: &dyn KvTransaction,
        dst_last_active: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        OverwriteMergeStrategy.merge(src, dst, dst_last_active).await
    }
}

/// A target with test-friendly timing.
pub fn fast_target(db: Arc<TestClusterDb>) -> FallbackTarget {
    FallbackTarget::new(db)
        .with_check_interval(FAST_CHECK)
        .with_min_available_time(DWELL)
        .with_min_unavailable_time(DWELL)
}

/// A configured (but not started) facade over `targets` with a memory
/// standalone backend and a state file inside `dir`.
pub async fn build_facade(dir: &TempDir, targets: Vec<FallbackTarget>) -> FallbackKvDatabase {
    let facade = FallbackKvDatabase::new();
    facade
        .set_state_file(dir.path().join("fallback.state"))
        .await
        .expect("set state file");
    facade
        .set_standalone_target(Arc::new(MemoryKvDatabase::new()))
        .await
        .expect("set standalone");
    facade
        .set_fallback_targets(targets)
        .await
        .expect("set targets");
    facade
}

/// Poll until the facade routes to `want`, or panic after `within`.
pub async fn wait_for_index(facade: &FallbackKvDatabase, want: i32, within: Duration) {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let current = facade.current_target_index().await;
        if current == want {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for target index {want}, still at {current}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Write one pair through the facade and commit.
pub async fn facade_put(facade: &FallbackKvDatabase, key: &[u8], value: &[u8]) {
    let tx = facade.create_transaction().await.expect("create transaction");
    tx.put(key, value).await.expect("put");
    tx.commit().await.expect("commit");
}
