//! Per-target configuration and runtime availability state.

use crate::error::{Error, Result};
use crate::kv::{ClusteredKvDatabase, KvDatabase};
use crate::merge::{MergeStrategy, OverwriteMergeStrategy};
use crate::timestamp::Timestamp;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::RngCore;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default period between availability checks.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(2000);
/// Default dwell time a target must stay available before rejoining it.
pub const DEFAULT_MIN_AVAILABLE_TIME: Duration = Duration::from_secs(10);
/// Default dwell time a target must stay unavailable before leaving it.
pub const DEFAULT_MIN_UNAVAILABLE_TIME: Duration = Duration::from_secs(30);
/// Default bound on a single availability probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Decides whether a clustered backend is currently usable.
///
/// Checkers must bound their own latency; the probe loop applies no timeout
/// of its own.
#[async_trait]
pub trait AvailabilityChecker: Send + Sync {
    async fn check(&self, db: &dyn ClusteredKvDatabase) -> Result<bool>;
}

/// Default availability checker: read one random key through a transaction at
/// the backend's default consistency, then roll back. Default consistency
/// requires cluster communication, so a partitioned node fails the check.
#[derive(Clone, Copy, Debug)]
pub struct TransactionChecker {
    timeout: Duration,
}

impl TransactionChecker {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TransactionChecker {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}

#[async_trait]
impl AvailabilityChecker for TransactionChecker {
    async fn check(&self, db: &dyn ClusteredKvDatabase) -> Result<bool> {
        let probe = async {
            let tx = db.begin().await?;
            let mut key = [0u8; 8];
            rand::thread_rng().fill_bytes(&mut key);
            let read = tx.get(&key).await;
            let rollback = tx.rollback().await;
            read?;
            rollback?;
            Ok(true)
        };
        match tokio::time::timeout(self.timeout, probe).await {
            Ok(result) => result,
            Err(_) => Err(Error::Transaction(format!(
                "availability probe timed out after {:?}",
                self.timeout
            ))),
        }
    }
}

/// One clustered backend the facade can fall back to, plus its probing and
/// migration policy.
///
/// Targets are configuration plus runtime state; the runtime fields are
/// mutated only by the probe and migration tasks under the facade lock.
/// Cloning a target yields a point-in-time snapshot.
#[derive(Clone)]
pub struct FallbackTarget {
    database: Arc<dyn ClusteredKvDatabase>,
    checker: Arc<dyn AvailabilityChecker>,
    check_interval: Duration,
    min_available_time: Duration,
    min_unavailable_time: Duration,
    rejoin_merge_strategy: Arc<dyn MergeStrategy>,
    unavailable_merge_strategy: Arc<dyn MergeStrategy>,

    pub(crate) available: bool,
    pub(crate) last_change: Option<Timestamp>,
    pub(crate) last_active_time: Option<DateTime<Utc>>,
}

impl FallbackTarget {
    /// Create a target for `database` with default probing and merge policy.
    pub fn new(database: Arc<dyn ClusteredKvDatabase>) -> Self {
        Self {
            database,
            checker: Arc::new(TransactionChecker::default()),
            check_interval: DEFAULT_CHECK_INTERVAL,
            min_available_time: DEFAULT_MIN_AVAILABLE_TIME,
            min_unavailable_time: DEFAULT_MIN_UNAVAILABLE_TIME,
            rejoin_merge_strategy: Arc::new(OverwriteMergeStrategy),
            unavailable_merge_strategy: Arc::new(OverwriteMergeStrategy),
            available: false,
            last_change: None,
            last_active_time: None,
        }
    }

    pub fn with_checker(mut self, checker: Arc<dyn AvailabilityChecker>) -> Self {
        self.checker = checker;
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_min_available_time(mut self, dwell: Duration) -> Self {
        self.min_available_time = dwell;
        self
    }

    pub fn with_min_unavailable_time(mut self, dwell: Duration) -> Self {
        self.min_unavailable_time = dwell;
        self
    }

    pub fn with_rejoin_merge_strategy(mut self, strategy: Arc<dyn MergeStrategy>) -> Self {
        self.rejoin_merge_strategy = strategy;
        self
    }

    pub fn with_unavailable_merge_strategy(mut self, strategy: Arc<dyn MergeStrategy>) -> Self {
        self.unavailable_merge_strategy = strategy;
        self
    }

    pub fn database(&self) -> Arc<dyn ClusteredKvDatabase> {
        Arc::clone(&self.database)
    }

    pub(crate) fn database_ref(&self) -> &dyn ClusteredKvDatabase {
        self.database.as_ref()
    }

    pub(crate) fn checker(&self) -> Arc<dyn AvailabilityChecker> {
        Arc::clone(&self.checker)
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    pub fn min_available_time(&self) -> Duration {
        self.min_available_time
    }

    pub fn min_unavailable_time(&self) -> Duration {
        self.min_unavailable_time
    }

    pub(crate) fn rejoin_merge_strategy(&self) -> Arc<dyn MergeStrategy> {
        Arc::clone(&self.rejoin_merge_strategy)
    }

    pub(crate) fn unavailable_merge_strategy(&self) -> Arc<dyn MergeStrategy> {
        Arc::clone(&self.unavailable_merge_strategy)
    }

    /// Availability as of the last completed probe.
    pub fn available(&self) -> bool {
        self.available
    }

    /// Last wall-clock time this target was the active backend.
    pub fn last_active_time(&self) -> Option<DateTime<Utc>> {
        self.last_active_time
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.check_interval.is_zero() {
            return Err(Error::Config("target check interval must be > 0".into()));
        }
        Ok(())
    }
}

impl fmt::Debug for FallbackTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackTarget")
            .field("check_interval", &self.check_interval)
            .field("min_available_time", &self.min_available_time)
            .field("min_unavailable_time", &self.min_unavailable_time)
            .field("available", &self.available)
            .field("last_active_time", &self.last_active_time)
            .finish_non_exhaustive()
    }
}
