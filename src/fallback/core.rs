//! The fallback facade: configuration, lifecycle, and transaction routing.
//!
//! # Concurrency model
//!
//! One coarse `tokio::sync::Mutex` guards every piece of mutable facade
//! state. Guard sections are short; the two deliberate exceptions are
//! `create_transaction` (the lock is held across the backend `begin()` so the
//! active-backend swap is atomic with respect to transaction creation) and
//! the post-migration swap itself. Availability checks, merges and
//! commit/rollback all run outside the lock.
//!
//! Scheduled work (per-target probes, the migration-check loop) captures the
//! `start_count` epoch at spawn time; a task whose epoch no longer matches
//! returns without effect, so work scheduled by a previous lifecycle can
//! never touch the current one.

use crate::error::{Error, Result};
use crate::fallback::migration::MigrationCheckTask;
use crate::fallback::probe::AvailabilityProbe;
use crate::fallback::target::FallbackTarget;
use crate::fallback::transaction::FallbackKvTransaction;
use crate::kv::{BackendRef, KvDatabase, KvTransaction, TransactionOptions};
use crate::statefile::{PersistedState, StateFile};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A partition-tolerant key/value database that multiplexes transactions
/// across a prioritized list of clustered backends and a local standalone
/// backend, migrating between them as cluster availability changes.
///
/// Targets are ordered by increasing preference: index 0 is the least
/// preferred clustered backend, the last index the most preferred. The
/// standalone backend always has the lowest priority of all and is denoted by
/// target index -1.
///
/// Switching backends trades consistency for availability; a configurable
/// [`MergeStrategy`](crate::merge::MergeStrategy) migrates data at each
/// switch. When leaving a clustered backend the outgoing data is read through
/// an eventual-committed, read-only transaction, so no cluster quorum is
/// needed to leave a partitioned cluster.
pub struct FallbackKvDatabase {
    shared: Arc<Shared>,
}

pub(super) struct Shared {
    /// Single coarse lock over all mutable facade state.
    pub(super) state: Mutex<FacadeState>,
    /// Broadcast whenever an in-flight migration finishes, success or not.
    pub(super) migration_done: Notify,
    /// Wakes the migration-check task ahead of its periodic tick.
    pub(super) migration_wake: Notify,
}

pub(super) struct FacadeState {
    pub(super) started: bool,
    /// Startup epoch; bumped on every start() to invalidate stale tasks.
    pub(super) start_count: u64,
    pub(super) migrating: bool,
    pub(super) migration_count: u64,
    /// Index into `targets`, or -1 for the standalone backend.
    pub(super) current_target_index: i32,
    pub(super) last_standalone_active_time: Option<DateTime<Utc>>,
    pub(super) state_file: Option<StateFile>,
    pub(super) standalone: Option<Arc<dyn KvDatabase>>,
    pub(super) targets: Vec<FallbackTarget>,
    tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl FacadeState {
    /// Resolve a target index (or -1) to its backend.
    pub(super) fn backend_at(&self, index: i32) -> Option<BackendRef> {
        if index < 0 {
            self.standalone
                .as_ref()
                .map(|db| BackendRef::Standalone(Arc::clone(db)))
        } else {
            self.targets
                .get(index as usize)
                .map(|target| BackendRef::Clustered(target.database()))
        }
    }

    pub(super) fn persisted_snapshot(&self) -> PersistedState {
        PersistedState {
            active_index: self.current_target_index,
            standalone_last_active: self.last_standalone_active_time,
            target_last_active: self
                .targets
                .iter()
                .map(|target| target.last_active_time)
                .collect(),
        }
    }

    /// Whether the facade is still in the startup epoch a task was spawned in.
    pub(super) fn in_epoch(&self, start_count: u64) -> bool {
        self.started && self.start_count == start_count
    }
}

impl FallbackKvDatabase {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(FacadeState {
                    started: false,
                    start_count: 0,
                    migrating: false,
                    migration_count: 0,
                    current_target_index: -1,
                    last_standalone_active_time: None,
                    state_file: None,
                    standalone: None,
                    targets: Vec::new(),
                    tasks: Vec::new(),
                    cancel: CancellationToken::new(),
                }),
                migration_done: Notify::new(),
                migration_wake: Notify::new(),
            }),
        }
    }

    // Configuration. Each setter refuses changes once started.

    /// Configure the persistent state file. Required before `start()`.
    pub async fn set_state_file(&self, path: impl Into<PathBuf>) -> Result<()> {
        let mut st = self.shared.state.lock().await;
        if st.started {
            return Err(Error::AlreadyStarted);
        }
        st.state_file = Some(StateFile::new(path.into()));
        Ok(())
    }

    pub async fn state_file(&self) -> Option<PathBuf> {
        let st = self.shared.state.lock().await;
        st.state_file.as_ref().map(|f| f.path().to_path_buf())
    }

    /// Configure the local database used when every fallback target is
    /// unavailable. Required before `start()`.
    pub async fn set_standalone_target(&self, db: Arc<dyn KvDatabase>) -> Result<()> {
        let mut st = self.shared.state.lock().await;
        if st.started {
            return Err(Error::AlreadyStarted);
        }
        st.standalone = Some(db);
        Ok(())
    }

    pub async fn standalone_target(&self) -> Option<Arc<dyn KvDatabase>> {
        let st = self.shared.state.lock().await;
        st.standalone.clone()
    }

    /// Configure a single fallback target.
    pub async fn set_fallback_target(&self, target: FallbackTarget) -> Result<()> {
        self.set_fallback_targets(vec![target]).await
    }

    /// Configure the fallback targets, in order of increasing preference.
    pub async fn set_fallback_targets(&self, targets: Vec<FallbackTarget>) -> Result<()> {
        if targets.is_empty() {
            return Err(Error::Config("empty fallback target list".into()));
        }
        for target in &targets {
            target.validate()?;
        }
        let mut st = self.shared.state.lock().await;
        if st.started {
            return Err(Error::AlreadyStarted);
        }
        st.targets = targets;
        Ok(())
    }

    /// The most preferred fallback target, if any are configured. Snapshot.
    pub async fn fallback_target(&self) -> Option<FallbackTarget> {
        let st = self.shared.state.lock().await;
        st.targets.last().cloned()
    }

    /// Snapshot of every configured target, in order of increasing
    /// preference.
    pub async fn fallback_targets(&self) -> Vec<FallbackTarget> {
        let st = self.shared.state.lock().await;
        st.targets.clone()
    }

    // Introspection.

    /// Index of the currently active backend; -1 means standalone mode.
    pub async fn current_target_index(&self) -> i32 {
        self.shared.state.lock().await.current_target_index
    }

    /// Last time the standalone backend was active, or `None` if never.
    pub async fn last_standalone_active_time(&self) -> Option<DateTime<Utc>> {
        self.shared.state.lock().await.last_standalone_active_time
    }

    // Lifecycle.

    /// Start the facade and everything underneath it. Idempotent.
    pub async fn start(&self) -> Result<()> {
        let mut st = self.shared.state.lock().await;
        if st.started {
            return Ok(());
        }
        st.start_count += 1;

        if st.state_file.is_none() {
            return Err(Error::Config("no state file configured".into()));
        }
        if st.standalone.is_none() {
            return Err(Error::Config("no standalone target configured".into()));
        }
        if st.targets.is_empty() {
            return Err(Error::Config("no fallback targets configured".into()));
        }

        tracing::debug!("starting up fallback database");
        match self.start_locked(&mut st).await {
            Ok(()) => {
                st.started = true;
                Ok(())
            }
            Err(e) => {
                self.cleanup_locked(&mut st).await;
                Err(e)
            }
        }
    }

    async fn start_locked(&self, st: &mut FacadeState) -> Result<()> {
        // Start underlying databases.
        if let Some(standalone) = &st.standalone {
            standalone.start().await?;
        }
        for target in &st.targets {
            target.database_ref().start().await?;
        }

        // Initialize runtime state. Targets begin optimistically available so
        // the most preferred one is usable until a probe says otherwise.
        for target in &mut st.targets {
            target.available = true;
            target.last_change = None;
        }
        st.current_target_index = st.targets.len() as i32 - 1;
        st.migration_count = 0;
        st.migrating = false;

        // Apply persisted state if present. Corruption is fatal here;
        // a configuration-change mismatch was already ignored inside read().
        if let Some(file) = st.state_file.clone() {
            if file.exists() {
                if let Some(persisted) = file.read(st.targets.len())? {
                    st.current_target_index = persisted.active_index;
                    st.last_standalone_active_time = persisted.standalone_last_active;
                    for (target, last_active) in
                        st.targets.iter_mut().zip(persisted.target_last_active)
                    {
                        target.last_active_time = last_active;
                    }
                }
            }
        }

        // Spawn per-target probes and the migration-check loop under a fresh
        // cancellation token.
        st.cancel = CancellationToken::new();
        st.tasks.clear();
        let start_count = st.start_count;
        for (index, target) in st.targets.iter().enumerate() {
            let probe = AvailabilityProbe::new(
                Arc::clone(&self.shared),
                index,
                start_count,
                target,
                st.cancel.clone(),
            );
            st.tasks.push(tokio::spawn(probe.run()));
        }
        let check = MigrationCheckTask::new(Arc::clone(&self.shared), start_count, st.cancel.clone());
        st.tasks.push(tokio::spawn(check.run()));
        Ok(())
    }

    /// Stop the facade. Idempotent.
    ///
    /// Waits for any in-flight migration to drain first; `started` is
    /// re-checked after each wake in case a concurrent `stop()` won the race.
    /// Backend shutdown errors are logged and swallowed so stop always
    /// completes.
    pub async fn stop(&self) {
        loop {
            let notified = self.shared.migration_done.notified();
            tokio::pin!(notified);
            {
                let mut st = self.shared.state.lock().await;
                if !st.started {
                    return;
                }
                if !st.migrating {
                    tracing::debug!("shutting down fallback database");
                    self.cleanup_locked(&mut st).await;
                    return;
                }
                tracing::debug!("waiting for in-flight migration before shutdown");
                notified.as_mut().enable();
            }
            notified.await;
        }
    }

    async fn cleanup_locked(&self, st: &mut FacadeState) {
        for target in &mut st.targets {
            target.available = false;
            target.last_change = None;
        }

        st.cancel.cancel();
        for task in st.tasks.drain(..) {
            task.abort();
        }

        for target in &st.targets {
            if let Err(e) = target.database_ref().stop().await {
                tracing::warn!(error = %e, "error stopping fallback target database (ignoring)");
            }
        }
        if let Some(standalone) = &st.standalone {
            if let Err(e) = standalone.stop().await {
                tracing::warn!(error = %e, "error stopping standalone database (ignoring)");
            }
        }

        st.started = false;
    }

    // Data plane.

    /// Open a transaction against the currently active backend.
    ///
    /// The returned transaction is bound to that backend: if a migration
    /// completes before it commits, the commit fails with a retry-class
    /// error instead of committing across the migration boundary.
    pub async fn create_transaction(&self) -> Result<FallbackKvTransaction> {
        let st = self.shared.state.lock().await;
        if !st.started {
            return Err(Error::NotStarted);
        }
        let backend = st
            .backend_at(st.current_target_index)
            .ok_or(Error::NotStarted)?;
        let inner = backend.begin().await?;
        Ok(FallbackKvTransaction::new(
            Arc::clone(&self.shared),
            inner,
            st.migration_count,
        ))
    }

    /// Open a transaction with options. No options are defined yet; the
    /// parameter exists for forward compatibility.
    pub async fn create_transaction_with_options(
        &self,
        _options: TransactionOptions,
    ) -> Result<FallbackKvTransaction> {
        self.create_transaction().await
    }
}

impl Default for FallbackKvDatabase {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvDatabase for FallbackKvDatabase {
    async fn start(&self) -> Result<()> {
        FallbackKvDatabase::start(self).await
    }

    async fn stop(&self) -> Result<()> {
        FallbackKvDatabase::stop(self).await;
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn KvTransaction>> {
        Ok(Box::new(self.create_transaction().await?))
    }
}
