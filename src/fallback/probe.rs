//! Periodic availability probing, one spawned task per fallback target.
//!
//! Each cycle is panic-contained so a misbehaving checker can never silently
//! kill probing for the rest of the process lifetime.

use crate::fallback::core::Shared;
use crate::fallback::target::{AvailabilityChecker, FallbackTarget};
use crate::kv::ClusteredKvDatabase;
use crate::timestamp::Timestamp;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub(super) struct AvailabilityProbe {
    shared: Arc<Shared>,
    index: usize,
    start_count: u64,
    checker: Arc<dyn AvailabilityChecker>,
    database: Arc<dyn ClusteredKvDatabase>,
    interval: Duration,
    cancel: CancellationToken,
}

impl AvailabilityProbe {
    pub(super) fn new(
        shared: Arc<Shared>,
        index: usize,
        start_count: u64,
        target: &FallbackTarget,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            shared,
            index,
            start_count,
            checker: target.checker(),
            database: target.database(),
            interval: target.check_interval(),
            cancel,
        }
    }

    /// Probe loop. The first check runs immediately, then every
    /// `check_interval`.
    pub(super) async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let cycle = AssertUnwindSafe(self.tick()).catch_unwind().await;
            if cycle.is_err() {
                tracing::error!(target_index = self.index, "availability check panicked");
            }
        }
    }

    async fn tick(&self) {
        // Bail out if the facade was stopped or restarted since this task was
        // scheduled.
        {
            let st = self.shared.state.lock().await;
            if !st.in_epoch(self.start_count) {
                return;
            }
        }

        tracing::trace!(target_index = self.index, "performing availability check");

        // The check itself runs outside the facade lock.
        let available = match self.checker.check(self.database.as_ref()).await {
            Ok(available) => available,
            Err(e) => {
                tracing::debug!(target_index = self.index, error = %e, "availability check failed");
                false
            }
        };

        let mut st = self.shared.state.lock().await;
        if !st.in_epoch(self.start_count) {
            return;
        }
        let Some(target) = st.targets.get_mut(self.index) else {
            return;
        };

        // A timestamp near counter wraparound can no longer be compared
        // against "now"; treat it as infinitely old.
        if target
            .last_change
            .is_some_and(|ts| ts.is_rollover_danger())
        {
            target.last_change = None;
        }

        if available == target.available {
            return;
        }

        tracing::info!(
            target_index = self.index,
            available,
            "fallback target has become {}",
            if available { "available" } else { "unavailable" }
        );
        target.available = available;
        target.last_change = Some(Timestamp::now());
        drop(st);

        // Edge detected: ask the migration-check task to run now rather than
        // waiting for its next periodic tick.
        self.shared.migration_wake.notify_one();
    }
}
