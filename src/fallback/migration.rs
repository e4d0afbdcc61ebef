//! The migration controller: decides which backend should be active and
//! performs the switch.
//!
//! A single periodic task owns migration checking. Probe edges wake it early;
//! the fixed cadence is what applies dwell deadlines that no probe edge
//! crosses. At most one migration is ever in flight (`migrating` flag), and
//! the flag is cleared on every exit path, including a contained panic.

use crate::error::Result;
use crate::fallback::core::Shared;
use crate::fallback::target::FallbackTarget;
use crate::kv::{BackendRef, KvTransaction};
use crate::merge::MergeStrategy;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Cadence of the periodic migration check.
const MIGRATION_CHECK_INTERVAL: Duration = Duration::from_millis(1000);

/// Hysteresis-adjusted usability of one target.
///
/// The incumbent stays usable until it has been unavailable for its full
/// `min_unavailable` dwell; any other target must have been available for its
/// full `min_available` dwell before it is trusted. `millis_since_change` is
/// `i64::MAX` when no availability edge was ever recorded, which counts as
/// infinitely long ago.
fn hysteresis_available(
    incumbent: bool,
    currently_available: bool,
    millis_since_change: i64,
    min_available: Duration,
    min_unavailable: Duration,
) -> bool {
    if currently_available {
        incumbent || millis_since_change >= min_available.as_millis() as i64
    } else {
        incumbent && millis_since_change < min_unavailable.as_millis() as i64
    }
}

/// Pick the best usable target index, or -1 for the standalone backend.
///
/// Scans from the most preferred target downward and stops at the first one
/// whose hysteresis-adjusted availability holds.
fn select_best_index(targets: &[FallbackTarget], current_index: i32) -> i32 {
    let mut best = targets.len() as i32 - 1;
    while best >= 0 {
        let target = &targets[best as usize];
        let incumbent = best == current_index;
        let millis_since_change = target
            .last_change
            .map(|ts| i64::from(ts.offset_from_now()))
            .unwrap_or(i64::MAX);
        let usable = hysteresis_available(
            incumbent,
            target.available,
            millis_since_change,
            target.min_available_time(),
            target.min_unavailable_time(),
        );
        tracing::trace!(
            target_index = best,
            incumbent,
            available = target.available,
            millis_since_change,
            usable,
            "target availability"
        );
        if usable {
            break;
        }
        best -= 1;
    }
    best
}

fn backend_label(index: i32) -> String {
    if index == -1 {
        "standalone database".to_string()
    } else {
        format!("fallback target #{index}")
    }
}

struct MigrationPlan {
    from_index: i32,
    to_index: i32,
    source: BackendRef,
    destination: BackendRef,
    strategy: Arc<dyn MergeStrategy>,
    /// Last time the incoming backend was active; handed to the strategy.
    destination_last_active: Option<DateTime<Utc>>,
}

impl MigrationPlan {
    fn describe(&self) -> String {
        format!(
            "migration from {} to {}",
            backend_label(self.from_index),
            backend_label(self.to_index)
        )
    }
}

pub(super) struct MigrationCheckTask {
    shared: Arc<Shared>,
    start_count: u64,
    cancel: CancellationToken,
}

impl MigrationCheckTask {
    pub(super) fn new(shared: Arc<Shared>, start_count: u64, cancel: CancellationToken) -> Self {
        Self {
            shared,
            start_count,
            cancel,
        }
    }

    /// Check loop: fixed cadence plus immediate wakeups on probe edges.
    pub(super) async fn run(self) {
        let start = tokio::time::Instant::now() + MIGRATION_CHECK_INTERVAL;
        let mut ticker = tokio::time::interval_at(start, MIGRATION_CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.shared.migration_wake.notified() => {}
            }
            let cycle = AssertUnwindSafe(self.check()).catch_unwind().await;
            if cycle.is_err() {
                tracing::error!("migration check panicked");
            }
        }
    }

    async fn check(&self) {
        // Selection happens under the lock; everything transactional happens
        // outside it so application traffic on the current backend keeps
        // flowing while data is merged.
        let plan = {
            let mut st = self.shared.state.lock().await;
            if !st.in_epoch(self.start_count) {
                return;
            }
            tracing::trace!("performing migration check");
            if st.migrating {
                return;
            }

            let current = st.current_target_index;
            let best = select_best_index(&st.targets, current);
            if best == current {
                return;
            }

            let Some(source) = st.backend_at(current) else {
                return;
            };
            let Some(destination) = st.backend_at(best) else {
                return;
            };
            // Degrading uses the outgoing target's policy; rejoining a more
            // preferred backend uses the incoming target's policy.
            let strategy = if best < current {
                st.targets[current as usize].unavailable_merge_strategy()
            } else {
                st.targets[best as usize].rejoin_merge_strategy()
            };
            let destination_last_active = if best == -1 {
                st.last_standalone_active_time
            } else {
                st.targets[best as usize].last_active_time
            };

            st.migrating = true;
            MigrationPlan {
                from_index: current,
                to_index: best,
                source,
                destination,
                strategy,
                destination_last_active,
            }
        };

        let desc = plan.describe();
        tracing::info!("starting fallback {desc} using {}", plan.strategy);

        let result = AssertUnwindSafe(self.execute(&plan)).catch_unwind().await;
        let succeeded = matches!(result, Ok(Ok(())));
        match &result {
            Ok(Ok(())) => tracing::info!("{desc} succeeded"),
            Ok(Err(e)) if e.is_retryable() => {
                tracing::info!("{desc} failed (will try again later): {e}");
            }
            Ok(Err(e)) => tracing::error!("{desc} failed: {e}"),
            Err(_) => tracing::error!("{desc} panicked"),
        }

        // Clear the in-flight flag on every path, then release anyone waiting
        // in stop().
        {
            let mut st = self.shared.state.lock().await;
            st.migrating = false;
        }
        self.shared.migration_done.notify_waiters();

        if succeeded {
            let st = self.shared.state.lock().await;
            if let Some(file) = &st.state_file {
                if let Err(e) = file.write(&st.persisted_snapshot()) {
                    // The in-memory switch stands; the next successful
                    // migration will re-persist.
                    tracing::error!(
                        path = %file.path().display(),
                        error = %e,
                        "error writing state file"
                    );
                }
            }
        }
    }

    async fn execute(&self, plan: &MigrationPlan) -> Result<()> {
        // On a clustered source this opens eventual-committed + read-only, so
        // committing it needs neither a quorum nor the network.
        let src = plan.source.begin_migration_source().await?;

        let dst = match plan.destination.begin().await {
            Ok(dst) => dst,
            Err(e) => {
                rollback_quietly(src).await;
                return Err(e);
            }
        };

        let switch_time = Utc::now();

        if let Err(e) = plan
            .strategy
            .merge(src.as_ref(), dst.as_ref(), plan.destination_last_active)
            .await
        {
            rollback_quietly(dst).await;
            rollback_quietly(src).await;
            return Err(e);
        }

        // Source first: its commit is local-only by construction, so failure
        // here still leaves the destination untouched and state unchanged.
        if let Err(e) = src.commit().await {
            rollback_quietly(dst).await;
            return Err(e);
        }
        dst.commit().await?;

        // Both sides are durable; redirect new transactions. The swap and the
        // migration-count bump happen under the same lock that transaction
        // creation takes, so every transaction is bound to exactly one
        // backend.
        let mut st = self.shared.state.lock().await;
        if plan.from_index == -1 {
            st.last_standalone_active_time = Some(switch_time);
        } else if let Some(target) = st.targets.get_mut(plan.from_index as usize) {
            target.last_active_time = Some(switch_time);
        }
        st.current_target_index = plan.to_index;
        st.migration_count += 1;
        Ok(())
    }
}

async fn rollback_quietly(tx: Box<dyn KvTransaction>) {
    if let Err(e) = tx.rollback().await {
        tracing::debug!(error = %e, "rollback during abandoned migration failed");
    }
}
