//! # fallback-kv
//!
//! A partition-tolerant key/value database facade. It multiplexes
//! application transactions across a prioritized list of clustered
//! (consensus-based) backends and a local "standalone mode" backend, and
//! automatically migrates active use between them as cluster availability
//! changes.
//!
//! A clustered backend halts when the local node loses its majority: even
//! read-only transactions cannot commit. [`FallbackKvDatabase`] adds
//! partition tolerance by probing each clustered target's availability and,
//! after a configurable dwell time, switching active use to the best
//! available backend — falling all the way back to the standalone database
//! when every cluster is unreachable. Data is carried across each switch by a
//! configurable [`MergeStrategy`]; when leaving a clustered backend the
//! outgoing data is read through an eventual-committed, read-only
//! transaction, so departure requires no quorum.
//!
//! ## Quick start
//!
//! ```no_run
//! use fallback_kv::{FallbackKvDatabase, FallbackTarget, MemoryKvDatabase};
//! use std::sync::Arc;
//!
//! # async fn example(cluster: Arc<dyn fallback_kv::ClusteredKvDatabase>) -> fallback_kv::Result<()> {
//! let db = FallbackKvDatabase::new();
//! db.set_state_file("/var/lib/myapp/fallback.state").await?;
//! db.set_standalone_target(Arc::new(MemoryKvDatabase::new())).await?;
//! db.set_fallback_target(FallbackTarget::new(cluster)).await?;
//! db.start().await?;
//!
//! let tx = db.create_transaction().await?;
//! tx.put(b"greeting", b"hello").await?;
//! tx.commit().await?;
//!
//! db.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Consistency trade
//!
//! Migrating between backends deliberately trades consistency for
//! availability. A transaction created before a migration completes can
//! never commit after it: the commit fails with a retry-class error and the
//! application retries against the newly active backend. The last migration
//! decision is persisted crash-safely, so a restarted process resumes on the
//! backend it last chose.

pub mod error;
pub mod fallback;
pub mod kv;
pub mod merge;
pub mod statefile;
pub mod timestamp;

pub use error::{Error, Result};
pub use fallback::{
    AvailabilityChecker, FallbackKvDatabase, FallbackKvTransaction, FallbackTarget,
    TransactionChecker,
};
pub use kv::{
    ClusteredKvDatabase, Consistency, KvDatabase, KvTransaction, MemoryKvDatabase,
    TransactionOptions,
};
pub use merge::{MergeStrategy, NullMergeStrategy, OverwriteMergeStrategy};
pub use statefile::{PersistedState, StateFile};
pub use timestamp::Timestamp;
