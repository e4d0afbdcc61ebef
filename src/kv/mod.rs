//! Backend key/value database capabilities consumed by the fallback facade.
//!
//! Backends are opaque: the facade only needs transactional create / commit /
//! rollback plus, for clustered backends, the ability to open a transaction at
//! a chosen [`Consistency`] level. Everything else about a backend (storage,
//! replication, conflict handling) is its own business.

mod memory;

pub use memory::MemoryKvDatabase;

use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Consistency level for transactions on a clustered backend.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Consistency {
    /// Reads and commits go through the cluster and require a majority.
    #[default]
    Linearizable,
    /// Reads reflect locally known committed state and commit contacts no
    /// peers. This is the level that lets a node leave an unreachable
    /// cluster: committing such a transaction generates no network traffic.
    EventualCommitted,
}

/// Options accepted when creating a transaction.
///
/// Currently empty; present so the surface can grow without breaking callers.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct TransactionOptions {}

/// A single transaction against a backend database.
///
/// A failed [`commit`](KvTransaction::commit) consumes the transaction; the
/// implementation is responsible for discarding any buffered state.
#[async_trait]
pub trait KvTransaction: Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    async fn delete(&self, key: &[u8]) -> Result<()>;

    /// Ordered scan of up to `limit` pairs with key strictly greater than
    /// `after` (`None` starts from the beginning).
    async fn scan(&self, after: Option<&[u8]>, limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Remove every key visible to this transaction.
    async fn clear(&self) -> Result<()>;

    /// Mark this transaction read-only; subsequent mutations fail.
    fn set_read_only(&self);

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// A transactional key/value database.
#[async_trait]
pub trait KvDatabase: Send + Sync {
    /// Begin lifecycle; idempotent.
    async fn start(&self) -> Result<()>;

    /// End lifecycle; idempotent.
    async fn stop(&self) -> Result<()>;

    /// Open a read-write transaction at the backend's default consistency.
    async fn begin(&self) -> Result<Box<dyn KvTransaction>>;
}

/// A key/value database whose availability depends on communicating with a
/// majority of cluster peers.
#[async_trait]
pub trait ClusteredKvDatabase: KvDatabase {
    /// Open a transaction at an explicit consistency level.
    async fn begin_with_consistency(
        &self,
        consistency: Consistency,
    ) -> Result<Box<dyn KvTransaction>>;
}

/// Reference to one of the facade's underlying databases.
///
/// The standalone and clustered cases carry different capabilities, so the
/// distinction is a tagged enum rather than a downcast.
#[derive(Clone)]
pub(crate) enum BackendRef {
    Standalone(Arc<dyn KvDatabase>),
    Clustered(Arc<dyn ClusteredKvDatabase>),
}

impl BackendRef {
    /// Open a regular read-write transaction.
    pub(crate) async fn begin(&self) -> Result<Box<dyn KvTransaction>> {
        match self {
            BackendRef::Standalone(db) => db.begin().await,
            BackendRef::Clustered(db) => db.begin().await,
        }
    }

    /// Open the source side of a migration.
    ///
    /// On a clustered backend the transaction is eventual-committed and
    /// read-only, so its commit needs neither a quorum nor the network; that
    /// combination is what allows leaving a partitioned cluster at all.
    pub(crate) async fn begin_migration_source(&self) -> Result<Box<dyn KvTransaction>> {
        match self {
            BackendRef::Standalone(db) => db.begin().await,
            BackendRef::Clustered(db) => {
                let tx = db
                    .begin_with_consistency(Consistency::EventualCommitted)
                    .await?;
                tx.set_read_only();
                Ok(tx)
            }
        }
    }
}
