//! Transaction wrapper enforcing the migration boundary.

use crate::error::{Error, Result};
use crate::fallback::core::Shared;
use crate::kv::KvTransaction;
use async_trait::async_trait;
use std::sync::Arc;

/// A transaction bound to whichever backend was active when it was created.
///
/// The facade's migration count is captured at creation; if it has moved by
/// commit time, a migration completed in between and the commit fails with a
/// retry-class error instead of committing stale work across the boundary.
pub struct FallbackKvTransaction {
    shared: Arc<Shared>,
    inner: Box<dyn KvTransaction>,
    migration_count: u64,
}

impl FallbackKvTransaction {
    pub(super) fn new(shared: Arc<Shared>, inner: Box<dyn KvTransaction>, migration_count: u64) -> Self {
        Self {
            shared,
            inner,
            migration_count,
        }
    }

    /// The facade migration count captured when this transaction was created.
    pub fn migration_count(&self) -> u64 {
        self.migration_count
    }

    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    pub async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.put(key, value).await
    }

    pub async fn delete(&self, key: &[u8]) -> Result<()> {
        self.inner.delete(key).await
    }

    pub async fn scan(&self, after: Option<&[u8]>, limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.inner.scan(after, limit).await
    }

    pub async fn clear(&self) -> Result<()> {
        self.inner.clear().await
    }

    pub fn set_read_only(&self) {
        self.inner.set_read_only();
    }

    /// Commit the wrapped transaction, unless a migration completed since
    /// this transaction was created; in that case the wrapped transaction is
    /// rolled back and the commit fails retry-class.
    pub async fn commit(self) -> Result<()> {
        let current = self.shared.state.lock().await.migration_count;
        if current != self.migration_count {
            if let Err(e) = self.inner.rollback().await {
                tracing::warn!(error = %e, "rollback of superseded transaction failed");
            }
            return Err(Error::TransactionRetry(
                "backend migration completed before commit".into(),
            ));
        }
        self.inner.commit().await
    }

    /// Roll back the wrapped transaction unconditionally.
    pub async fn rollback(self) -> Result<()> {
        self.inner.rollback().await
    }
}

#[async_trait]
impl KvTransaction for FallbackKvTransaction {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        FallbackKvTransaction::get(self, key).await
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        FallbackKvTransaction::put(self, key, value).await
    }

    async fn delete(&self, key: &[u8]) -> Result<()> {
        FallbackKvTransaction::delete(self, key).await
    }

    async fn scan(&self, after: Option<&[u8]>, limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        FallbackKvTransaction::scan(self, after, limit).await
    }

    async fn clear(&self) -> Result<()> {
        FallbackKvTransaction::clear(self).await
    }

    fn set_read_only(&self) {
        FallbackKvTransaction::set_read_only(self);
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        FallbackKvTransaction::commit(*self).await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        FallbackKvTransaction::rollback(*self).await
    }
}
