//! Data-copy policies applied when the facade migrates between backends.
//!
//! A merge strategy gets read-only access to the backend being switched away
//! from and read-write access to the backend being switched to. Strategies
//! are stateless and may run concurrently on disjoint transaction pairs.

use crate::error::Result;
use crate::kv::KvTransaction;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;

/// Keys copied per scan batch during an overwrite merge.
const COPY_BATCH: usize = 256;

/// Policy for moving data from an outgoing to an incoming backend.
#[async_trait]
pub trait MergeStrategy: Send + Sync + fmt::Display {
    /// Merge `src` into `dst`.
    ///
    /// `dst_last_active` is the last wall-clock time the destination backend
    /// was the active one, or `None` if it never was; strategies that
    /// reconcile by recency can use it to decide which side wins.
    async fn merge(
        &self,
        src: &dyn KvTransaction,
        dst: &dyn KvTransaction,
        dst_last_active: Option<DateTime<Utc>>,
    ) -> Result<()>;
}

/// Replace the destination's contents with a copy of the source.
#[derive(Clone, Copy, Debug, Default)]
pub struct OverwriteMergeStrategy;

#[async_trait]
impl MergeStrategy for OverwriteMergeStrategy {
    async fn merge(
        &self,
        src: &dyn KvTransaction,
        dst: &dyn KvTransaction,
        _dst_last_active: Option<DateTime<Utc>>,
    ) -> Result<()> {
        dst.clear().await?;
        let mut after: Option<Vec<u8>> = None;
        loop {
            let batch = src.scan(after.as_deref(), COPY_BATCH).await?;
            let Some((last_key, _)) = batch.last() else {
                break;
            };
            after = Some(last_key.clone());
            for (key, value) in &batch {
                dst.put(key, value).await?;
            }
            if batch.len() < COPY_BATCH {
                break;
            }
        }
        Ok(())
    }
}

impl fmt::Display for OverwriteMergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("overwrite merge strategy")
    }
}

/// Leave the destination unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullMergeStrategy;

#[async_trait]
impl MergeStrategy for NullMergeStrategy {
    async fn merge(
        &self,
        _src: &dyn KvTransaction,
        _dst: &dyn KvTransaction,
        _dst_last_active: Option<DateTime<Utc>>,
    ) -> Result<()> {
        Ok(())
    }
}

impl fmt::Display for NullMergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("null merge strategy")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{KvDatabase, MemoryKvDatabase};

    async fn db_with(pairs: &[(&[u8], &[u8])]) -> MemoryKvDatabase {
        let db = MemoryKvDatabase::new();
        db.start().await.unwrap();
        let tx = db.begin().await.unwrap();
        for (key, value) in pairs {
            tx.put(key, value).await.unwrap();
        }
        tx.commit().await.unwrap();
        db
    }

    #[tokio::test]
    async fn overwrite_replaces_destination() {
        let src_db = db_with(&[(b"a", b"1"), (b"b", b"2")]).await;
        let dst_db = db_with(&[(b"b", b"stale"), (b"z", b"extra")]).await;

        let src = src_db.begin().await.unwrap();
        src.set_read_only();
        let dst = dst_db.begin().await.unwrap();
        OverwriteMergeStrategy
            .merge(src.as_ref(), dst.as_ref(), None)
            .await
            .unwrap();
        src.commit().await.unwrap();
        dst.commit().await.unwrap();

        let check = dst_db.begin().await.unwrap();
        let pairs = check.scan(None, 10).await.unwrap();
        assert_eq!(
            pairs,
            vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"2".to_vec())]
        );
        check.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn null_merge_keeps_destination() {
        let src_db = db_with(&[(b"a", b"1")]).await;
        let dst_db = db_with(&[(b"z", b"keep")]).await;

        let src = src_db.begin().await.unwrap();
        let dst = dst_db.begin().await.unwrap();
        NullMergeStrategy
            .merge(src.as_ref(), dst.as_ref(), None)
            .await
            .unwrap();
        src.commit().await.unwrap();
        dst.commit().await.unwrap();

        let check = dst_db.begin().await.unwrap();
        assert_eq!(check.get(b"z").await.unwrap(), Some(b"keep".to_vec()));
        assert_eq!(check.get(b"a").await.unwrap(), None);
        check.rollback().await.unwrap();
    }
}
