//! In-process key/value database backed by an ordered map.
//!
//! This is the natural "standalone mode" backend for the fallback facade: it
//! is always locally available and never needs a quorum. Transactions buffer
//! writes against a point-in-time snapshot and apply them on commit with
//! last-write-wins semantics; there is no cross-transaction conflict
//! detection.

use crate::error::{Error, Result};
use crate::kv::{KvDatabase, KvTransaction};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type KeyMap = BTreeMap<Vec<u8>, Vec<u8>>;

/// An in-memory, non-clustered key/value database.
pub struct MemoryKvDatabase {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    map: RwLock<KeyMap>,
    started: AtomicBool,
}

impl MemoryKvDatabase {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                map: RwLock::new(BTreeMap::new()),
                started: AtomicBool::new(false),
            }),
        }
    }
}

impl Default for MemoryKvDatabase {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvDatabase for MemoryKvDatabase {
    async fn start(&self) -> Result<()> {
        self.inner.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.inner.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn KvTransaction>> {
        if !self.inner.started.load(Ordering::SeqCst) {
            return Err(Error::NotStarted);
        }
        let snapshot = self.inner.map.read().clone();
        Ok(Box::new(MemoryKvTransaction {
            inner: Arc::clone(&self.inner),
            snapshot,
            state: Mutex::new(TxState::default()),
        }))
    }
}

#[derive(Default)]
struct TxState {
    /// Buffered writes; `None` marks a deletion.
    mutations: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    cleared: bool,
    read_only: bool,
}

struct MemoryKvTransaction {
    inner: Arc<MemoryInner>,
    snapshot: KeyMap,
    state: Mutex<TxState>,
}

fn lower_bound(after: Option<&[u8]>) -> Bound<Vec<u8>> {
    match after {
        Some(key) => Bound::Excluded(key.to_vec()),
        None => Bound::Unbounded,
    }
}

#[async_trait]
impl KvTransaction for MemoryKvTransaction {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let state = self.state.lock();
        if let Some(mutation) = state.mutations.get(key) {
            return Ok(mutation.clone());
        }
        if state.cleared {
            return Ok(None);
        }
        Ok(self.snapshot.get(key).cloned())
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if state.read_only {
            return Err(Error::Transaction("write in read-only transaction".into()));
        }
        state.mutations.insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if state.read_only {
            return Err(Error::Transaction("delete in read-only transaction".into()));
        }
        state.mutations.insert(key.to_vec(), None);
        Ok(())
    }

    async fn scan(&self, after: Option<&[u8]>, limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let state = self.state.lock();
        let range = (lower_bound(after), Bound::Unbounded);
        let empty = KeyMap::new();
        let base_map = if state.cleared { &empty } else { &self.snapshot };
        let mut base = base_map.range::<Vec<u8>, _>(range.clone()).peekable();
        let mut muts = state.mutations.range::<Vec<u8>, _>(range).peekable();

        // Merge the snapshot with the write buffer; on equal keys the buffered
        // mutation wins.
        enum Step {
            Base,
            Mutation,
            Both,
        }
        let mut out = Vec::new();
        while out.len() < limit {
            let step = match (base.peek(), muts.peek()) {
                (None, None) => break,
                (Some(_), None) => Step::Base,
                (None, Some(_)) => Step::Mutation,
                (Some((base_key, _)), Some((mut_key, _))) => {
                    if base_key < mut_key {
                        Step::Base
                    } else if mut_key < base_key {
                        Step::Mutation
                    } else {
                        Step::Both
                    }
                }
            };
            match step {
                Step::Base => {
                    let (key, value) = base.next().expect("peeked");
                    out.push((key.clone(), value.clone()));
                }
                Step::Mutation | Step::Both => {
                    if matches!(step, Step::Both) {
                        base.next();
                    }
                    let (key, mutation) = muts.next().expect("peeked");
                    if let Some(value) = mutation {
                        out.push((key.clone(), value.clone()));
                    }
                }
            }
        }
        Ok(out)
    }

    async fn clear(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.read_only {
            return Err(Error::Transaction("clear in read-only transaction".into()));
        }
        state.cleared = true;
        state.mutations.clear();
        Ok(())
    }

    fn set_read_only(&self) {
        self.state.lock().read_only = true;
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let this = *self;
        let state = this.state.into_inner();
        let mut map = this.inner.map.write();
        if state.cleared {
            map.clear();
        }
        for (key, mutation) in state.mutations {
            match mutation {
                Some(value) => {
                    map.insert(key, value);
                }
                None => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
