//! Ordered key-value abstraction used by the task system's durable store.
//!
//! Keys are ordered byte-lexicographically; transactions are serializable
//! on a single store. The production deployment backs this with an
//! embedded B-tree store; [`MemKv`] is the in-process implementation used
//! by the server composition and by tests.

use std::collections::BTreeMap;

use parking_lot::{Mutex, RwLock};
use rill_common::Result;

/// Read surface of one transaction.
pub trait ReadTx {
    /// Look up one key.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Ordered cursor over every pair whose key starts with `prefix`.
    fn cursor(&self, prefix: &[u8]) -> Result<KvCursor>;
}

/// Write surface of one transaction. Mutations become visible to other
/// transactions only when the `update` closure returns `Ok`.
pub trait WriteTx: ReadTx {
    /// Insert or replace one pair.
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Remove one key; removing an absent key is a no-op.
    fn delete(&mut self, key: &[u8]) -> Result<()>;
}

/// Ordered iterator over a prefix scan.
///
/// Materialized at creation: the cursor observes the transaction's state
/// at the moment `cursor` was called, unaffected by later writes in the
/// same transaction.
pub struct KvCursor {
    pairs: std::vec::IntoIter<(Vec<u8>, Vec<u8>)>,
}

impl KvCursor {
    fn new(pairs: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        Self {
            pairs: pairs.into_iter(),
        }
    }
}

impl Iterator for KvCursor {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        self.pairs.next()
    }
}

/// An ordered key-value store with serializable transactions.
pub trait KvStore: Send + Sync + 'static {
    /// Run a read-only transaction.
    fn view<T>(&self, f: impl FnOnce(&dyn ReadTx) -> Result<T>) -> Result<T>;

    /// Run a read-write transaction. The transaction commits when `f`
    /// returns `Ok` and is discarded wholesale when it returns `Err`.
    fn update<T>(&self, f: impl FnOnce(&mut dyn WriteTx) -> Result<T>) -> Result<T>;
}

/// In-memory store backed by a `BTreeMap`.
///
/// Readers share a lock; writers serialize through a dedicated mutex held
/// for the whole update closure, which is what makes `update` transactions
/// serializable.
#[derive(Debug, Default)]
pub struct MemKv {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    write_lock: Mutex<()>,
}

impl MemKv {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

fn scan_prefix(map: &BTreeMap<Vec<u8>, Vec<u8>>, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
    map.range(prefix.to_vec()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

struct MemReadTx<'a> {
    base: &'a BTreeMap<Vec<u8>, Vec<u8>>,
}

impl ReadTx for MemReadTx<'_> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.base.get(key).cloned())
    }

    fn cursor(&self, prefix: &[u8]) -> Result<KvCursor> {
        Ok(KvCursor::new(scan_prefix(self.base, prefix)))
    }
}

/// Staged mutations layered over the committed map: `Some` is a pending
/// put, `None` a pending delete.
struct MemWriteTx<'a> {
    base: &'a BTreeMap<Vec<u8>, Vec<u8>>,
    pending: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl ReadTx for MemWriteTx<'_> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(staged) = self.pending.get(key) {
            return Ok(staged.clone());
        }
        Ok(self.base.get(key).cloned())
    }

    fn cursor(&self, prefix: &[u8]) -> Result<KvCursor> {
        let mut merged = scan_prefix(self.base, prefix)
            .into_iter()
            .collect::<BTreeMap<_, _>>();
        for (key, staged) in self
            .pending
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
        {
            match staged {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(KvCursor::new(merged.into_iter().collect()))
    }
}

impl WriteTx for MemWriteTx<'_> {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.pending.insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.pending.insert(key.to_vec(), None);
        Ok(())
    }
}

impl KvStore for MemKv {
    fn view<T>(&self, f: impl FnOnce(&dyn ReadTx) -> Result<T>) -> Result<T> {
        let data = self.data.read();
        let tx = MemReadTx { base: &data };
        f(&tx)
    }

    fn update<T>(&self, f: impl FnOnce(&mut dyn WriteTx) -> Result<T>) -> Result<T> {
        let _writer = self.write_lock.lock();
        let staged = {
            let data = self.data.read();
            let mut tx = MemWriteTx {
                base: &data,
                pending: BTreeMap::new(),
            };
            let out = f(&mut tx)?;
            (out, tx.pending)
        };
        let (out, pending) = staged;
        let mut data = self.data.write();
        for (key, value) in pending {
            match value {
                Some(value) => {
                    data.insert(key, value);
                }
                None => {
                    data.remove(&key);
                }
            }
        }
        Ok(out)
    }
}
