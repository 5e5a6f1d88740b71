//! The ordered key/value abstraction everything else in this crate is
//! built on: a minimal trait the persistence engine needs, plus an
//! in-memory implementation for tests and embedding.

use crate::error::Result;

/// A handle onto an ordered byte-keyed store, opened for one unit of
/// work. Implementations are free to buffer writes and apply them
/// atomically on commit, or to write through immediately; callers only
/// rely on read-your-writes within the handle's lifetime.
pub trait KvStore: Send + Sync {
    /// Point lookup.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Insert or overwrite.
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Remove, if present. Removing an absent key is not an error.
    fn delete(&mut self, key: &[u8]) -> Result<()>;

    /// Iterate `[lo, hi)` in key order (or reverse key order when
    /// `reverse` is set), the building block every prefix scan in this
    /// crate (object deletion, index range queries, catalog
    /// enumeration) is expressed in terms of.
    fn scan_range<'a>(
        &'a self,
        lo: &[u8],
        hi: &[u8],
        reverse: bool,
    ) -> Result<Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> + 'a>>;

    /// Convenience wrapper over [`KvStore::scan_range`] for a single
    /// key prefix.
    fn scan_prefix<'a>(&'a self, prefix: &[u8]) -> Result<Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> + 'a>> {
        let hi = crate::codec::key_after_prefix(prefix);
        self.scan_range(prefix, &hi, false)
    }
}

/// Opens [`KvStore`] handles. A transactional backend commits or rolls
/// back whatever the handle buffered; [`mem::MemKv`] writes through
/// immediately and has no rollback.
pub trait KvDatabase: Send + Sync {
    /// Concrete handle type this database opens.
    type Handle: KvStore;

    /// Open a fresh handle.
    fn begin(&self) -> Self::Handle;
}

/// A simple in-memory [`KvStore`], grounded in the same
/// shared-map-behind-a-lock shape used for the catalog's decode cache
/// (dashmap) but ordered, so it also doubles as the reference backend
/// for property tests and doctests that don't need real persistence.
pub mod mem {
    use std::collections::BTreeMap;
    use std::ops::Bound;
    use std::sync::Arc;

    use parking_lot::RwLock;

    use super::{KvDatabase, KvStore};
    use crate::error::Result;

    #[derive(Clone, Default)]
    struct Inner {
        map: BTreeMap<Vec<u8>, Vec<u8>>,
    }

    /// An in-memory, process-local key/value store.
    #[derive(Clone, Default)]
    pub struct MemKv {
        inner: Arc<RwLock<Inner>>,
    }

    impl MemKv {
        /// A fresh, empty store.
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl KvDatabase for MemKv {
        type Handle = MemKvHandle;

        fn begin(&self) -> MemKvHandle {
            MemKvHandle { inner: self.inner.clone() }
        }
    }

    /// A handle onto a [`MemKv`] store. Writes apply immediately;
    /// there is no buffering or rollback, matching the snapshot
    /// transaction's "never commits" semantics elsewhere in this
    /// crate rather than a real ACID backend.
    pub struct MemKvHandle {
        inner: Arc<RwLock<Inner>>,
    }

    impl KvStore for MemKvHandle {
        fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
            Ok(self.inner.read().map.get(key).cloned())
        }

        fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
            self.inner.write().map.insert(key.to_vec(), value.to_vec());
            Ok(())
        }

        fn delete(&mut self, key: &[u8]) -> Result<()> {
            self.inner.write().map.remove(key);
            Ok(())
        }

        fn scan_range<'a>(
            &'a self,
            lo: &[u8],
            hi: &[u8],
            reverse: bool,
        ) -> Result<Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> + 'a>> {
            let guard = self.inner.read();
            let mut entries: Vec<(Vec<u8>, Vec<u8>)> = guard
                .map
                .range::<[u8], _>((Bound::Included(lo), Bound::Excluded(hi)))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            if reverse {
                entries.reverse();
            }
            Ok(Box::new(entries.into_iter().map(Ok)))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn put_then_get() {
            let db = MemKv::new();
            let mut txn = db.begin();
            txn.put(b"a", b"1").unwrap();
            assert_eq!(txn.get(b"a").unwrap(), Some(b"1".to_vec()));
        }

        #[test]
        fn delete_removes() {
            let db = MemKv::new();
            let mut txn = db.begin();
            txn.put(b"a", b"1").unwrap();
            txn.delete(b"a").unwrap();
            assert_eq!(txn.get(b"a").unwrap(), None);
        }

        #[test]
        fn scan_range_is_ordered_and_bounded() {
            let db = MemKv::new();
            let mut txn = db.begin();
            for k in [b"a", b"b", b"c", b"d"] {
                txn.put(k, b"x").unwrap();
            }
            let keys: Vec<Vec<u8>> = txn
                .scan_range(b"b", b"d", false)
                .unwrap()
                .map(|r| r.unwrap().0)
                .collect();
            assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);
        }

        #[test]
        fn scan_range_reverse() {
            let db = MemKv::new();
            let mut txn = db.begin();
            for k in [b"a", b"b", b"c"] {
                txn.put(k, b"x").unwrap();
            }
            let keys: Vec<Vec<u8>> = txn
                .scan_range(b"a", b"z", true)
                .unwrap()
                .map(|r| r.unwrap().0)
                .collect();
            assert_eq!(keys, vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
        }

        #[test]
        fn two_handles_share_one_store() {
            let db = MemKv::new();
            let mut w = db.begin();
            w.put(b"a", b"1").unwrap();
            let r = db.begin();
            assert_eq!(r.get(b"a").unwrap(), Some(b"1".to_vec()));
        }
    }
}
