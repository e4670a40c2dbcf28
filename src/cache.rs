use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

/// Blocks and full nodes both hang off the capture file as size-bounded LRU
/// maps. Entries never need invalidation: the file is append-only, so a
/// persisted compressed block (and any full node inside one) can never
/// change. The live compression buffer is the one mutable block, and it is
/// never inserted here.
#[derive(Debug)]
pub(crate) struct LruMap<K: Hash + Eq, V> {
    inner: Mutex<LruCache<K, Arc<V>>>,
}

impl<K: Hash + Eq + Copy, V> LruMap<K, V> {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self { inner: Mutex::new(LruCache::new(capacity)) }
    }

    /// Returns the cached value for `key`, loading and inserting it with
    /// `load` on a miss.
    pub(crate) fn get_or_try_insert<E>(
        &self,
        key: K,
        load: impl FnOnce() -> Result<V, E>,
    ) -> Result<Arc<V>, E> {
        let mut inner = self.inner.lock();
        if let Some(value) = inner.get(&key) {
            return Ok(Arc::clone(value));
        }
        let value = Arc::new(load()?);
        inner.put(key, Arc::clone(&value));
        Ok(value)
    }
}
