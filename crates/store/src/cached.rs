//! An LRU decorator over any [`NodeStore`], satisfying the `cacheSize`
//! configured option from spec.md §6 ("LRU capacity for the node cache in
//! the store").

use crate::fast_node::FastNode;
use crate::root_entry::RootEntry;
use crate::traits::{NodeBatch, NodeHash, NodeStore};
use lru::LruCache;
use merkle_kv_types::{StoreError, Version};
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;

/// Wraps a backend [`NodeStore`] with an LRU cache of decoded node bytes.
/// Persisted nodes are immutable once written, so cached entries never go
/// stale; only capacity eviction removes them.
pub struct CachedNodeStore<S: NodeStore> {
    inner: S,
    cache: Mutex<LruCache<NodeHash, Vec<u8>>>,
}

impl<S: NodeStore> CachedNodeStore<S> {
    /// Wraps `inner`, caching up to `cache_size` decoded node entries.
    pub fn new(inner: S, cache_size: NonZeroUsize) -> Self {
        Self {
            inner,
            cache: Mutex::new(LruCache::new(cache_size)),
        }
    }
}

impl<S: NodeStore> NodeStore for CachedNodeStore<S> {
    fn get_node(&self, hash: &NodeHash) -> Result<Option<Vec<u8>>, StoreError> {
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(bytes) = cache.get(hash) {
                return Ok(Some(bytes.clone()));
            }
        }
        let result = self.inner.get_node(hash)?;
        if let Some(bytes) = &result {
            if let Ok(mut cache) = self.cache.lock() {
                cache.put(*hash, bytes.clone());
            }
        }
        Ok(result)
    }

    fn get_root(&self, version: Version) -> Result<Option<RootEntry>, StoreError> {
        self.inner.get_root(version)
    }

    fn get_roots(&self) -> Result<BTreeMap<Version, RootEntry>, StoreError> {
        self.inner.get_roots()
    }

    fn get_latest_version(&self) -> Result<Option<Version>, StoreError> {
        self.inner.get_latest_version()
    }

    fn get_fast_node(&self, key: &[u8]) -> Result<Option<FastNode>, StoreError> {
        self.inner.get_fast_node(key)
    }

    fn iter_fast_nodes(
        &self,
    ) -> Result<Box<dyn Iterator<Item = Result<FastNode, StoreError>> + '_>, StoreError> {
        self.inner.iter_fast_nodes()
    }

    fn has_upgraded_to_fast_storage(&self) -> Result<bool, StoreError> {
        self.inner.has_upgraded_to_fast_storage()
    }

    fn should_force_fast_storage_upgrade(&self) -> Result<bool, StoreError> {
        self.inner.should_force_fast_storage_upgrade()
    }

    fn begin_batch(&self) -> Box<dyn NodeBatch + '_> {
        // New nodes land in the backend store directly; the cache is warmed
        // lazily on next read rather than on write, keeping batch commit
        // free of cache bookkeeping.
        self.inner.begin_batch()
    }

    fn release_caches(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
        self.inner.release_caches();
    }
}
