//! The version registry: an in-memory `version -> known-present` map, the
//! source of truth for `VersionExists`/`AvailableVersions`/deletion
//! bookkeeping. Lazily hydrated from the backend on a miss.
//!
//! A single mutex guards the map; it is never held across store I/O (the
//! backend call in `exists` happens before the map is touched again).

use merkle_kv_store::NodeStore;
use merkle_kv_types::{StoreError, Version};
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct VersionRegistry {
    known: Mutex<BTreeMap<Version, bool>>,
}

impl VersionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the registry with every root the store currently knows
    /// about. Call this during a non-lazy `load`; afterwards
    /// `available_versions` is guaranteed complete.
    pub fn hydrate_all(&self, store: &dyn NodeStore) -> Result<(), StoreError> {
        let roots = store.get_roots()?;
        let mut known = self.lock();
        known.clear();
        for version in roots.keys() {
            known.insert(*version, true);
        }
        Ok(())
    }

    /// Records `version`'s presence directly, without consulting the store.
    pub fn mark_present(&self, version: Version, present: bool) {
        self.lock().insert(version, present);
    }

    /// Drops `version` from the registry (does not touch the backend).
    pub fn forget(&self, version: Version) {
        self.lock().remove(&version);
    }

    /// Drops every version `>= from` from the registry.
    pub fn forget_from(&self, from: Version) {
        self.lock().retain(|v, _| *v < from);
    }

    /// Drops every version in the half-open range `[from, to)`.
    pub fn forget_range(&self, from: Version, to: Version) {
        self.lock().retain(|v, _| !(*v >= from && *v < to));
    }

    /// `true` iff `version` is known to exist. Consults the backend and
    /// caches the result on a registry miss — lazy hydration.
    pub fn exists(&self, store: &dyn NodeStore, version: Version) -> Result<bool, StoreError> {
        if let Some(present) = self.lock().get(&version).copied() {
            return Ok(present);
        }
        let present = store.has_root(version)?;
        self.mark_present(version, present);
        Ok(present)
    }

    /// The registry's currently hydrated, present versions. Complete only
    /// after a non-lazy `load`; under lazy loading this may omit versions
    /// nothing has queried yet (spec.md §9, open question (a)).
    pub fn available_versions(&self) -> Vec<Version> {
        self.lock()
            .iter()
            .filter(|(_, present)| **present)
            .map(|(v, _)| *v)
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<Version, bool>> {
        self.known.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use merkle_kv_store::{MemoryNodeStore, NodeStore, RootEntry};

    #[test]
    fn lazy_exists_hydrates_on_miss_and_caches() {
        let store = MemoryNodeStore::new();
        let mut batch = store.begin_batch();
        batch.put_root(1, RootEntry::Empty);
        batch.commit().unwrap();

        let registry = VersionRegistry::new();
        assert!(registry.exists(&store, 1).unwrap());
        assert!(!registry.exists(&store, 2).unwrap());
        // Cached now; available_versions reflects the lazily-learned entry.
        assert_eq!(registry.available_versions(), vec![1]);
    }

    #[test]
    fn hydrate_all_populates_every_known_root() {
        let store = MemoryNodeStore::new();
        let mut batch = store.begin_batch();
        batch.put_root(1, RootEntry::Empty);
        batch.put_root(2, RootEntry::Empty);
        batch.commit().unwrap();

        let registry = VersionRegistry::new();
        registry.hydrate_all(&store).unwrap();
        assert_eq!(registry.available_versions(), vec![1, 2]);
    }
}
