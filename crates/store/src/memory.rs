//! An in-memory, ordered node store. Used by the test suite and by
//! callers that want to embed a working tree without touching disk.

use crate::fast_node::FastNode;
use crate::root_entry::RootEntry;
use crate::traits::{NodeBatch, NodeHash, NodeStore};
use merkle_kv_types::{StoreError, Version};
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    nodes: BTreeMap<NodeHash, Vec<u8>>,
    roots: BTreeMap<Version, RootEntry>,
    orphans: BTreeMap<Version, BTreeMap<NodeHash, Version>>,
    fast_nodes: BTreeMap<Vec<u8>, FastNode>,
    upgraded: bool,
    force_upgrade: bool,
    latest_version: Option<Version>,
}

/// A `BTreeMap`-backed [`NodeStore`]. All writes go through a single mutex
/// guarding a full copy-on-swap of the relevant maps, so `commit` is
/// trivially atomic: either every queued write lands, or (on panic inside a
/// batch's own bookkeeping) none do, because nothing touches `Inner` until
/// `commit`.
#[derive(Default)]
pub struct MemoryNodeStore {
    inner: Mutex<Inner>,
}

impl MemoryNodeStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks that the next fast-path upgrade must be a forced one (every
    /// persisted fast entry deleted before repopulating). Test/ops hook;
    /// mirrors a backend-level "prior downgrade" signal.
    pub fn request_forced_upgrade(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.force_upgrade = true;
        }
    }
}

impl NodeStore for MemoryNodeStore {
    fn get_node(&self, hash: &NodeHash) -> Result<Option<Vec<u8>>, StoreError> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| StoreError::Backend("poisoned lock".into()))?;
        Ok(inner.nodes.get(hash).cloned())
    }

    fn get_root(&self, version: Version) -> Result<Option<RootEntry>, StoreError> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| StoreError::Backend("poisoned lock".into()))?;
        Ok(inner.roots.get(&version).copied())
    }

    fn get_roots(&self) -> Result<BTreeMap<Version, RootEntry>, StoreError> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| StoreError::Backend("poisoned lock".into()))?;
        Ok(inner.roots.clone())
    }

    fn get_latest_version(&self) -> Result<Option<Version>, StoreError> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| StoreError::Backend("poisoned lock".into()))?;
        Ok(inner.latest_version)
    }

    fn get_fast_node(&self, key: &[u8]) -> Result<Option<FastNode>, StoreError> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| StoreError::Backend("poisoned lock".into()))?;
        Ok(inner.fast_nodes.get(key).cloned())
    }

    fn iter_fast_nodes(
        &self,
    ) -> Result<Box<dyn Iterator<Item = Result<FastNode, StoreError>> + '_>, StoreError> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| StoreError::Backend("poisoned lock".into()))?;
        let snapshot: Vec<FastNode> = inner.fast_nodes.values().cloned().collect();
        Ok(Box::new(snapshot.into_iter().map(Ok)))
    }

    fn has_upgraded_to_fast_storage(&self) -> Result<bool, StoreError> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| StoreError::Backend("poisoned lock".into()))?;
        Ok(inner.upgraded)
    }

    fn should_force_fast_storage_upgrade(&self) -> Result<bool, StoreError> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| StoreError::Backend("poisoned lock".into()))?;
        Ok(inner.force_upgrade)
    }

    fn begin_batch(&self) -> Box<dyn NodeBatch + '_> {
        Box::new(MemoryBatch {
            store: self,
            new_nodes: BTreeMap::new(),
            new_roots: BTreeMap::new(),
            new_orphans: BTreeMap::new(),
            fast_upserts: BTreeMap::new(),
            fast_deletes: Vec::new(),
            clear_fast: false,
            set_upgraded: None,
            deleted_versions: Vec::new(),
            deleted_ranges: Vec::new(),
            deleted_from: None,
            reset_latest: None,
        })
    }
}

struct MemoryBatch<'a> {
    store: &'a MemoryNodeStore,
    new_nodes: BTreeMap<NodeHash, Vec<u8>>,
    new_roots: BTreeMap<Version, RootEntry>,
    new_orphans: BTreeMap<Version, BTreeMap<NodeHash, Version>>,
    fast_upserts: BTreeMap<Vec<u8>, FastNode>,
    fast_deletes: Vec<Vec<u8>>,
    clear_fast: bool,
    set_upgraded: Option<bool>,
    deleted_versions: Vec<Version>,
    deleted_ranges: Vec<(Version, Version)>,
    deleted_from: Option<Version>,
    reset_latest: Option<Version>,
}

impl NodeBatch for MemoryBatch<'_> {
    fn put_node(&mut self, hash: NodeHash, bytes: Vec<u8>) {
        self.new_nodes.insert(hash, bytes);
    }

    fn put_root(&mut self, version: Version, root: RootEntry) {
        self.new_roots.insert(version, root);
        self.reset_latest = Some(self.reset_latest.map_or(version, |v| v.max(version)));
    }

    fn put_orphans(&mut self, version: Version, orphans: &BTreeMap<NodeHash, Version>) {
        self.new_orphans
            .entry(version)
            .or_default()
            .extend(orphans.iter().map(|(h, v)| (*h, *v)));
    }

    fn put_fast_node(&mut self, node: &FastNode) {
        self.fast_upserts.insert(node.key.clone(), node.clone());
    }

    fn delete_fast_node(&mut self, key: &[u8]) {
        self.fast_deletes.push(key.to_vec());
    }

    fn clear_fast_nodes(&mut self) {
        self.clear_fast = true;
    }

    fn set_fast_storage_upgraded(&mut self, upgraded: bool) {
        self.set_upgraded = Some(upgraded);
    }

    fn delete_version(&mut self, version: Version) {
        self.deleted_versions.push(version);
    }

    fn delete_versions_range(&mut self, from: Version, to: Version) {
        self.deleted_ranges.push((from, to));
    }

    fn delete_versions_from(&mut self, from: Version) {
        self.deleted_from = Some(from);
    }

    fn reset_latest_version(&mut self, version: Version) {
        self.reset_latest = Some(version);
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut inner = self
            .store
            .inner
            .lock()
            .map_err(|_| StoreError::Backend("poisoned lock".into()))?;

        inner.nodes.extend(self.new_nodes);

        for (version, orphans) in self.new_orphans {
            inner.orphans.entry(version).or_default().extend(orphans);
        }

        for version in self.deleted_versions {
            inner.roots.remove(&version);
            inner.orphans.remove(&version);
        }
        for &(from, to) in &self.deleted_ranges {
            inner.roots.retain(|v, _| !(*v >= from && *v < to));
            inner.orphans.retain(|v, _| !(*v >= from && *v < to));
        }
        if let Some(from) = self.deleted_from {
            inner.roots.retain(|v, _| *v <= from);
            inner.orphans.retain(|v, _| *v <= from);
        }

        inner.roots.extend(self.new_roots);

        if self.clear_fast {
            inner.fast_nodes.clear();
            inner.force_upgrade = false;
        }
        for key in self.fast_deletes {
            inner.fast_nodes.remove(&key);
        }
        for (key, node) in self.fast_upserts {
            inner.fast_nodes.insert(key, node);
        }
        if let Some(upgraded) = self.set_upgraded {
            inner.upgraded = upgraded;
        }
        if let Some(v) = self.reset_latest {
            inner.latest_version = Some(inner.latest_version.map_or(v, |cur| cur.max(v)));
        }
        if self.deleted_from.is_some() || !self.deleted_ranges.is_empty() {
            inner.latest_version = inner.roots.keys().next_back().copied();
        }

        Ok(())
    }
}
