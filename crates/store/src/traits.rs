use crate::fast_node::FastNode;
use crate::root_entry::RootEntry;
use merkle_kv_types::{StoreError, Version};
use std::collections::BTreeMap;

/// The content hash of a persisted node.
pub type NodeHash = [u8; 32];

/// The physical key-value backend: an opaque ordered byte store with atomic
/// batch commit. This is the external collaborator of spec.md §6 — its own
/// on-disk layout and encoding are not part of this crate's contract, only
/// the operations the tree layer needs from it.
///
/// Implementations must be safe to share across concurrently-reading
/// immutable trees; mutation only ever happens through a single
/// [`NodeBatch`] committed at a time (enforced by the single-writer
/// `MutableTree`, not by this trait).
pub trait NodeStore: Send + Sync {
    /// Fetches the raw, previously-persisted bytes of a node by its hash.
    fn get_node(&self, hash: &NodeHash) -> Result<Option<Vec<u8>>, StoreError>;

    /// Looks up the root recorded for `version`. `Ok(None)` means the store
    /// has no record of `version` at all.
    fn get_root(&self, version: Version) -> Result<Option<RootEntry>, StoreError>;

    /// Returns every version the store has a root for. Backends are free to
    /// make this expensive; callers should prefer `has_root`/`get_root` for
    /// single lookups.
    fn get_roots(&self) -> Result<BTreeMap<Version, RootEntry>, StoreError>;

    /// `true` iff `get_root(version)` would return `Ok(Some(_))`.
    fn has_root(&self, version: Version) -> Result<bool, StoreError> {
        Ok(self.get_root(version)?.is_some())
    }

    /// The greatest version the store has ever committed a root for, if any.
    fn get_latest_version(&self) -> Result<Option<Version>, StoreError>;

    /// Looks up the fast-path entry for `key`, if the store has one.
    fn get_fast_node(&self, key: &[u8]) -> Result<Option<FastNode>, StoreError>;

    /// Iterates every persisted fast-path entry in ascending key order.
    fn iter_fast_nodes(
        &self,
    ) -> Result<Box<dyn Iterator<Item = Result<FastNode, StoreError>> + '_>, StoreError>;

    /// `true` once a fast-path upgrade has completed and left its marker set.
    fn has_upgraded_to_fast_storage(&self) -> Result<bool, StoreError>;

    /// `true` if the store wants a forced re-upgrade (e.g. because a prior
    /// downgrade may have left stale fast-path entries behind).
    fn should_force_fast_storage_upgrade(&self) -> Result<bool, StoreError>;

    /// Opens a new batch of writes. Nothing is visible to readers until the
    /// batch is committed.
    fn begin_batch(&self) -> Box<dyn NodeBatch + '_>;

    /// Drops any in-memory caches this store is holding, in response to a
    /// memory-reclamation request (spec.md §9's "release caches" callback:
    /// Rust has no forced-GC primitive for the fast-path upgrade's memory
    /// watchdog to invoke instead). A plain `NodeStore` has nothing to
    /// release and no-ops; decorators like `CachedNodeStore` override this.
    fn release_caches(&self) {}
}

/// A single atomic unit of writes against a [`NodeStore`]. Mirrors spec.md
/// §6's `saveBranch`/`saveRoot`/`saveOrphans`/`saveFastNode`/`commit` set.
pub trait NodeBatch {
    /// Persists the canonical bytes of a node under its hash. Idempotent:
    /// writing the same hash twice with the same bytes is a no-op in effect.
    fn put_node(&mut self, hash: NodeHash, bytes: Vec<u8>);

    /// Records the root for `version`.
    fn put_root(&mut self, version: Version, root: RootEntry);

    /// Records the orphan set produced by reaching `version`: every node
    /// hash this batch's save shadowed, keyed to the version at which that
    /// node was originally created.
    fn put_orphans(&mut self, version: Version, orphans: &BTreeMap<NodeHash, Version>);

    /// Upserts a fast-path entry.
    fn put_fast_node(&mut self, node: &FastNode);

    /// Removes a fast-path entry.
    fn delete_fast_node(&mut self, key: &[u8]);

    /// Deletes every persisted fast-path entry (used by a forced upgrade).
    fn clear_fast_nodes(&mut self);

    /// Sets the fast-storage-version marker: `true` once an upgrade has
    /// fully completed, `false` to mark the upgrade as not-yet-attempted
    /// (or retried after a failed attempt).
    fn set_fast_storage_upgraded(&mut self, upgraded: bool);

    /// Deletes a single version's root and orphan-set records. Implementors
    /// may defer actual node garbage collection to a pruning policy; only
    /// the version's *visibility* must change atomically with this batch.
    fn delete_version(&mut self, version: Version);

    /// Deletes every version in the half-open range `[from, to)`.
    fn delete_versions_range(&mut self, from: Version, to: Version);

    /// Deletes every version strictly greater than `from` (inclusive cursor
    /// reset used by `LoadVersionForOverwriting`).
    fn delete_versions_from(&mut self, from: Version);

    /// Resets the store's cached "latest version" cursor.
    fn reset_latest_version(&mut self, version: Version);

    /// Flushes every queued write atomically. After this returns `Ok`, all
    /// writes in this batch are visible to subsequent reads.
    fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
