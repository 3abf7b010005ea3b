//! The fast-path index: unsaved key additions/removals accumulated by the
//! working tree, plus the upgrade procedure that (re)builds the persisted
//! fast-path table from a full tree traversal (spec.md §4.7).

use crate::config::TreeOptions;
use merkle_kv_store::{FastNode, NodeStore};
use merkle_kv_types::{StoreError, Version};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Unsaved fast-path deltas for the current edit. `additions` and
/// `removals` are mutually exclusive per key by construction: recording an
/// addition for a key clears any pending removal, and vice versa.
#[derive(Debug, Default)]
pub struct FastPathDeltas {
    additions: BTreeMap<Vec<u8>, FastNode>,
    removals: BTreeSet<Vec<u8>>,
}

impl FastPathDeltas {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `key` now resolves to `value` as of `version`.
    pub fn record_addition(&mut self, key: Vec<u8>, value: Vec<u8>, version: Version) {
        self.removals.remove(&key);
        self.additions
            .insert(key.clone(), FastNode::new(key, value, version));
    }

    /// Records that `key` no longer resolves to anything.
    pub fn record_removal(&mut self, key: Vec<u8>) {
        self.additions.remove(&key);
        self.removals.insert(key);
    }

    /// An unsaved addition for `key`, if any.
    pub fn addition(&self, key: &[u8]) -> Option<&FastNode> {
        self.additions.get(key)
    }

    /// `true` iff `key` has an unsaved removal pending.
    pub fn is_removed(&self, key: &[u8]) -> bool {
        self.removals.contains(key)
    }

    /// Unsaved additions in ascending key order.
    pub fn additions_sorted(&self) -> impl Iterator<Item = &FastNode> {
        self.additions.values()
    }

    /// Unsaved removals in ascending key order.
    pub fn removals_sorted(&self) -> impl Iterator<Item = &[u8]> {
        self.removals.iter().map(|k| k.as_slice())
    }

    /// The raw unsaved-additions map, for merging against a persisted
    /// fast-path stream (see [`crate::iter::FastPathMerge`]).
    pub fn additions_map(&self) -> &BTreeMap<Vec<u8>, FastNode> {
        &self.additions
    }

    /// The raw unsaved-removals set, for the same merge.
    pub fn removals_set(&self) -> &BTreeSet<Vec<u8>> {
        &self.removals
    }

    /// Discards all unsaved deltas — called after a successful
    /// `save_version` or a `rollback`.
    pub fn clear(&mut self) {
        self.additions.clear();
        self.removals.clear();
    }
}

/// Samples resident memory every `sample_interval` on a dedicated thread and
/// latches a reclamation request once per excursion above `threshold_bytes`.
/// The request is picked up by [`run_upgrade`] on the calling thread (a
/// `NodeStore`'s caches are not necessarily `Send + Sync`-free to poke from
/// another thread, so the watchdog only signals; it never calls
/// `release_caches` itself). The thread terminates as soon as `stop` is
/// called, which joins it deterministically (spec.md §4.7, §5, §9).
struct MemoryWatchdog {
    stop: Arc<AtomicBool>,
    reclaim_requested: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MemoryWatchdog {
    fn spawn(threshold_bytes: u64, sample_interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let reclaim_requested = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let reclaim_flag = Arc::clone(&reclaim_requested);
        let handle = std::thread::spawn(move || {
            let mut system = sysinfo::System::new();
            let pid = sysinfo::get_current_pid().ok();
            let mut was_above = false;
            while !stop_flag.load(Ordering::Relaxed) {
                if let Some(pid) = pid {
                    system.refresh_process(pid);
                    if let Some(process) = system.process(pid) {
                        // sysinfo reports process memory in KiB on this release.
                        let resident_bytes = process.memory().saturating_mul(1024);
                        let above = resident_bytes > threshold_bytes;
                        if above && !was_above {
                            reclaim_flag.store(true, Ordering::Relaxed);
                        }
                        was_above = above;
                    }
                }
                std::thread::sleep(sample_interval);
            }
        });
        Self {
            stop,
            reclaim_requested,
            handle: Some(handle),
        }
    }

    /// `true` iff the watchdog has observed resident memory exceed the
    /// threshold since the last call; clears the latch either way.
    fn take_reclaim_request(&self) -> bool {
        self.reclaim_requested.swap(false, Ordering::Relaxed)
    }

    fn join(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("fast-path upgrade memory watchdog thread panicked");
            }
        }
    }
}

/// Runs a fast-path upgrade: if the store requests a forced re-upgrade,
/// every persisted fast-path entry is dropped first; `leaves` (every live
/// leaf at `version`, in ascending key order) is then written as the new
/// fast-path table, and the storage-version marker is set. On any failure
/// the marker is reset to "not upgraded" so the next `load` retries.
pub fn upgrade<I>(
    store: &dyn NodeStore,
    version: Version,
    leaves: I,
    options: &TreeOptions,
) -> Result<(), StoreError>
where
    I: IntoIterator<Item = (Vec<u8>, Vec<u8>)>,
{
    let forced = store.should_force_fast_storage_upgrade()?;
    let watchdog = MemoryWatchdog::spawn(
        options.watchdog_threshold_bytes,
        options.watchdog_sample_interval,
    );

    let result = run_upgrade(store, version, leaves, forced, &watchdog);
    watchdog.join();

    if result.is_err() {
        let mut reset_batch = store.begin_batch();
        reset_batch.set_fast_storage_upgraded(false);
        if let Err(e) = reset_batch.commit() {
            tracing::warn!(error = %e, "failed to reset fast-path marker after a failed upgrade");
        }
    }
    result
}

fn run_upgrade<I>(
    store: &dyn NodeStore,
    version: Version,
    leaves: I,
    forced: bool,
    watchdog: &MemoryWatchdog,
) -> Result<(), StoreError>
where
    I: IntoIterator<Item = (Vec<u8>, Vec<u8>)>,
{
    let mut batch = store.begin_batch();
    if forced {
        batch.clear_fast_nodes();
    }
    for (key, value) in leaves {
        if watchdog.take_reclaim_request() {
            tracing::warn!(
                "fast-path upgrade exceeded the memory watchdog threshold; releasing node store caches"
            );
            store.release_caches();
        }
        batch.put_fast_node(&FastNode::new(key, value, version));
    }
    batch.set_fast_storage_upgraded(true);
    batch.commit()
}

/// `true` iff an upgrade is required: never upgraded before, or the store
/// raises a forced-re-upgrade flag.
pub fn needs_upgrade(store: &dyn NodeStore) -> Result<bool, StoreError> {
    Ok(!store.has_upgraded_to_fast_storage()? || store.should_force_fast_storage_upgrade()?)
}
