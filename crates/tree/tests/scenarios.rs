//! End-to-end scenarios spanning save/load/delete-version/fast-path
//! boundaries. Per-mutation algorithm properties (balance, ordering,
//! rotation correctness) live in `mutable`'s own unit tests; this file
//! exercises the tree the way a caller driving a replicated state machine
//! would.

use merkle_kv_store::MemoryNodeStore;
use merkle_kv_tree::{MutableTree, TreeOptions};
use merkle_kv_types::StoreError;

fn tree() -> MutableTree<MemoryNodeStore> {
    MutableTree::new(MemoryNodeStore::new(), TreeOptions::default()).unwrap()
}

/// E1: empty tree -> three inserts -> save -> version 1, point lookups work,
/// the right leaf/height shape.
#[test]
fn e1_first_save_produces_expected_shape() {
    let t = tree();
    t.set(b"a", Some(b"1")).unwrap();
    t.set(b"b", Some(b"2")).unwrap();
    t.set(b"c", Some(b"3")).unwrap();
    let version = t.save_version().unwrap();
    assert_eq!(version, 1);
    assert_eq!(t.get(b"b").unwrap(), Some(b"2".to_vec()));

    let view = t.immutable();
    assert_eq!(view.size().unwrap(), 3);
    assert_eq!(view.height().unwrap(), Some(2));
}

/// E2: an unsaved edit diverges `working_hash()` from `hash()`; rolling
/// back reunites them.
#[test]
fn e2_working_hash_diverges_until_rollback() {
    let t = tree();
    t.set(b"a", Some(b"1")).unwrap();
    t.set(b"b", Some(b"2")).unwrap();
    t.set(b"c", Some(b"3")).unwrap();
    t.save_version().unwrap();

    let saved_hash = t.hash().unwrap();
    assert_eq!(t.working_hash().unwrap(), saved_hash);

    t.set(b"b", Some(b"20")).unwrap();
    assert_ne!(t.working_hash().unwrap(), saved_hash);

    t.rollback();
    assert_eq!(t.working_hash().unwrap(), saved_hash);
    assert_eq!(t.get(b"b").unwrap(), Some(b"2".to_vec()));
}

/// E3: removing a key after a save produces a new version; the old
/// version still answers the old value, the new one doesn't.
#[test]
fn e3_remove_is_visible_only_from_its_version_onward() {
    let t = tree();
    t.set(b"a", Some(b"1")).unwrap();
    t.set(b"b", Some(b"2")).unwrap();
    t.set(b"c", Some(b"3")).unwrap();
    let v1 = t.save_version().unwrap();

    t.remove(b"a").unwrap();
    let v2 = t.save_version().unwrap();
    assert_eq!(v2, v1 + 1);

    assert_eq!(t.get_versioned(b"a", v1).unwrap(), Some(b"1".to_vec()));
    assert_eq!(t.get_versioned(b"a", v2).unwrap(), None);
}

/// E4: the tree hash is independent of insertion order.
#[test]
fn e4_hash_independent_of_insertion_order() {
    let keys: Vec<Vec<u8>> = (0u32..1000).map(|k| k.to_string().into_bytes()).collect();

    let forward = tree();
    for k in &keys {
        forward.set(k, Some(k)).unwrap();
    }
    let v1 = forward.save_version().unwrap();

    let backward = tree();
    for k in keys.iter().rev() {
        backward.set(k, Some(k)).unwrap();
    }
    let v2 = backward.save_version().unwrap();

    assert_eq!(
        forward.get_immutable(v1).unwrap().hash().unwrap(),
        backward.get_immutable(v2).unwrap().hash().unwrap()
    );
}

/// E5: deleting a half-open range removes exactly those versions; the
/// latest saved version can never be deleted, alone or via a range.
#[test]
fn e5_delete_versions_range_is_half_open_and_protects_latest() {
    let t = tree();
    t.set(b"a", Some(b"1")).unwrap();
    t.save_version().unwrap(); // v1
    t.set(b"a", Some(b"2")).unwrap();
    t.save_version().unwrap(); // v2
    t.set(b"a", Some(b"3")).unwrap();
    let v3 = t.save_version().unwrap();

    t.delete_versions_range(1, 3).unwrap();
    assert!(!t.has_version(1).unwrap());
    assert!(!t.has_version(2).unwrap());
    assert!(t.has_version(v3).unwrap());

    assert!(matches!(
        t.delete_version(v3),
        Err(StoreError::ProtectedVersion(_))
    ));
}

/// E6: overwriting from a past version discards everything after it;
/// the next save reuses the vacated version number and may diverge from
/// what used to live there.
#[test]
fn e6_load_for_overwriting_discards_future_versions() {
    let t = tree();
    t.set(b"a", Some(b"1")).unwrap();
    let v = t.save_version().unwrap();
    t.set(b"a", Some(b"2")).unwrap();
    let discarded_v_plus_1 = t.save_version().unwrap();
    t.set(b"a", Some(b"3")).unwrap();
    t.save_version().unwrap();

    t.load_version_for_overwriting(v).unwrap();
    assert!(!t.has_version(discarded_v_plus_1).unwrap());
    assert_eq!(t.version(), v);
    assert_eq!(t.get(b"a").unwrap(), Some(b"1".to_vec()));

    t.set(b"a", Some(b"99")).unwrap();
    let replayed = t.save_version().unwrap();
    assert_eq!(replayed, discarded_v_plus_1);
    assert_ne!(
        t.get_immutable(replayed).unwrap().hash().unwrap(),
        // the discarded version's hash is gone from the store entirely,
        // so the only meaningful check left is that the new content won.
        t.get_immutable(v).unwrap().hash().unwrap()
    );
    assert_eq!(t.get(b"a").unwrap(), Some(b"99".to_vec()));
}

/// Invariant 6: after a save, the fast path and an in-order tree descent
/// agree on every key's value once the upgrade has run.
#[test]
fn fast_path_agrees_with_tree_descent_after_save() {
    let t = tree();
    for k in 0u32..64 {
        t.set(&k.to_be_bytes(), Some(&(k * 2).to_be_bytes())).unwrap();
    }
    let version = t.save_version().unwrap();

    let view = t.get_immutable(version).unwrap();
    let from_tree = view.iter_in_order().unwrap();

    for (k, v) in &from_tree {
        assert_eq!(t.get(k).unwrap().as_ref(), Some(v));
    }
    assert_eq!(from_tree.len(), 64);
}

/// `iter()` merges the persisted fast-path table with unsaved additions
/// and removals, in ascending key order (spec.md §4.5).
#[test]
fn working_iter_merges_persisted_entries_with_unsaved_deltas() {
    let t = tree();
    t.set(b"a", Some(b"1")).unwrap();
    t.set(b"c", Some(b"3")).unwrap();
    t.save_version().unwrap();

    t.set(b"b", Some(b"2")).unwrap(); // unsaved addition
    t.remove(b"a").unwrap(); // unsaved removal
    t.set(b"c", Some(b"30")).unwrap(); // unsaved addition shadowing a persisted entry

    let entries = t.iter().unwrap();
    assert_eq!(
        entries,
        vec![(b"b".to_vec(), b"2".to_vec()), (b"c".to_vec(), b"30".to_vec())]
    );
}

/// Fast-path coherence also holds across an edit that never explicitly
/// forces a second upgrade: new keys land through the unsaved-delta path
/// until saved, at which point they are folded into the persisted table.
#[test]
fn fast_path_reflects_post_upgrade_edits_once_saved() {
    let t = tree();
    t.set(b"a", Some(b"1")).unwrap();
    t.save_version().unwrap();

    t.set(b"b", Some(b"2")).unwrap();
    assert_eq!(t.get(b"b").unwrap(), Some(b"2".to_vec()));
    t.remove(b"a").unwrap();
    assert_eq!(t.get(b"a").unwrap(), None);

    let version = t.save_version().unwrap();
    let view = t.get_immutable(version).unwrap();
    let entries = view.iter_in_order().unwrap();
    assert_eq!(entries, vec![(b"b".to_vec(), b"2".to_vec())]);
    assert_eq!(t.get(b"b").unwrap(), Some(b"2".to_vec()));
    assert_eq!(t.get(b"a").unwrap(), None);
}

/// `lazy_load` leaves `available_versions` incomplete until a version is
/// actually queried, unlike `load`'s eager hydration (spec.md §9, open
/// question (a)).
#[test]
fn lazy_load_hydrates_the_registry_only_on_demand() {
    let t = tree();
    t.set(b"a", Some(b"1")).unwrap();
    t.save_version().unwrap();
    t.set(b"a", Some(b"2")).unwrap();
    t.save_version().unwrap();

    t.lazy_load().unwrap();
    assert!(t.available_versions().is_empty());

    assert!(t.has_version(1).unwrap());
    assert_eq!(t.available_versions(), vec![1]);

    t.load().unwrap();
    assert_eq!(t.available_versions(), vec![1, 2]);
}
