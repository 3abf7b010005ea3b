use merkle_kv_store::{FastNode, MemoryNodeStore, NodeStore, RedbNodeStore, RootEntry};
use std::collections::BTreeMap;

fn exercise(store: &dyn NodeStore) {
    assert_eq!(store.get_latest_version().unwrap(), None);
    assert!(store.get_node(&[1u8; 32]).unwrap().is_none());

    let mut batch = store.begin_batch();
    batch.put_node([1u8; 32], b"leaf-bytes".to_vec());
    batch.put_root(1, RootEntry::Hash([1u8; 32]));
    let mut orphans = BTreeMap::new();
    orphans.insert([9u8; 32], 0i64);
    batch.put_orphans(1, &orphans);
    batch.put_fast_node(&FastNode::new(b"k".to_vec(), b"v".to_vec(), 1));
    batch.set_fast_storage_upgraded(true);
    batch.commit().unwrap();

    assert_eq!(
        store.get_node(&[1u8; 32]).unwrap(),
        Some(b"leaf-bytes".to_vec())
    );
    assert_eq!(store.get_root(1).unwrap(), Some(RootEntry::Hash([1u8; 32])));
    assert_eq!(store.get_latest_version().unwrap(), Some(1));
    assert!(store.has_upgraded_to_fast_storage().unwrap());
    assert_eq!(
        store.get_fast_node(b"k").unwrap().map(|n| n.value),
        Some(b"v".to_vec())
    );

    let mut batch = store.begin_batch();
    batch.put_root(2, RootEntry::Empty);
    batch.commit().unwrap();
    assert_eq!(store.get_root(2).unwrap(), Some(RootEntry::Empty));
    assert_eq!(store.get_latest_version().unwrap(), Some(2));

    let mut batch = store.begin_batch();
    batch.delete_version(2);
    batch.commit().unwrap();
    assert_eq!(store.get_root(2).unwrap(), None);

    let roots = store.get_roots().unwrap();
    assert_eq!(roots.len(), 1);
}

#[test]
fn memory_store_round_trips() {
    let store = MemoryNodeStore::new();
    exercise(&store);
}

#[test]
fn redb_store_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let store = RedbNodeStore::open(dir.path().join("store.redb")).unwrap();
    exercise(&store);
}
