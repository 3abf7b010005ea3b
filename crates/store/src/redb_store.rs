//! A durable, file-backed [`NodeStore`] built on `redb`, the same embedded
//! key-value engine the teacher's storage layer uses. Unlike the teacher's
//! epoch-sharded block store, this backend has no notion of blocks or
//! epochs — it only needs the tables spec.md §6 actually names.

use crate::fast_node::FastNode;
use crate::root_entry::RootEntry;
use crate::traits::{NodeBatch, NodeHash, NodeStore};
use merkle_kv_types::{StoreError, Version};
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::BTreeMap;
use std::path::Path;

const NODES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("NODES");
const ROOTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("ROOTS");
const ORPHANS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("ORPHANS");
const FAST_NODES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("FAST_NODES");
const META: TableDefinition<&[u8], &[u8]> = TableDefinition::new("META");

const META_UPGRADED: &[u8] = b"upgraded";
const META_FORCE_UPGRADE: &[u8] = b"force_upgrade";
const META_LATEST_VERSION: &[u8] = b"latest_version";

fn version_key(version: Version) -> [u8; 8] {
    version.to_be_bytes()
}

fn orphan_key(version: Version, hash: &NodeHash) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + 32);
    key.extend_from_slice(&version_key(version));
    key.extend_from_slice(hash);
    key
}

fn encode_root(root: RootEntry) -> [u8; 33] {
    let mut buf = [0u8; 33];
    if let RootEntry::Hash(h) = root {
        buf[0] = 1;
        buf[1..].copy_from_slice(&h);
    }
    buf
}

fn decode_root(bytes: &[u8]) -> Option<RootEntry> {
    if bytes.len() != 33 {
        return None;
    }
    if bytes[0] == 0 {
        Some(RootEntry::Empty)
    } else {
        let mut h = [0u8; 32];
        h.copy_from_slice(&bytes[1..]);
        Some(RootEntry::Hash(h))
    }
}

fn backend_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// A `redb`-backed, file-durable [`NodeStore`].
pub struct RedbNodeStore {
    db: Database,
}

impl RedbNodeStore {
    /// Opens (creating if absent) a store at `path`, ensuring every table
    /// exists.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = Database::create(path).map_err(backend_err)?;
        {
            let txn = db.begin_write().map_err(backend_err)?;
            txn.open_table(NODES).map_err(backend_err)?;
            txn.open_table(ROOTS).map_err(backend_err)?;
            txn.open_table(ORPHANS).map_err(backend_err)?;
            txn.open_table(FAST_NODES).map_err(backend_err)?;
            txn.open_table(META).map_err(backend_err)?;
            txn.commit().map_err(backend_err)?;
        }
        Ok(Self { db })
    }

    fn read_meta_flag(&self, key: &[u8]) -> Result<bool, StoreError> {
        let txn = self.db.begin_read().map_err(backend_err)?;
        let table = txn.open_table(META).map_err(backend_err)?;
        Ok(table
            .get(key)
            .map_err(backend_err)?
            .map(|v| v.value() == [1])
            .unwrap_or(false))
    }
}

impl NodeStore for RedbNodeStore {
    fn get_node(&self, hash: &NodeHash) -> Result<Option<Vec<u8>>, StoreError> {
        let txn = self.db.begin_read().map_err(backend_err)?;
        let table = txn.open_table(NODES).map_err(backend_err)?;
        Ok(table
            .get(hash.as_slice())
            .map_err(backend_err)?
            .map(|v| v.value().to_vec()))
    }

    fn get_root(&self, version: Version) -> Result<Option<RootEntry>, StoreError> {
        let txn = self.db.begin_read().map_err(backend_err)?;
        let table = txn.open_table(ROOTS).map_err(backend_err)?;
        let key = version_key(version);
        Ok(table
            .get(key.as_slice())
            .map_err(backend_err)?
            .and_then(|v| decode_root(v.value())))
    }

    fn get_roots(&self) -> Result<BTreeMap<Version, RootEntry>, StoreError> {
        let txn = self.db.begin_read().map_err(backend_err)?;
        let table = txn.open_table(ROOTS).map_err(backend_err)?;
        let mut out = BTreeMap::new();
        for entry in table.iter().map_err(backend_err)? {
            let (k, v) = entry.map_err(backend_err)?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(k.value());
            let version = Version::from_be_bytes(raw);
            if let Some(root) = decode_root(v.value()) {
                out.insert(version, root);
            }
        }
        Ok(out)
    }

    fn get_latest_version(&self) -> Result<Option<Version>, StoreError> {
        let txn = self.db.begin_read().map_err(backend_err)?;
        let table = txn.open_table(META).map_err(backend_err)?;
        Ok(table
            .get(META_LATEST_VERSION)
            .map_err(backend_err)?
            .and_then(|v| {
                let bytes = v.value();
                (bytes.len() == 8).then(|| {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(bytes);
                    Version::from_be_bytes(raw)
                })
            }))
    }

    fn get_fast_node(&self, key: &[u8]) -> Result<Option<FastNode>, StoreError> {
        let txn = self.db.begin_read().map_err(backend_err)?;
        let table = txn.open_table(FAST_NODES).map_err(backend_err)?;
        table
            .get(key)
            .map_err(backend_err)?
            .map(|v| bincode::deserialize(v.value()).map_err(backend_err))
            .transpose()
    }

    fn iter_fast_nodes(
        &self,
    ) -> Result<Box<dyn Iterator<Item = Result<FastNode, StoreError>> + '_>, StoreError> {
        let txn = self.db.begin_read().map_err(backend_err)?;
        let table = txn.open_table(FAST_NODES).map_err(backend_err)?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(backend_err)? {
            let (_, v) = entry.map_err(backend_err)?;
            out.push(bincode::deserialize::<FastNode>(v.value()).map_err(backend_err));
        }
        Ok(Box::new(out.into_iter()))
    }

    fn has_upgraded_to_fast_storage(&self) -> Result<bool, StoreError> {
        self.read_meta_flag(META_UPGRADED)
    }

    fn should_force_fast_storage_upgrade(&self) -> Result<bool, StoreError> {
        self.read_meta_flag(META_FORCE_UPGRADE)
    }

    fn begin_batch(&self) -> Box<dyn NodeBatch + '_> {
        Box::new(RedbBatch {
            db: &self.db,
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

struct RedbBatch<'a> {
    db: &'a Database,
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

impl NodeBatch for RedbBatch<'_> {
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
        let txn = self.db.begin_write().map_err(backend_err)?;
        {
            let mut nodes = txn.open_table(NODES).map_err(backend_err)?;
            for (hash, bytes) in &self.new_nodes {
                nodes
                    .insert(hash.as_slice(), bytes.as_slice())
                    .map_err(backend_err)?;
            }

            let mut orphans = txn.open_table(ORPHANS).map_err(backend_err)?;
            for (version, set) in &self.new_orphans {
                for (hash, creation_version) in set {
                    let key = orphan_key(*version, hash);
                    orphans
                        .insert(key.as_slice(), creation_version.to_be_bytes().as_slice())
                        .map_err(backend_err)?;
                }
            }
            for version in &self.deleted_versions {
                let start = orphan_key(*version, &[0u8; 32]);
                let end = orphan_key(*version + 1, &[0u8; 32]);
                let keys: Vec<Vec<u8>> = orphans
                    .range(start.as_slice()..end.as_slice())
                    .map_err(backend_err)?
                    .filter_map(|e| e.ok())
                    .map(|(k, _)| k.value().to_vec())
                    .collect();
                for key in keys {
                    orphans.remove(key.as_slice()).map_err(backend_err)?;
                }
            }
            for (from, to) in &self.deleted_ranges {
                let start = orphan_key(*from, &[0u8; 32]);
                let end = orphan_key(*to, &[0u8; 32]);
                let keys: Vec<Vec<u8>> = orphans
                    .range(start.as_slice()..end.as_slice())
                    .map_err(backend_err)?
                    .filter_map(|e| e.ok())
                    .map(|(k, _)| k.value().to_vec())
                    .collect();
                for key in keys {
                    orphans.remove(key.as_slice()).map_err(backend_err)?;
                }
            }
            if let Some(from) = self.deleted_from {
                let start = orphan_key(from + 1, &[0u8; 32]);
                let keys: Vec<Vec<u8>> = orphans
                    .range(start.as_slice()..)
                    .map_err(backend_err)?
                    .filter_map(|e| e.ok())
                    .map(|(k, _)| k.value().to_vec())
                    .collect();
                for key in keys {
                    orphans.remove(key.as_slice()).map_err(backend_err)?;
                }
            }

            let mut roots = txn.open_table(ROOTS).map_err(backend_err)?;
            for version in &self.deleted_versions {
                roots
                    .remove(version_key(*version).as_slice())
                    .map_err(backend_err)?;
            }
            for (from, to) in &self.deleted_ranges {
                let keys: Vec<Vec<u8>> = roots
                    .range(version_key(*from).as_slice()..version_key(*to).as_slice())
                    .map_err(backend_err)?
                    .filter_map(|e| e.ok())
                    .map(|(k, _)| k.value().to_vec())
                    .collect();
                for key in keys {
                    roots.remove(key.as_slice()).map_err(backend_err)?;
                }
            }
            if let Some(from) = self.deleted_from {
                let keys: Vec<Vec<u8>> = roots
                    .iter()
                    .map_err(backend_err)?
                    .filter_map(|e| e.ok())
                    .map(|(k, _)| k.value().to_vec())
                    .filter(|k| {
                        let mut raw = [0u8; 8];
                        raw.copy_from_slice(k);
                        Version::from_be_bytes(raw) > from
                    })
                    .collect();
                for key in keys {
                    roots.remove(key.as_slice()).map_err(backend_err)?;
                }
            }
            for (version, root) in &self.new_roots {
                let encoded = encode_root(*root);
                roots
                    .insert(version_key(*version).as_slice(), encoded.as_slice())
                    .map_err(backend_err)?;
            }

            let mut fast = txn.open_table(FAST_NODES).map_err(backend_err)?;
            if self.clear_fast {
                let keys: Vec<Vec<u8>> = fast
                    .iter()
                    .map_err(backend_err)?
                    .filter_map(|e| e.ok())
                    .map(|(k, _)| k.value().to_vec())
                    .collect();
                for key in keys {
                    fast.remove(key.as_slice()).map_err(backend_err)?;
                }
            }
            for key in &self.fast_deletes {
                fast.remove(key.as_slice()).map_err(backend_err)?;
            }
            for (key, node) in &self.fast_upserts {
                let encoded = bincode::serialize(node).map_err(backend_err)?;
                fast.insert(key.as_slice(), encoded.as_slice())
                    .map_err(backend_err)?;
            }

            let mut meta = txn.open_table(META).map_err(backend_err)?;
            if let Some(upgraded) = self.set_upgraded {
                meta.insert(META_UPGRADED, [upgraded as u8].as_slice())
                    .map_err(backend_err)?;
                if upgraded {
                    meta.insert(META_FORCE_UPGRADE, [0u8].as_slice())
                        .map_err(backend_err)?;
                }
            }
            if self.clear_fast {
                // A forced upgrade consumes its own trigger.
                meta.insert(META_FORCE_UPGRADE, [0u8].as_slice())
                    .map_err(backend_err)?;
            }
            if let Some(v) = self.reset_latest {
                let current = meta
                    .get(META_LATEST_VERSION)
                    .map_err(backend_err)?
                    .and_then(|val| {
                        let bytes = val.value();
                        (bytes.len() == 8).then(|| {
                            let mut raw = [0u8; 8];
                            raw.copy_from_slice(bytes);
                            Version::from_be_bytes(raw)
                        })
                    });
                let next = current.map_or(v, |cur| cur.max(v));
                meta.insert(META_LATEST_VERSION, next.to_be_bytes().as_slice())
                    .map_err(backend_err)?;
            }
            if self.deleted_from.is_some() || !self.deleted_ranges.is_empty() {
                let roots_read = txn.open_table(ROOTS).map_err(backend_err)?;
                let last = roots_read
                    .iter()
                    .map_err(backend_err)?
                    .filter_map(|e| e.ok())
                    .next_back()
                    .map(|(k, _)| {
                        let mut raw = [0u8; 8];
                        raw.copy_from_slice(k.value());
                        Version::from_be_bytes(raw)
                    });
                match last {
                    Some(v) => {
                        meta.insert(META_LATEST_VERSION, v.to_be_bytes().as_slice())
                            .map_err(backend_err)?;
                    }
                    None => {
                        meta.remove(META_LATEST_VERSION).map_err(backend_err)?;
                    }
                }
            }
        }
        txn.commit().map_err(backend_err)
    }
}
