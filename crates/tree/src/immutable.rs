//! A read-only view rooted at one node, bound to a version. Point lookup,
//! ordered iteration, size/height, and subtree hashing — spec.md §2, item 3.

use crate::codec;
use crate::hash::{NodeHash, EMPTY_TREE_HASH};
use crate::node::Child;
use merkle_kv_store::NodeStore;
use merkle_kv_types::{StoreError, Version};
use std::cmp::Ordering;

/// A frozen view of the tree as of `version`. Safe to read concurrently
/// with other `ImmutableTree`s and with a `MutableTree`'s own reads,
/// provided `version` is not deleted for the duration of the read (spec.md
/// §5).
#[derive(Clone)]
pub struct ImmutableTree<'s> {
    store: &'s dyn NodeStore,
    root: Option<Child>,
    version: Version,
}

impl<'s> ImmutableTree<'s> {
    pub(crate) fn new(store: &'s dyn NodeStore, root: Option<Child>, version: Version) -> Self {
        Self {
            store,
            root,
            version,
        }
    }

    /// The version this view is bound to.
    pub fn version(&self) -> Version {
        self.version
    }

    /// `true` iff this view has no keys.
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// The subtree hash of the whole tree: the root node's hash, or
    /// [`EMPTY_TREE_HASH`] for an empty tree.
    pub fn hash(&self) -> Result<NodeHash, StoreError> {
        match &self.root {
            None => Ok(*EMPTY_TREE_HASH),
            Some(child) => Ok(codec::resolve(self.store, child)?.hash()),
        }
    }

    /// Number of leaves.
    pub fn size(&self) -> Result<u64, StoreError> {
        match &self.root {
            None => Ok(0),
            Some(child) => Ok(codec::resolve(self.store, child)?.size),
        }
    }

    /// Tree height (0 for a single leaf, -1 conventionally treated as empty
    /// by callers that need it; here simply `None` for empty).
    pub fn height(&self) -> Result<Option<i32>, StoreError> {
        match &self.root {
            None => Ok(None),
            Some(child) => Ok(Some(codec::resolve(self.store, child)?.height)),
        }
    }

    /// Point lookup by descending the tree (spec.md §4.4, the non-fast-path
    /// branch).
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let Some(root) = &self.root else {
            return Ok(None);
        };
        Self::get_recursive(self.store, root, key)
    }

    fn get_recursive(
        store: &dyn NodeStore,
        child: &Child,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let node = codec::resolve(store, child)?;
        if node.is_leaf() {
            return Ok((key == node.key.as_slice())
                .then(|| node.value().map(<[u8]>::to_vec))
                .flatten());
        }
        let (left, right) = node.inner_children()?;
        match key.cmp(node.key.as_slice()) {
            Ordering::Less => Self::get_recursive(store, &left, key),
            _ => Self::get_recursive(store, &right, key),
        }
    }

    /// In-order traversal, yielding every `(key, value)` pair ascending.
    /// Used for versioned iteration not covered by the fast path (spec.md
    /// §4.5) and for the fast-path upgrade's repopulation pass (§4.7).
    pub fn iter_in_order(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let mut out = Vec::new();
        if let Some(root) = &self.root {
            Self::collect_in_order(self.store, root, &mut out)?;
        }
        Ok(out)
    }

    fn collect_in_order(
        store: &dyn NodeStore,
        child: &Child,
        out: &mut Vec<(Vec<u8>, Vec<u8>)>,
    ) -> Result<(), StoreError> {
        let node = codec::resolve(store, child)?;
        match node.value() {
            Some(value) => {
                out.push((node.key.clone(), value.to_vec()));
                Ok(())
            }
            None => {
                let (left, right) = node.inner_children()?;
                Self::collect_in_order(store, &left, out)?;
                Self::collect_in_order(store, &right, out)
            }
        }
    }

}
