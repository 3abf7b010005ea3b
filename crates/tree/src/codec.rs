//! Node *storage* encoding — how a [`Node`] is serialized into the bytes a
//! `NodeStore` persists. Deliberately independent of the canonical hash
//! preimage in [`crate::hash`]: this encoding may change freely (it is not
//! part of any cross-implementation compatibility contract) as long as
//! `decode_node(encode_node(n))` round-trips.

use crate::hash::NodeHash;
use crate::node::{Child, Node, NodeData};
use merkle_kv_store::NodeStore;
use merkle_kv_types::{StoreError, Version};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Serialize, Deserialize)]
enum StoredData {
    Leaf { value: Vec<u8> },
    Inner { left: NodeHash, right: NodeHash },
}

#[derive(Serialize, Deserialize)]
struct StoredNode {
    key: Vec<u8>,
    version: Version,
    height: i32,
    size: u64,
    data: StoredData,
}

/// Encodes `node` for storage. Inner children are always flattened to their
/// hash, even if currently held as `Child::Resolved` in memory.
pub fn encode_node(node: &Node) -> Result<Vec<u8>, StoreError> {
    let data = match &node.data {
        NodeData::Leaf { value } => StoredData::Leaf {
            value: value.clone(),
        },
        NodeData::Inner { left, right } => StoredData::Inner {
            left: left.hash(),
            right: right.hash(),
        },
    };
    let stored = StoredNode {
        key: node.key.clone(),
        version: node.version,
        height: node.height,
        size: node.size,
        data,
    };
    bincode::serialize(&stored).map_err(|e| StoreError::Integrity(format!("encode node: {e}")))
}

/// Decodes a node previously written by [`encode_node`]. The result is
/// marked `persisted` (see `Node::from_parts`) since it can only have come
/// from the store.
pub fn decode_node(bytes: &[u8]) -> Result<Node, StoreError> {
    let stored: StoredNode = bincode::deserialize(bytes)
        .map_err(|e| StoreError::Integrity(format!("decode node: {e}")))?;
    let data = match stored.data {
        StoredData::Leaf { value } => NodeData::Leaf { value },
        StoredData::Inner { left, right } => NodeData::Inner {
            left: Child::Hash(left),
            right: Child::Hash(right),
        },
    };
    Ok(Node::from_parts(
        stored.key,
        stored.version,
        stored.height,
        stored.size,
        data,
    ))
}

/// Materializes `child` into an in-memory node, faulting in from `store` if
/// only a hash is held. The core of `Node::leftChild`/`rightChild` from
/// spec.md §4.1.
pub fn resolve(store: &dyn NodeStore, child: &Child) -> Result<Arc<Node>, StoreError> {
    match child {
        Child::Resolved(node) => Ok(Arc::clone(node)),
        Child::Hash(hash) => {
            let bytes = store.get_node(hash)?.ok_or_else(|| {
                StoreError::Integrity(format!("node store missing node {}", hex_prefix(hash)))
            })?;
            Ok(Arc::new(decode_node(&bytes)?))
        }
    }
}

fn hex_prefix(hash: &NodeHash) -> String {
    hash[..4].iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_round_trips() {
        let leaf = Node::new_leaf(b"k".to_vec(), b"v".to_vec(), 3);
        let bytes = encode_node(&leaf).unwrap();
        let decoded = decode_node(&bytes).unwrap();
        assert_eq!(decoded.key, leaf.key);
        assert_eq!(decoded.value(), leaf.value());
        assert_eq!(decoded.version, leaf.version);
        assert!(decoded.is_persisted());
        assert_eq!(decoded.hash(), leaf.hash());
    }

    #[test]
    fn inner_round_trips() {
        let left = Node::new_leaf(b"a".to_vec(), b"1".to_vec(), 1);
        let right = Node::new_leaf(b"b".to_vec(), b"2".to_vec(), 1);
        let (lh, rh) = (left.hash(), right.hash());
        let inner = Node::new_inner(
            b"b".to_vec(),
            Child::Hash(lh),
            Child::Hash(rh),
            1,
            1,
            2,
        );
        let bytes = encode_node(&inner).unwrap();
        let decoded = decode_node(&bytes).unwrap();
        assert_eq!(decoded.hash(), inner.hash());
    }
}
