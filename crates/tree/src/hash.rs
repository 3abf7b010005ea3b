//! The canonical node-hash preimage. Bit-exact by construction: any
//! implementation encoding `(height, size, version, key, children-or-value)`
//! the same way produces the same 32-byte digest, independent of language or
//! the byte-level storage encoding (see [`crate::codec`]).

use merkle_kv_types::Version;
use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};

/// A node's content hash.
pub type NodeHash = [u8; 32];

/// The root hash of an empty tree: the SHA-256 digest of the empty input.
/// Distinct from any node hash, which always has a non-empty preimage.
pub static EMPTY_TREE_HASH: Lazy<NodeHash> = Lazy::new(|| sha256(&[]));

/// Plain SHA-256 over `bytes`.
pub fn sha256(bytes: &[u8]) -> NodeHash {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Appends `bytes` to `out`, preceded by its length as a protobuf-style
/// base-128 varint (`prost::encode_length_delimiter`), the same
/// length-delimiting `prost` uses for its own length-delimited wire types.
fn len_prefixed(out: &mut Vec<u8>, bytes: &[u8]) {
    prost::encode_length_delimiter(bytes.len(), out).expect("length fits in a prost varint");
    out.extend_from_slice(bytes);
}

/// Appends `value` to `out` as a protobuf-style base-128 varint via
/// `prost::encoding::encode_varint`, the same primitive
/// `encode_length_delimiter` itself calls. Takes `u64` directly rather than
/// `usize` so the encoding of `height`/`size`/`version` is the same on every
/// target width — unlike a byte slice length, these fields are part of the
/// cross-implementation hash preimage and must not depend on the host's
/// pointer size.
fn varint(out: &mut Vec<u8>, value: u64) {
    prost::encoding::encode_varint(value, out);
}

/// The preimage/hash for a leaf node: `varint(height=0) || varint(size=1) ||
/// varint(version) || lenPrefixed(key) || lenPrefixed(sha256(value))`.
pub fn leaf_hash(height: i32, size: u64, version: Version, key: &[u8], value: &[u8]) -> NodeHash {
    let mut preimage = Vec::with_capacity(16 + key.len() + 32);
    varint(&mut preimage, height as u64);
    varint(&mut preimage, size);
    varint(&mut preimage, version as u64);
    len_prefixed(&mut preimage, key);
    len_prefixed(&mut preimage, &sha256(value));
    sha256(&preimage)
}

/// The preimage/hash for an inner node: `varint(height) || varint(size) ||
/// varint(version) || lenPrefixed(leftHash) || lenPrefixed(rightHash) ||
/// lenPrefixed(key)`.
pub fn inner_hash(
    height: i32,
    size: u64,
    version: Version,
    key: &[u8],
    left: &NodeHash,
    right: &NodeHash,
) -> NodeHash {
    let mut preimage = Vec::with_capacity(16 + key.len() + 64);
    varint(&mut preimage, height as u64);
    varint(&mut preimage, size);
    varint(&mut preimage, version as u64);
    len_prefixed(&mut preimage, left);
    len_prefixed(&mut preimage, right);
    len_prefixed(&mut preimage, key);
    sha256(&preimage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_hash_is_deterministic() {
        let a = leaf_hash(0, 1, 1, b"k", b"v");
        let b = leaf_hash(0, 1, 1, b"k", b"v");
        assert_eq!(a, b);
    }

    #[test]
    fn empty_tree_hash_is_sha256_of_empty_input() {
        assert_eq!(*EMPTY_TREE_HASH, sha256(&[]));
    }
}
