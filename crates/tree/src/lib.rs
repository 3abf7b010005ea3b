//! The copy-on-write AVL working tree built on top of `merkle-kv-store`'s
//! node store abstraction: node shape and hashing, storage encoding, the
//! version registry, the fast-path index, and the mutable/immutable tree
//! views themselves.

#![cfg_attr(
    not(test),
    deny(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::indexing_slicing
    )
)]

pub mod codec;
pub mod config;
pub mod fast_path;
pub mod hash;
pub mod immutable;
pub mod iter;
pub mod mutable;
pub mod node;
pub mod registry;

pub use config::TreeOptions;
pub use fast_path::FastPathDeltas;
pub use hash::{NodeHash, EMPTY_TREE_HASH};
pub use immutable::ImmutableTree;
pub use iter::FastPathMerge;
pub use mutable::MutableTree;
pub use node::{Child, Node, NodeData};
pub use registry::VersionRegistry;
