//! The node-store external collaborator: a content-addressed map from node
//! hash to encoded node bytes, plus auxiliary maps for roots-by-version,
//! orphans-by-version, and fast-path entries. Exposes atomic batch commit.
#![cfg_attr(
    not(test),
    deny(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::indexing_slicing
    )
)]

pub mod cached;
pub mod fast_node;
pub mod memory;
pub mod redb_store;
mod root_entry;
mod traits;

pub use cached::CachedNodeStore;
pub use fast_node::FastNode;
pub use memory::MemoryNodeStore;
pub use redb_store::RedbNodeStore;
pub use root_entry::RootEntry;
pub use traits::{NodeBatch, NodeHash, NodeStore};
