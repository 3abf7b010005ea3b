use crate::traits::NodeHash;

/// The tri-state result of looking up a version's root: the store may have
/// never heard of the version (`get_root` returns `Ok(None)`), the version
/// may be known and empty (no keys were ever live at that version), or the
/// version may be known and rooted at a node hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootEntry {
    /// The version was saved with an empty tree.
    Empty,
    /// The version was saved with a root at this node hash.
    Hash(NodeHash),
}

impl RootEntry {
    /// The node hash of this root, or `None` for an empty tree.
    pub fn hash(self) -> Option<NodeHash> {
        match self {
            RootEntry::Empty => None,
            RootEntry::Hash(h) => Some(h),
        }
    }
}
