use merkle_kv_types::Version;
use serde::{Deserialize, Serialize};

/// A flat fast-path entry: the live value for `key` as of
/// `version_last_updated_at`, the version at which it was last written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FastNode {
    /// The key this entry indexes.
    pub key: Vec<u8>,
    /// The current live value for `key`.
    pub value: Vec<u8>,
    /// The version at which `value` was last written.
    pub version_last_updated_at: Version,
}

impl FastNode {
    /// Builds a new fast-path entry.
    pub fn new(key: Vec<u8>, value: Vec<u8>, version_last_updated_at: Version) -> Self {
        Self {
            key,
            value,
            version_last_updated_at,
        }
    }
}
