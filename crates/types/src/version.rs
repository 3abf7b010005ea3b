//! The version tag attached to a committed tree snapshot.

/// Monotonically increasing tag of a committed tree snapshot. Saved versions
/// are strictly positive; the working version is always `last_saved + 1`.
pub type Version = i64;

/// The version used for the first save when no `initial_version` override is
/// configured.
pub const FIRST_VERSION: Version = 1;
