//! The error type shared by the node store and the tree layers.

use crate::version::Version;
use thiserror::Error;

/// A trait for assigning a stable, machine-readable string code to an error,
/// useful for metrics and log correlation.
pub trait ErrorCode {
    /// Returns the unique, stable string identifier for this error variant.
    fn code(&self) -> &'static str;
}

/// Errors surfaced by the node store and the working tree.
///
/// Three classes, per the error-handling design: *input contract* violations
/// (`NilValue`, `DeleteLatestVersion`, `NonPositiveVersion`) are fatal aborts
/// of the current operation; *store failures* (`Backend`) are surfaced
/// verbatim; *integrity violations* (`Integrity`) indicate a bug and must
/// never be silently recovered from.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A lookup or delete named a version the store has no record of.
    #[error("version does not exist")]
    VersionDoesNotExist,

    /// A strictly positive target version was requested of `load` but the
    /// store's latest known version differs.
    #[error("version mismatch: latest known version is {latest}")]
    VersionMismatch {
        /// The latest version actually known to the store.
        latest: Version,
    },

    /// `save_version` was called for a version that already exists, and the
    /// working tree's hash does not match the one already stored.
    #[error("overwrite mismatch: existing root {existing:?} != new root {new:?}")]
    OverwriteMismatch {
        /// The hash already stored for this version.
        existing: [u8; 32],
        /// The hash the working tree would have produced.
        new: [u8; 32],
    },

    /// The store declares an `initial_version` floor and a persisted version
    /// below it was found.
    #[error("initial version violation: found version {found}, configured floor is {configured}")]
    InitialVersionViolation {
        /// The offending persisted version.
        found: Version,
        /// The configured `initial_version` floor.
        configured: Version,
    },

    /// A value of `null`/absent was passed to an insert. Values must be
    /// present (possibly zero-length) byte sequences.
    #[error("value must not be nil")]
    NilValue,

    /// A key of zero length was passed to an operation that requires a
    /// non-empty key.
    #[error("key must not be empty")]
    EmptyKey,

    /// An attempt was made to delete the latest saved version, or a
    /// non-positive version.
    #[error("cannot delete version {0}: latest version or non-positive version")]
    ProtectedVersion(Version),

    /// A structural invariant was violated: an unbalanced persisted node, an
    /// empty hash where one is never expected, or similar. These indicate a
    /// bug in this crate, not a recoverable runtime condition.
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// An error surfaced verbatim from the underlying physical store.
    #[error("store error: {0}")]
    Backend(String),
}

impl ErrorCode for StoreError {
    fn code(&self) -> &'static str {
        match self {
            Self::VersionDoesNotExist => "VERSION_DOES_NOT_EXIST",
            Self::VersionMismatch { .. } => "VERSION_MISMATCH",
            Self::OverwriteMismatch { .. } => "OVERWRITE_MISMATCH",
            Self::InitialVersionViolation { .. } => "INITIAL_VERSION_VIOLATION",
            Self::NilValue => "NIL_VALUE",
            Self::EmptyKey => "EMPTY_KEY",
            Self::ProtectedVersion(_) => "PROTECTED_VERSION",
            Self::Integrity(_) => "INTEGRITY_VIOLATION",
            Self::Backend(_) => "STORE_ERROR",
        }
    }
}
