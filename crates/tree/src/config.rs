//! Validated configuration for a [`crate::mutable::MutableTree`]. A plain
//! struct with a `Default` impl, matching the `ioi-types`-style config
//! pattern rather than a builder macro.

use merkle_kv_types::Version;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::time::Duration;

/// Default LRU capacity for the store-level node cache (see
/// `merkle_kv_store::CachedNodeStore`).
#[allow(clippy::unwrap_used)] // 10_000 is a non-zero literal; this can never fail.
fn default_cache_size() -> NonZeroUsize {
    NonZeroUsize::new(10_000).unwrap()
}

/// The resident-memory threshold that trips the fast-path upgrade watchdog
/// (spec.md §4.7/§9): 4 GiB.
pub const DEFAULT_WATCHDOG_THRESHOLD_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// How often the watchdog samples resident memory during a fast-path
/// upgrade.
pub const DEFAULT_WATCHDOG_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

fn default_watchdog_threshold_bytes() -> u64 {
    DEFAULT_WATCHDOG_THRESHOLD_BYTES
}

fn default_watchdog_sample_interval() -> Duration {
    DEFAULT_WATCHDOG_SAMPLE_INTERVAL
}

/// The two configured options spec.md §6 names (`cache_size`,
/// `initial_version`) plus the fast-path memory watchdog tunables from
/// spec.md §9.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeOptions {
    /// LRU capacity for the node cache in front of the node store.
    pub cache_size: NonZeroUsize,
    /// `0` means "start at 1" (spec.md §6).
    pub initial_version: Version,
    /// Resident-memory threshold, in bytes, that trips the upgrade
    /// watchdog's reclamation request.
    pub watchdog_threshold_bytes: u64,
    /// How often the watchdog samples resident memory during an upgrade.
    pub watchdog_sample_interval: Duration,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            cache_size: default_cache_size(),
            initial_version: 0,
            watchdog_threshold_bytes: default_watchdog_threshold_bytes(),
            watchdog_sample_interval: default_watchdog_sample_interval(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_documented_tunables() {
        let opts = TreeOptions::default();
        assert_eq!(opts.initial_version, 0);
        assert_eq!(opts.watchdog_threshold_bytes, 4 * 1024 * 1024 * 1024);
        assert_eq!(opts.watchdog_sample_interval, Duration::from_secs(1));
    }
}
