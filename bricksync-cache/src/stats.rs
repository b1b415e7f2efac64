//! Cache counters.

use serde::Serialize;

/// Statistics about cache usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Subscriptions served from a usable cached value.
    pub hits: u64,
    /// Subscriptions that had to start a fetch.
    pub misses: u64,
    /// Fetches started for any reason.
    pub fetches_started: u64,
    /// Subscriptions attached to a fetch already in flight.
    pub deduplicated: u64,
    /// Entries moved to `Stale` by invalidation.
    pub invalidations: u64,
    /// Entries removed after their retention window.
    pub evictions: u64,
    /// In-flight fetches cancelled because every subscriber left.
    pub cancelled_fetches: u64,
    /// Number of entries currently in the store.
    pub entry_count: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
