//! Runtime counters.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters updated by the cache as it works.
#[derive(Debug, Default)]
pub struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    transfers: AtomicU64,
    coalesced: AtomicU64,
    dedup_hits: AtomicU64,
    evictions: AtomicU64,
    evicted_bytes: AtomicU64,
    failures: AtomicU64,
}

impl CacheCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// A transfer was started.
    pub fn record_transfer(&self) {
        self.transfers.fetch_add(1, Ordering::Relaxed);
    }

    /// A caller joined a transfer already in flight.
    pub fn record_coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    /// New content matched an existing entry's hash.
    pub fn record_dedup(&self) {
        self.dedup_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self, bytes: u64) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        self.evicted_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.transfers,
            &self.coalesced,
            &self.dedup_hits,
            &self.evictions,
            &self.evicted_bytes,
            &self.failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Combine the counters with store totals into a snapshot.
    pub fn snapshot(&self, entries: usize, total_bytes: u64, budget_bytes: u64) -> CacheStats {
        CacheStats {
            entries,
            total_bytes,
            budget_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            transfers: self.transfers.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            dedup_hits: self.dedup_hits.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            evicted_bytes: self.evicted_bytes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub budget_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub transfers: u64,
    pub coalesced: u64,
    pub dedup_hits: u64,
    pub evictions: u64,
    pub evicted_bytes: u64,
    pub failures: u64,
}

impl CacheStats {
    /// Fraction of lookups served from disk, or 0 before any lookup.
    pub fn hit_ratio(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let counters = CacheCounters::new();
        counters.record_hit();
        counters.record_hit();
        counters.record_miss();
        counters.record_eviction(100);
        counters.record_eviction(50);

        let stats = counters.snapshot(3, 900, 1000);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.evictions, 2);
        assert_eq!(stats.evicted_bytes, 150);
        assert_eq!(stats.entries, 3);
        assert!((stats.hit_ratio() - 2.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_reset() {
        let counters = CacheCounters::new();
        counters.record_transfer();
        counters.record_failure();
        counters.reset();
        assert_eq!(counters.snapshot(0, 0, 1), CacheStats {
            budget_bytes: 1,
            ..CacheStats::default()
        });
    }

    #[test]
    fn test_stats_serialize_camel_case() {
        let json = serde_json::to_value(CacheStats::default()).unwrap();
        assert!(json.get("totalBytes").is_some());
        assert!(json.get("dedupHits").is_some());
    }
}
