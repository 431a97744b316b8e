//! Engine-wide counters and the aggregated statistics snapshot.

use crate::cache::TieredCache;
use crate::store::{ShardStats, ShardStore};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Observers polling statistics are served a cached snapshot for this long.
const SNAPSHOT_MIN_INTERVAL: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Live counters
// ---------------------------------------------------------------------------

/// Lock-free counters bumped from pipeline workers, the scheduler, and the
/// query planner.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub indexed_files: AtomicU64,
    pub search_count: AtomicU64,
    pub immediate_hits: AtomicU64,
    pub hot_hits: AtomicU64,
    pub complete_hits: AtomicU64,
    pub error_count: AtomicU64,
    pub durable_writes: AtomicU64,
    pub durable_failures: AtomicU64,
    pub optimization_count: AtomicU64,
    pub total_search_micros: AtomicU64,
    snapshot_gate: Mutex<Option<(Instant, StatsSnapshot)>>,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one search invocation and which tiers contributed results.
    pub fn record_search(
        &self,
        elapsed: Duration,
        immediate_hit: bool,
        hot_hit: bool,
        complete_hit: bool,
    ) {
        self.search_count.fetch_add(1, Ordering::Relaxed);
        self.total_search_micros.fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        if immediate_hit {
            self.immediate_hits.fetch_add(1, Ordering::Relaxed);
        }
        if hot_hit {
            self.hot_hits.fetch_add(1, Ordering::Relaxed);
        }
        if complete_hit {
            self.complete_hits.fetch_add(1, Ordering::Relaxed);
        }
        // Periodic self-tuning checkpoint
        let count = self.search_count.load(Ordering::Relaxed);
        if count > 0 && count % 1000 == 0 {
            self.optimization_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Aggregated snapshot across counters, cache tiers, and shard stores.
    /// Rate-limited: repeated calls inside the window return the cached copy
    /// so observers cannot thrash the shard stores.
    pub fn snapshot(&self, cache: &TieredCache, stores: &[ShardStore]) -> StatsSnapshot {
        {
            let gate = self.snapshot_gate.lock().expect("stats gate poisoned");
            if let Some((at, cached)) = gate.as_ref() {
                if at.elapsed() < SNAPSHOT_MIN_INTERVAL {
                    return cached.clone();
                }
            }
        }

        let shards: Vec<ShardStats> = stores.iter().map(ShardStore::stats).collect();
        let mut by_type: BTreeMap<String, u64> = BTreeMap::new();
        for shard in &shards {
            for (ty, count) in &shard.by_type {
                *by_type.entry(ty.clone()).or_insert(0) += count;
            }
        }

        let search_count = self.search_count.load(Ordering::Relaxed);
        let total_micros = self.total_search_micros.load(Ordering::Relaxed);
        let snapshot = StatsSnapshot {
            indexed_files: self.indexed_files.load(Ordering::Relaxed),
            documents_total: shards.iter().map(|s| s.document_count).sum(),
            shard_count: shards.len(),
            storage_bytes: shards.iter().map(|s| s.storage_bytes).sum(),
            by_type,
            shards,
            immediate_entries: cache.immediate_len(),
            hot_entries: cache.hot_len(),
            immediate_bytes: cache.immediate_bytes(),
            hot_bytes: cache.hot_bytes(),
            search_count,
            immediate_hits: self.immediate_hits.load(Ordering::Relaxed),
            hot_hits: self.hot_hits.load(Ordering::Relaxed),
            complete_hits: self.complete_hits.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            durable_writes: self.durable_writes.load(Ordering::Relaxed),
            durable_failures: self.durable_failures.load(Ordering::Relaxed),
            optimization_count: self.optimization_count.load(Ordering::Relaxed),
            total_search_secs: total_micros as f64 / 1e6,
            avg_search_secs: if search_count > 0 {
                (total_micros as f64 / search_count as f64) / 1e6
            } else {
                0.0
            },
        };

        let mut gate = self.snapshot_gate.lock().expect("stats gate poisoned");
        *gate = Some((Instant::now(), snapshot.clone()));
        snapshot
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// One aggregated view of the engine, cheap to serialize for callers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    pub indexed_files: u64,
    pub documents_total: u64,
    pub shard_count: usize,
    pub storage_bytes: u64,
    pub by_type: BTreeMap<String, u64>,
    pub shards: Vec<ShardStats>,
    pub immediate_entries: usize,
    pub hot_entries: usize,
    pub immediate_bytes: u64,
    pub hot_bytes: u64,
    pub search_count: u64,
    pub immediate_hits: u64,
    pub hot_hits: u64,
    pub complete_hits: u64,
    pub error_count: u64,
    pub durable_writes: u64,
    pub durable_failures: u64,
    pub optimization_count: u64,
    pub total_search_secs: f64,
    pub avg_search_secs: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_recording_accumulates() {
        let stats = EngineStats::new();
        stats.record_search(Duration::from_millis(10), true, false, false);
        stats.record_search(Duration::from_millis(30), false, false, true);
        assert_eq!(stats.search_count.load(Ordering::Relaxed), 2);
        assert_eq!(stats.immediate_hits.load(Ordering::Relaxed), 1);
        assert_eq!(stats.complete_hits.load(Ordering::Relaxed), 1);
        assert!(stats.total_search_micros.load(Ordering::Relaxed) >= 40_000);
    }

    #[test]
    fn snapshot_is_rate_limited() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TieredCache::new(dir.path(), 10, 10, Duration::from_secs(5));
        let stats = EngineStats::new();

        let first = stats.snapshot(&cache, &[]);
        cache.insert_immediate("/a.txt", "a.txt", ".txt", 1, "body");
        // Inside the window: still the cached copy
        let second = stats.snapshot(&cache, &[]);
        assert_eq!(first.immediate_entries, second.immediate_entries);
    }
}
