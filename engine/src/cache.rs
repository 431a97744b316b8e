//! Two-tier in-memory cache serving queries while durable writes are
//! pending.
//!
//! The immediate tier holds a short preview of freshly extracted documents
//! and is volatile; the hot tier holds more content, survives restarts
//! through a JSON snapshot, and expires entries after a week. A path lives
//! in at most one tier: promotion always removes from the source before
//! inserting into the destination.

use crate::types::{
    cache_dir, file_name_of, file_type_of, now_secs, HotEntry, ImmediateEntry,
    HOT_CONTENT_CHARS, IMMEDIATE_PREVIEW_CHARS, RESULT_PREVIEW_CHARS,
};
use crossbeam_channel::{bounded, unbounded, RecvTimeoutError};
use dashmap::DashMap;
use docfind_core::normalize::{match_index, PatternSet};
use docfind_core::truncate_chars;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Hot-tier entries older than this are dropped on load.
const HOT_EXPIRY_SECS: f64 = 7.0 * 24.0 * 3600.0;

/// Chunked scanning kicks in above these tier sizes.
const IMMEDIATE_SCAN_CHUNK_THRESHOLD: usize = 1000;
const HOT_SCAN_CHUNK_THRESHOLD: usize = 5000;

/// Late scan chunks are dropped after these deadlines.
const IMMEDIATE_SCAN_DEADLINE: Duration = Duration::from_millis(1000);
const HOT_SCAN_DEADLINE: Duration = Duration::from_millis(1500);

/// Scan worker pool bound.
const SCAN_POOL: usize = 8;

/// A cache-tier match before planner scoring.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub file_path: String,
    pub file_name: String,
    pub preview: String,
    pub file_type: String,
    pub pattern_index: usize,
}

// ---------------------------------------------------------------------------
// Tiered cache
// ---------------------------------------------------------------------------

pub struct TieredCache {
    immediate: DashMap<String, ImmediateEntry>,
    hot: DashMap<String, HotEntry>,
    max_immediate: usize,
    max_hot: usize,
    cache_dir: PathBuf,
    save_interval: Duration,
    last_save: Mutex<Instant>,
}

impl TieredCache {
    pub fn new(root: &Path, max_immediate: usize, max_hot: usize, save_interval: Duration) -> Self {
        Self {
            immediate: DashMap::new(),
            hot: DashMap::new(),
            max_immediate: max_immediate.max(1),
            max_hot: max_hot.max(1),
            cache_dir: cache_dir(root),
            save_interval,
            // Allow an early first save
            last_save: Mutex::new(Instant::now() - save_interval),
        }
    }

    pub fn immediate_len(&self) -> usize {
        self.immediate.len()
    }

    pub fn hot_len(&self) -> usize {
        self.hot.len()
    }

    /// Approximate content bytes held by a tier, for statistics.
    pub fn immediate_bytes(&self) -> u64 {
        self.immediate.iter().map(|e| e.content_preview.len() as u64).sum()
    }

    pub fn hot_bytes(&self) -> u64 {
        self.hot.iter().map(|e| e.content.len() as u64).sum()
    }

    // -----------------------------------------------------------------------
    // Inserts and promotion
    // -----------------------------------------------------------------------

    /// Insert a freshly extracted document into the immediate tier.
    pub fn insert_immediate(
        &self,
        file_path: &str,
        file_name: &str,
        file_type: &str,
        size: u64,
        content: &str,
    ) {
        let entry = ImmediateEntry {
            file_path: file_path.to_string(),
            file_name: file_name.to_string(),
            content_preview: truncate_chars(content, IMMEDIATE_PREVIEW_CHARS).to_string(),
            file_type: file_type.to_string(),
            size,
            indexed_time: now_secs(),
        };
        self.immediate.insert(file_path.to_string(), entry);

        if self.immediate.len() > self.max_immediate {
            self.evict_immediate();
        }
    }

    /// Evict the oldest 10% of immediate entries by indexed time.
    fn evict_immediate(&self) {
        let count = (self.max_immediate / 10).max(1);
        let mut by_age: Vec<(String, f64)> =
            self.immediate.iter().map(|e| (e.key().clone(), e.indexed_time)).collect();
        by_age.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        for (path, _) in by_age.into_iter().take(count) {
            self.immediate.remove(&path);
        }
        debug!(evicted = count, remaining = self.immediate.len(), "Immediate tier eviction");
    }

    /// Move a path from the immediate tier to the hot tier. If the entry was
    /// already evicted, its metadata is re-derived from the file itself so
    /// the document is not lost to the hot tier.
    pub fn promote_to_hot(&self, file_path: &str, content: &str) {
        let base = self.immediate.remove(file_path).map(|(_, e)| e);
        let (file_name, file_type, size, indexed_time) = match base {
            Some(e) => (e.file_name, e.file_type, e.size, e.indexed_time),
            None => {
                let path = Path::new(file_path);
                let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
                (file_name_of(path), file_type_of(path), size, now_secs())
            }
        };

        let entry = HotEntry {
            file_path: file_path.to_string(),
            file_name,
            content: truncate_chars(content, HOT_CONTENT_CHARS).to_string(),
            file_type,
            size,
            indexed_time,
            layer: "hot".to_string(),
            moved_from_immediate: now_secs(),
        };
        self.hot.insert(file_path.to_string(), entry);

        if self.hot.len() > self.max_hot {
            self.evict_hot_oldest();
        }
    }

    /// The durable move removes any straggling immediate entry; the hot entry
    /// stays behind as a fast-path copy of the now-durable row.
    pub fn on_durable_promotion(&self, file_path: &str) {
        self.immediate.remove(file_path);
    }

    fn evict_hot_oldest(&self) {
        let oldest = self
            .hot
            .iter()
            .min_by(|a, b| {
                a.indexed_time.partial_cmp(&b.indexed_time).unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|e| e.key().clone());
        if let Some(path) = oldest {
            self.hot.remove(&path);
        }
    }

    // -----------------------------------------------------------------------
    // Search
    // -----------------------------------------------------------------------

    /// Scan the immediate tier for entries matching the pattern set.
    pub fn search_immediate(&self, patterns: &Arc<PatternSet>, limit: usize) -> Vec<CacheHit> {
        let entries: Vec<ImmediateEntry> = self.immediate.iter().map(|e| e.value().clone()).collect();
        let hits = scan_entries(
            entries,
            Arc::clone(patterns),
            IMMEDIATE_SCAN_CHUNK_THRESHOLD,
            IMMEDIATE_SCAN_DEADLINE,
            |e, patterns| {
                let text = format!("{} {}", e.content_preview, e.file_name);
                match_index(&text, patterns).map(|idx| CacheHit {
                    file_path: e.file_path.clone(),
                    file_name: e.file_name.clone(),
                    preview: truncate_chars(&e.content_preview, RESULT_PREVIEW_CHARS).to_string(),
                    file_type: e.file_type.clone(),
                    pattern_index: idx,
                })
            },
        );
        hits.into_iter().take(limit).collect()
    }

    /// Scan the hot tier for entries matching the pattern set.
    pub fn search_hot(&self, patterns: &Arc<PatternSet>, limit: usize) -> Vec<CacheHit> {
        let entries: Vec<HotEntry> = self.hot.iter().map(|e| e.value().clone()).collect();
        let hits = scan_entries(
            entries,
            Arc::clone(patterns),
            HOT_SCAN_CHUNK_THRESHOLD,
            HOT_SCAN_DEADLINE,
            |e, patterns| {
                let text = format!("{} {}", e.content, e.file_name);
                match_index(&text, patterns).map(|idx| CacheHit {
                    file_path: e.file_path.clone(),
                    file_name: e.file_name.clone(),
                    preview: truncate_chars(&e.content, RESULT_PREVIEW_CHARS).to_string(),
                    file_type: e.file_type.clone(),
                    pattern_index: idx,
                })
            },
        );
        hits.into_iter().take(limit).collect()
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    fn hot_cache_file(&self) -> PathBuf {
        self.cache_dir.join("hot_cache.json")
    }

    /// Persist the hot tier if enough time has passed since the last save.
    pub fn maybe_save(&self) {
        let mut last = self.last_save.lock().expect("cache save lock poisoned");
        if last.elapsed() < self.save_interval {
            return;
        }
        *last = Instant::now();
        drop(last);
        self.save();
    }

    /// Persist the hot tier unconditionally (shutdown path).
    pub fn save(&self) {
        let snapshot: HashMap<String, HotEntry> =
            self.hot.iter().map(|e| (e.key().clone(), e.value().clone())).collect();

        if let Err(e) = std::fs::create_dir_all(&self.cache_dir) {
            warn!(error = %e, "Could not create cache directory");
            return;
        }
        match serde_json::to_vec(&snapshot) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(self.hot_cache_file(), bytes) {
                    warn!(error = %e, "Hot cache save failed");
                } else {
                    debug!(entries = snapshot.len(), "Hot cache saved");
                }
            }
            Err(e) => warn!(error = %e, "Hot cache serialization failed"),
        }
    }

    /// Restore the hot tier from disk, dropping expired entries. The
    /// immediate tier always starts empty; a stale immediate-tier snapshot
    /// left by older versions is deleted best-effort.
    pub fn load(&self) {
        self.immediate.clear();
        self.hot.clear();

        let stale = self.cache_dir.join("immediate_cache.json");
        if stale.exists() {
            let _ = std::fs::remove_file(stale);
        }

        let raw = match std::fs::read(self.hot_cache_file()) {
            Ok(raw) => raw,
            Err(_) => return,
        };
        let parsed: HashMap<String, HotEntry> = match serde_json::from_slice(&raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "Hot cache file unreadable, starting empty");
                return;
            }
        };

        let cutoff = now_secs() - HOT_EXPIRY_SECS;
        let mut expired = 0usize;
        for (path, entry) in parsed {
            let stamp = if entry.moved_from_immediate > 0.0 {
                entry.moved_from_immediate
            } else {
                entry.indexed_time
            };
            if stamp >= cutoff {
                self.hot.insert(path, entry);
            } else {
                expired += 1;
            }
        }
        info!(hot = self.hot.len(), expired, "Caches restored (immediate starts empty)");
    }

    /// Drop both tiers and their persistence files.
    pub fn clear(&self) {
        self.immediate.clear();
        self.hot.clear();
        for name in ["hot_cache.json", "immediate_cache.json"] {
            let _ = std::fs::remove_file(self.cache_dir.join(name));
        }
    }
}

// ---------------------------------------------------------------------------
// Chunked scanning with a drop-late-chunks deadline
// ---------------------------------------------------------------------------

/// Scan `entries` with `matcher`. Small tiers scan inline; large tiers are
/// chunked across a bounded worker pool, and chunks that miss the deadline
/// are dropped rather than blocking the query.
fn scan_entries<E, F>(
    entries: Vec<E>,
    patterns: Arc<PatternSet>,
    chunk_threshold: usize,
    deadline: Duration,
    matcher: F,
) -> Vec<CacheHit>
where
    E: Send + Sync + 'static,
    F: Fn(&E, &PatternSet) -> Option<CacheHit> + Send + Sync + Copy + 'static,
{
    if patterns.is_empty() {
        return Vec::new();
    }

    if entries.len() <= chunk_threshold {
        return entries.iter().filter_map(|e| matcher(e, &patterns)).collect();
    }

    let entries = Arc::new(entries);
    let chunk_size = (entries.len() / (SCAN_POOL * 2)).max(200);
    let ranges: Vec<(usize, usize)> = (0..entries.len())
        .step_by(chunk_size)
        .map(|start| (start, (start + chunk_size).min(entries.len())))
        .collect();
    let total_chunks = ranges.len();

    let (job_tx, job_rx) = unbounded::<(usize, usize)>();
    let (hit_tx, hit_rx) = bounded::<Vec<CacheHit>>(total_chunks);
    for range in ranges {
        let _ = job_tx.send(range);
    }
    drop(job_tx);

    for _ in 0..SCAN_POOL.min(total_chunks) {
        let job_rx = job_rx.clone();
        let hit_tx = hit_tx.clone();
        let entries = Arc::clone(&entries);
        let patterns = Arc::clone(&patterns);
        std::thread::spawn(move || {
            while let Ok((start, end)) = job_rx.recv() {
                let hits: Vec<CacheHit> =
                    entries[start..end].iter().filter_map(|e| matcher(e, &patterns)).collect();
                if hit_tx.send(hits).is_err() {
                    break;
                }
            }
        });
    }
    drop(hit_tx);

    let hard_deadline = Instant::now() + deadline;
    let mut results = Vec::new();
    let mut received = 0usize;
    while received < total_chunks {
        let remaining = hard_deadline.saturating_duration_since(Instant::now());
        match hit_rx.recv_timeout(remaining) {
            Ok(hits) => {
                results.extend(hits);
                received += 1;
            }
            Err(RecvTimeoutError::Timeout) => {
                debug!(received, total_chunks, "Dropping late cache scan chunks");
                break;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(dir: &Path) -> TieredCache {
        TieredCache::new(dir, 100, 1000, Duration::from_secs(5))
    }

    #[test]
    fn immediate_insert_and_search() {
        let dir = tempfile::tempdir().unwrap();
        let c = cache(dir.path());
        c.insert_immediate("/a/report.txt", "report.txt", ".txt", 10, "annual report content");

        let patterns = Arc::new(PatternSet::build("report"));
        let hits = c.search_immediate(&patterns, 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].file_path, "/a/report.txt");
    }

    #[test]
    fn promotion_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let c = cache(dir.path());
        c.insert_immediate("/a/x.txt", "x.txt", ".txt", 5, "some content here");
        assert_eq!(c.immediate_len(), 1);

        c.promote_to_hot("/a/x.txt", "some content here");
        assert_eq!(c.immediate_len(), 0);
        assert_eq!(c.hot_len(), 1);

        let patterns = Arc::new(PatternSet::build("content"));
        assert!(c.search_immediate(&patterns, 10).is_empty());
        assert_eq!(c.search_hot(&patterns, 10).len(), 1);
    }

    #[test]
    fn immediate_overflow_evicts_oldest_tenth() {
        let dir = tempfile::tempdir().unwrap();
        let c = TieredCache::new(dir.path(), 50, 1000, Duration::from_secs(5));
        for i in 0..51 {
            c.insert_immediate(&format!("/f/{i}.txt"), "f.txt", ".txt", 1, "body");
        }
        // 51 entries tripped eviction of max/10 = 5
        assert_eq!(c.immediate_len(), 46);
    }

    #[test]
    fn hot_persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let c = cache(dir.path());
            c.insert_immediate("/a/keep.txt", "keep.txt", ".txt", 4, "durable words");
            c.promote_to_hot("/a/keep.txt", "durable words");
            c.save();
        }
        let c2 = cache(dir.path());
        c2.load();
        assert_eq!(c2.hot_len(), 1);
        assert_eq!(c2.immediate_len(), 0);

        let patterns = Arc::new(PatternSet::build("durable"));
        assert_eq!(c2.search_hot(&patterns, 10).len(), 1);
    }

    #[test]
    fn expired_hot_entries_dropped_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let c = cache(dir.path());
        let old = HotEntry {
            file_path: "/a/old.txt".into(),
            file_name: "old.txt".into(),
            content: "ancient".into(),
            file_type: ".txt".into(),
            size: 7,
            indexed_time: now_secs() - 8.0 * 24.0 * 3600.0,
            layer: "hot".into(),
            moved_from_immediate: now_secs() - 8.0 * 24.0 * 3600.0,
        };
        c.hot.insert(old.file_path.clone(), old);
        c.save();

        let c2 = cache(dir.path());
        c2.load();
        assert_eq!(c2.hot_len(), 0);
    }

    #[test]
    fn chunked_scan_finds_matches_in_large_tier() {
        let dir = tempfile::tempdir().unwrap();
        let c = TieredCache::new(dir.path(), 10_000, 100_000, Duration::from_secs(5));
        for i in 0..2_000 {
            let body = if i == 1_234 { "needle document" } else { "haystack filler" };
            c.insert_immediate(&format!("/f/{i}.txt"), &format!("{i}.txt"), ".txt", 1, body);
        }
        let patterns = Arc::new(PatternSet::build("needle"));
        let hits = c.search_immediate(&patterns, 50);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].file_path, "/f/1234.txt");
    }

    #[test]
    fn clear_removes_tiers_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let c = cache(dir.path());
        c.insert_immediate("/a/x.txt", "x.txt", ".txt", 1, "body");
        c.promote_to_hot("/a/x.txt", "body");
        c.save();
        c.clear();
        assert_eq!(c.immediate_len(), 0);
        assert_eq!(c.hot_len(), 0);
        assert!(!dir.path().join("cache/hot_cache.json").exists());
    }
}
