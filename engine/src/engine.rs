//! The engine facade: one value owning the router, shard stores, cache
//! tiers, promotion scheduler, extractors, and counters. All entry points
//! used by a UI or CLI live here.

use crate::cache::TieredCache;
use crate::extract::ContentExtractor;
use crate::ocr::OcrBackend;
use crate::pipeline::{self, IndexerDeps, ProgressCallback};
use crate::scheduler::Promoter;
use crate::shard::{discover_shard_count, HardwareProfile};
use crate::stats::{EngineStats, StatsSnapshot};
use crate::store::ShardStore;
use crate::types::{
    data_storage_dir, EngineConfig, EngineError, EngineResult, IndexSummary, SearchHit,
    TermDocFreq,
};
use docfind_core::normalize::PatternCache;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Shard stores are opened in parallel with at most this many workers.
const SHARD_INIT_WORKERS: usize = 8;

/// Optimization runs over at most this many shards at a time.
const OPTIMIZE_WORKERS: usize = 4;

pub struct SearchEngine {
    root: PathBuf,
    config: EngineConfig,
    patterns: PatternCache,
    extractor: Arc<ContentExtractor>,
    cache: Arc<TieredCache>,
    stores: Arc<Vec<ShardStore>>,
    promoter: Arc<Promoter>,
    stats: Arc<EngineStats>,
    term_stats: Arc<TermDocFreq>,
    cancel: Arc<AtomicBool>,
    indexing_in_progress: AtomicBool,
    shutdown_requested: AtomicBool,
}

impl SearchEngine {
    /// Open an engine rooted at `root`, creating the data layout on first
    /// use. The shard count is read back from an existing data directory;
    /// only an empty directory consults the capacity heuristic (or the
    /// configured override).
    pub fn open(root: &Path, config: EngineConfig) -> EngineResult<Self> {
        Self::open_with_extractor(root, config, ContentExtractor::new())
    }

    /// Open with a custom OCR backend (tests inject a counting fake).
    pub fn open_with_ocr_backend(
        root: &Path,
        config: EngineConfig,
        backend: Box<dyn OcrBackend>,
    ) -> EngineResult<Self> {
        Self::open_with_extractor(root, config, ContentExtractor::with_ocr_backend(backend))
    }

    fn open_with_extractor(
        root: &Path,
        config: EngineConfig,
        extractor: ContentExtractor,
    ) -> EngineResult<Self> {
        let start = Instant::now();
        let data_dir = data_storage_dir(root);
        std::fs::create_dir_all(&data_dir)?;

        let shard_count = match discover_shard_count(&data_dir) {
            Some(existing) => {
                info!(shards = existing, "Using shard count from existing data directory");
                existing
            }
            None => match config.shard_count {
                Some(fixed) => fixed.clamp(crate::shard::MIN_SHARDS, crate::shard::MAX_SHARDS),
                None => {
                    let profile = HardwareProfile::detect(&data_dir);
                    let n = profile.optimal_shard_count();
                    info!(
                        cores = profile.physical_cores,
                        memory_gib = format!("{:.1}", profile.memory_gib),
                        shards = n,
                        "Shard count from capacity heuristic"
                    );
                    n
                }
            },
        };

        let stores = Arc::new(open_shards_parallel(&data_dir, shard_count)?);

        let cache = Arc::new(TieredCache::new(
            root,
            config.max_immediate_cache,
            config.max_hot_cache,
            Duration::from_millis(config.save_interval_ms),
        ));
        cache.load();

        let stats = Arc::new(EngineStats::new());
        let promoter = Arc::new(Promoter::start(
            Arc::clone(&cache),
            Arc::clone(&stores),
            Arc::clone(&stats),
            Duration::from_millis(config.hot_delay_ms),
            Duration::from_millis(config.durable_delay_ms),
        ));

        info!(
            shards = shard_count,
            hot_entries = cache.hot_len(),
            startup_ms = start.elapsed().as_millis() as u64,
            "Search engine ready"
        );

        Ok(Self {
            root: root.to_path_buf(),
            patterns: PatternCache::new(config.pattern_cache_capacity),
            config,
            extractor: Arc::new(extractor),
            cache,
            stores,
            promoter,
            stats,
            term_stats: Arc::new(TermDocFreq::new()),
            cancel: Arc::new(AtomicBool::new(false)),
            indexing_in_progress: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn shard_count(&self) -> usize {
        self.stores.len()
    }

    fn deps(&self) -> IndexerDeps {
        IndexerDeps {
            extractor: Arc::clone(&self.extractor),
            cache: Arc::clone(&self.cache),
            promoter: Arc::clone(&self.promoter),
            stats: Arc::clone(&self.stats),
            term_stats: Arc::clone(&self.term_stats),
            cancel: Arc::clone(&self.cancel),
        }
    }

    // -----------------------------------------------------------------------
    // Search
    // -----------------------------------------------------------------------

    /// Ranked three-tier search. `type_filter` is a case-insensitive path
    /// suffix, or "all".
    pub fn search(&self, query: &str, max_results: usize, type_filter: &str) -> Vec<SearchHit> {
        let query = query.trim();
        if query.is_empty() || self.shutdown_requested.load(Ordering::Acquire) {
            return Vec::new();
        }

        let start = Instant::now();
        let patterns = self.patterns.get(query);
        let results = crate::search::search(
            &patterns,
            &self.cache,
            &self.stores,
            &self.config.rank,
            &self.term_stats,
            self.indexing_in_progress.load(Ordering::Acquire),
            max_results,
            type_filter,
        );

        let immediate = results.iter().any(|h| h.layer == "immediate");
        let hot = results.iter().any(|h| h.layer == "hot");
        let complete = results.iter().any(|h| h.layer.starts_with("complete"));
        self.stats.record_search(start.elapsed(), immediate, hot, complete);

        info!(
            query,
            results = results.len(),
            ms = start.elapsed().as_millis() as u64,
            indexing = self.indexing_in_progress.load(Ordering::Acquire),
            "Search complete"
        );
        results
    }

    // -----------------------------------------------------------------------
    // Indexing
    // -----------------------------------------------------------------------

    /// Index a single file through the live path: extraction, immediate
    /// tier, then scheduled promotion to hot and durable storage.
    pub fn index_one(&self, path: &Path) -> bool {
        if self.shutdown_requested.load(Ordering::Acquire) {
            return false;
        }
        pipeline::index_file(&self.deps(), path)
    }

    /// Index a directory tree, reporting per-file progress to `on_progress`.
    pub fn index_directory(
        &self,
        directory: &Path,
        on_progress: Option<ProgressCallback>,
    ) -> EngineResult<IndexSummary> {
        if self.shutdown_requested.load(Ordering::Acquire) {
            return Err(EngineError::Shutdown);
        }
        if !directory.is_dir() {
            return Err(EngineError::InvalidInput(format!(
                "not a directory: {}",
                directory.display()
            )));
        }

        self.indexing_in_progress.store(true, Ordering::Release);
        let summary = pipeline::run(
            &self.deps(),
            directory,
            &self.config.extension_set(),
            self.config.worker_threads,
            on_progress,
        );
        self.indexing_in_progress.store(false, Ordering::Release);
        Ok(summary)
    }

    /// Request cooperative cancellation of a running `index_directory`.
    pub fn cancel_indexing(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub fn is_indexing(&self) -> bool {
        self.indexing_in_progress.load(Ordering::Acquire)
    }

    /// Promote everything still waiting in the scheduler queues, without
    /// waiting out the remaining delays.
    pub fn flush_pending(&self) {
        self.promoter.flush();
    }

    // -----------------------------------------------------------------------
    // Maintenance and lifecycle
    // -----------------------------------------------------------------------

    /// Aggregated statistics (rate-limited snapshot).
    pub fn statistics(&self) -> StatsSnapshot {
        self.stats.snapshot(&self.cache, &self.stores)
    }

    /// Drop both cache tiers and their persistence files. Durable rows are
    /// untouched.
    pub fn clear_cache(&self) {
        self.cache.clear();
        info!("Caches cleared");
    }

    /// Merge, vacuum, and analyze every shard.
    pub fn optimize(&self) -> EngineResult<()> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(OPTIMIZE_WORKERS.min(self.stores.len().max(1)))
            .build()
            .map_err(|e| EngineError::InvalidInput(e.to_string()))?;
        let errors: Vec<String> = pool.install(|| {
            use rayon::prelude::*;
            self.stores
                .par_iter()
                .filter_map(|store| {
                    store.optimize().err().map(|e| format!("shard {}: {e}", store.index()))
                })
                .collect()
        });
        self.stats.optimization_count.fetch_add(1, Ordering::Relaxed);
        if errors.is_empty() {
            info!(shards = self.stores.len(), "Optimization complete");
            Ok(())
        } else {
            warn!(failed = errors.len(), "Optimization finished with errors");
            Err(EngineError::InvalidInput(errors.join("; ")))
        }
    }

    /// Orderly shutdown: stop intake, drain the promotion scheduler, persist
    /// the hot tier synchronously, and drop the shard connections.
    pub fn shutdown(&self) {
        if self.shutdown_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.store(true, Ordering::Release);
        self.promoter.shutdown();
        self.cache.save();
        info!("Engine shut down");
    }
}

impl Drop for SearchEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Open all shards with a bounded worker pool; any shard failing to open
/// fails startup.
fn open_shards_parallel(data_dir: &Path, shard_count: usize) -> EngineResult<Vec<ShardStore>> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(SHARD_INIT_WORKERS.min(shard_count.max(1)))
        .build()
        .map_err(|e| EngineError::InvalidInput(e.to_string()))?;

    let mut opened: Vec<(usize, ShardStore)> = pool.install(|| {
        use rayon::prelude::*;
        (0..shard_count)
            .into_par_iter()
            .map(|i| ShardStore::open(data_dir, i).map(|s| (i, s)))
            .collect::<EngineResult<Vec<_>>>()
    })?;
    opened.sort_by_key(|(i, _)| *i);
    Ok(opened.into_iter().map(|(_, s)| s).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config(shards: usize) -> EngineConfig {
        EngineConfig {
            shard_count: Some(shards),
            worker_threads: Some(2),
            hot_delay_ms: 30,
            durable_delay_ms: 60,
            ..Default::default()
        }
    }

    #[test]
    fn open_creates_layout_and_reuses_shard_count() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = SearchEngine::open(dir.path(), fast_config(3)).unwrap();
            assert_eq!(engine.shard_count(), 3);
            engine.shutdown();
        }
        // Second open ignores a different configured count: disk wins
        let config = fast_config(8);
        let engine = SearchEngine::open(dir.path(), config).unwrap();
        assert_eq!(engine.shard_count(), 3);
    }

    #[test]
    fn index_one_and_search_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SearchEngine::open(dir.path(), fast_config(2)).unwrap();

        let file = dir.path().join("hello.txt");
        std::fs::write(&file, "greetings searchable world").unwrap();
        assert!(engine.index_one(&file));

        let results = engine.search("searchable", 100, "all");
        assert!(!results.is_empty());
        assert_eq!(results[0].file_name, "hello.txt");
    }

    #[test]
    fn empty_query_returns_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SearchEngine::open(dir.path(), fast_config(2)).unwrap();
        assert!(engine.search("   ", 100, "all").is_empty());
    }

    #[test]
    fn statistics_reflect_indexing() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SearchEngine::open(dir.path(), fast_config(2)).unwrap();
        let file = dir.path().join("s.txt");
        std::fs::write(&file, "statistics corpus").unwrap();
        engine.index_one(&file);
        engine.flush_pending();

        let stats = engine.statistics();
        assert_eq!(stats.indexed_files, 1);
        assert_eq!(stats.documents_total, 1);
        assert_eq!(stats.shard_count, 2);
    }
}
