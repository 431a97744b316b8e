//! Indexing pipeline: discovery, size classification, quick-start, and
//! category-scheduled parallel extraction.
//!
//! The walker produces, a bounded worker pool consumes, and the collector
//! waits on a per-file result deadline: a worker stuck inside a pathological
//! file stops being waited for, not the batch. Durable writes never block
//! this path — workers only feed the immediate tier and the promotion
//! scheduler.

use crate::cache::TieredCache;
use crate::extract::ContentExtractor;
use crate::scheduler::Promoter;
use crate::stats::EngineStats;
use crate::types::{
    file_name_of, file_type_of, now_secs, Document, IndexSummary, SizeCategory, TermDocFreq,
    NAME_ONLY_THRESHOLD,
};
use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use ignore::WalkBuilder;
use rayon::prelude::*;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// First files handed to the extractors before bulk scheduling begins.
const QUICK_START_BATCH: usize = 20;

/// How long the quick-start batch waits on the walker before running with
/// whatever has been discovered so far.
const QUICK_START_WINDOW: Duration = Duration::from_millis(100);

/// Size classification parallelizes past this many files.
const PARALLEL_CLASSIFY_THRESHOLD: usize = 5000;

/// Per-file result deadlines by category.
const LIGHT_TIMEOUT: Duration = Duration::from_secs(5);
const MEDIUM_TIMEOUT: Duration = Duration::from_secs(10);
const NAME_ONLY_TIMEOUT: Duration = Duration::from_secs(3);
const HEAVY_TIMEOUT: Duration = Duration::from_secs(180);

/// Progress observer: path, category, success.
pub type ProgressCallback = Arc<dyn Fn(&str, SizeCategory, bool) + Send + Sync>;

/// Everything a detached worker needs, shared by reference counting.
#[derive(Clone)]
pub struct IndexerDeps {
    pub extractor: Arc<ContentExtractor>,
    pub cache: Arc<TieredCache>,
    pub promoter: Arc<Promoter>,
    pub stats: Arc<EngineStats>,
    pub term_stats: Arc<TermDocFreq>,
    pub cancel: Arc<AtomicBool>,
}

#[derive(Debug, Clone)]
struct FileJob {
    path: PathBuf,
    size: u64,
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// System cruft that never gets indexed.
fn is_junk_name(name: &str) -> bool {
    name.starts_with("._")
        || name == ".DS_Store"
        || name == "Thumbs.db"
        || name == "desktop.ini"
}

/// Walk `root`, streaming files with accepted extensions into `tx` as they
/// are found. Hidden (dot-prefixed) directories and macOS/Windows metadata
/// files are skipped. The walk stops early when `cancel` is raised.
fn discover_into(
    root: &Path,
    extensions: &HashSet<String>,
    cancel: &Arc<AtomicBool>,
    tx: Sender<PathBuf>,
) {
    let walker = WalkBuilder::new(root)
        .hidden(true)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .threads(rayon::current_num_threads().min(8))
        .build_parallel();

    walker.run(|| {
        let tx = tx.clone();
        let cancel = Arc::clone(cancel);
        Box::new(move |entry| {
            if cancel.load(Ordering::Acquire) {
                return ignore::WalkState::Quit;
            }
            let entry = match entry {
                Ok(e) => e,
                Err(_) => return ignore::WalkState::Continue,
            };
            if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                return ignore::WalkState::Continue;
            }
            let path = entry.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if is_junk_name(name) {
                return ignore::WalkState::Continue;
            }
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_lowercase())
                .unwrap_or_default();
            if !extensions.contains(&ext) {
                return ignore::WalkState::Continue;
            }
            if tx.send(path.to_path_buf()).is_err() {
                return ignore::WalkState::Quit;
            }
            ignore::WalkState::Continue
        })
    });
}

/// Collected (non-streaming) discovery over a tree.
pub fn discover_files(root: &Path, extensions: &HashSet<String>) -> Vec<PathBuf> {
    let (tx, rx) = unbounded();
    discover_into(root, extensions, &Arc::new(AtomicBool::new(false)), tx);
    rx.try_iter().collect()
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

fn classify(paths: Vec<PathBuf>) -> (Vec<FileJob>, Vec<FileJob>, Vec<FileJob>) {
    let stat = |path: PathBuf| -> FileJob {
        let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        FileJob { path, size }
    };

    let jobs: Vec<FileJob> = if paths.len() > PARALLEL_CLASSIFY_THRESHOLD {
        paths.into_par_iter().map(stat).collect()
    } else {
        paths.into_iter().map(stat).collect()
    };

    let mut light = Vec::new();
    let mut medium = Vec::new();
    let mut heavy = Vec::new();
    for job in jobs {
        match SizeCategory::of(job.size) {
            SizeCategory::Light => light.push(job),
            SizeCategory::Medium => medium.push(job),
            SizeCategory::Heavy => heavy.push(job),
        }
    }
    (light, medium, heavy)
}

// ---------------------------------------------------------------------------
// Worker sizing
// ---------------------------------------------------------------------------

/// Extraction pool size from physical cores, load, and free memory, clamped
/// to [2, 16]. A configured fixed count bypasses this for reproducible runs.
pub fn optimal_threads(fixed: Option<usize>) -> usize {
    if let Some(n) = fixed {
        return n.clamp(1, 64);
    }

    let mut sys = sysinfo::System::new();
    sys.refresh_cpu();
    sys.refresh_memory();
    let physical = sys.physical_core_count().unwrap_or(4).max(1);
    let load_per_core = sysinfo::System::load_average().one / physical as f64;
    let available_gib = sys.available_memory() as f64 / (1024.0 * 1024.0 * 1024.0);

    let base = match physical {
        c if c >= 16 => 16,
        c if c >= 12 => 12,
        c if c >= 8 => 10,
        c if c >= 6 => 8,
        c if c >= 4 => 6,
        c => c.max(2),
    };
    let mut threads = base;
    if load_per_core > 0.5 {
        threads = threads.saturating_sub(threads / 3);
    }
    if available_gib < 2.0 {
        threads = threads.saturating_sub(threads / 4);
    }
    threads.clamp(2, 16)
}

fn category_workers(category: SizeCategory, base: usize) -> usize {
    match category {
        SizeCategory::Light => (base * 2).clamp(2, 16),
        SizeCategory::Medium => base.clamp(2, 8),
        SizeCategory::Heavy => base.min(2).max(1),
    }
}

fn category_timeout(category: SizeCategory, size: u64) -> Duration {
    if size >= NAME_ONLY_THRESHOLD && category != SizeCategory::Heavy {
        return NAME_ONLY_TIMEOUT;
    }
    match category {
        SizeCategory::Light => LIGHT_TIMEOUT,
        SizeCategory::Medium => MEDIUM_TIMEOUT,
        SizeCategory::Heavy => HEAVY_TIMEOUT,
    }
}

// ---------------------------------------------------------------------------
// Per-file indexing
// ---------------------------------------------------------------------------

/// Index a single file: extract, insert into the immediate tier, schedule
/// both promotions. Returns whether the file entered the index.
pub fn index_file(deps: &IndexerDeps, path: &Path) -> bool {
    if deps.cancel.load(Ordering::Acquire) {
        return false;
    }
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    if is_junk_name(name) {
        debug!(path = %path.display(), "System file skipped");
        return false;
    }
    let Ok(meta) = std::fs::metadata(path) else {
        warn!(path = %path.display(), "File vanished before indexing");
        return false;
    };

    let size = meta.len();
    let Some(content) = deps.extractor.extract_for_index(path, size) else {
        return false;
    };

    let file_path = path.to_string_lossy().into_owned();
    let file_name = file_name_of(path);
    let file_type = file_type_of(path);
    let hash = format!("{:x}", md5::compute(content.as_bytes()));
    let modified_time = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);

    deps.cache.insert_immediate(&file_path, &file_name, &file_type, size, &content);
    deps.term_stats.record(&file_name, &content);

    deps.promoter.schedule(Document {
        file_path,
        file_name,
        content: Arc::from(content),
        file_type,
        size,
        modified_time,
        indexed_time: now_secs(),
        hash,
    });

    deps.stats.indexed_files.fetch_add(1, Ordering::Relaxed);
    true
}

// ---------------------------------------------------------------------------
// Batch execution
// ---------------------------------------------------------------------------

/// Run one category batch over a worker pool. The collector enforces the
/// per-file deadline; when a result is overdue the remaining queue is
/// abandoned for this batch rather than stalling the run.
fn process_batch(
    deps: &IndexerDeps,
    jobs: Vec<FileJob>,
    category: SizeCategory,
    workers: usize,
    progress: Option<&ProgressCallback>,
) -> usize {
    if jobs.is_empty() {
        return 0;
    }
    let expected = jobs.len();
    // A batch of pure name-only files answers on the short deadline
    let timeout = jobs
        .iter()
        .map(|j| category_timeout(category, j.size))
        .max()
        .unwrap_or(LIGHT_TIMEOUT);
    let (job_tx, job_rx) = unbounded::<FileJob>();
    let (done_tx, done_rx) = unbounded::<(PathBuf, u64, bool)>();
    for job in jobs {
        let _ = job_tx.send(job);
    }
    drop(job_tx);

    for _ in 0..workers.min(expected) {
        let deps = deps.clone();
        let job_rx = job_rx.clone();
        let done_tx = done_tx.clone();
        std::thread::spawn(move || {
            while let Ok(job) = job_rx.recv() {
                if deps.cancel.load(Ordering::Acquire) {
                    break;
                }
                let ok = index_file(&deps, &job.path);
                if done_tx.send((job.path, job.size, ok)).is_err() {
                    break;
                }
            }
        });
    }
    drop(done_tx);

    let mut successful = 0usize;
    let mut received = 0usize;
    while received < expected {
        if deps.cancel.load(Ordering::Acquire) {
            break;
        }
        match done_rx.recv_timeout(timeout) {
            Ok((path, _size, ok)) => {
                received += 1;
                if ok {
                    successful += 1;
                } else {
                    deps.stats.error_count.fetch_add(1, Ordering::Relaxed);
                }
                if let Some(cb) = progress {
                    cb(&path.to_string_lossy(), category, ok);
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                let dropped: Vec<FileJob> = job_rx.try_iter().collect();
                warn!(
                    category = category.label(),
                    outstanding = expected - received,
                    dropped = dropped.len(),
                    "Batch deadline exceeded, abandoning stragglers"
                );
                break;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    successful
}

// ---------------------------------------------------------------------------
// Directory run
// ---------------------------------------------------------------------------

/// Index a whole directory tree.
pub fn run(
    deps: &IndexerDeps,
    root: &Path,
    extensions: &HashSet<String>,
    fixed_workers: Option<usize>,
    progress: Option<ProgressCallback>,
) -> IndexSummary {
    let start = Instant::now();
    deps.cancel.store(false, Ordering::Release);

    // The walker streams discoveries while extraction is already running.
    let (path_tx, path_rx) = unbounded::<PathBuf>();
    let walker = {
        let root = root.to_path_buf();
        let extensions = extensions.clone();
        let cancel = Arc::clone(&deps.cancel);
        std::thread::spawn(move || discover_into(&root, &extensions, &cancel, path_tx))
    };

    // Quick-start: whatever the walker surfaces inside the first window is
    // indexed right away, so queries have something to hit while the rest of
    // the tree is still being discovered.
    let quick_deadline = Instant::now() + QUICK_START_WINDOW;
    let mut quick: Vec<FileJob> = Vec::new();
    while quick.len() < QUICK_START_BATCH {
        let remaining = quick_deadline.saturating_duration_since(Instant::now());
        match path_rx.recv_timeout(remaining) {
            Ok(path) => {
                let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                quick.push(FileJob { path, size });
            }
            Err(_) => break,
        }
    }

    let base_workers = optimal_threads(fixed_workers);
    let quick_count = quick.len();
    let mut successful = process_batch(
        deps,
        quick,
        SizeCategory::Light,
        category_workers(SizeCategory::Light, base_workers),
        progress.as_ref(),
    );

    // The walker kept filling the channel while the quick batch ran
    let rest: Vec<PathBuf> = path_rx.iter().collect();
    let _ = walker.join();
    let total_files = quick_count + rest.len();
    info!(root = %root.display(), files = total_files, "Discovery complete");
    if total_files == 0 {
        return IndexSummary { duration_secs: start.elapsed().as_secs_f64(), ..Default::default() };
    }

    let (light, medium, heavy) = classify(rest);
    info!(
        quick = quick_count,
        light = light.len(),
        medium = medium.len(),
        heavy = heavy.len(),
        workers = base_workers,
        "Classified by size"
    );

    for (category, jobs) in [
        (SizeCategory::Light, light),
        (SizeCategory::Medium, medium),
        (SizeCategory::Heavy, heavy),
    ] {
        if deps.cancel.load(Ordering::Acquire) {
            break;
        }
        let workers = category_workers(category, base_workers);
        successful += process_batch(deps, jobs, category, workers, progress.as_ref());
    }

    let cancelled = deps.cancel.load(Ordering::Acquire);
    let duration = start.elapsed();
    let summary = IndexSummary {
        total_files,
        successful,
        errors: total_files.saturating_sub(successful),
        cancelled,
        duration_secs: duration.as_secs_f64(),
        files_per_second: if duration.as_secs_f64() > 0.0 {
            successful as f64 / duration.as_secs_f64()
        } else {
            0.0
        },
    };
    info!(
        total = summary.total_files,
        ok = summary.successful,
        errors = summary.errors,
        cancelled = summary.cancelled,
        per_second = format!("{:.1}", summary.files_per_second),
        "Indexing finished"
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ShardStore;
    use crate::types::EngineConfig;
    use std::sync::atomic::AtomicUsize;

    fn deps(dir: &Path) -> IndexerDeps {
        let cache = Arc::new(TieredCache::new(dir, 1000, 1000, Duration::from_secs(60)));
        let stores: Arc<Vec<ShardStore>> = Arc::new(
            (0..2).map(|i| ShardStore::open(&dir.join("data_storage"), i).unwrap()).collect(),
        );
        let stats = Arc::new(EngineStats::new());
        let promoter = Promoter::start(
            Arc::clone(&cache),
            stores,
            Arc::clone(&stats),
            Duration::from_millis(20),
            Duration::from_millis(40),
        );
        IndexerDeps {
            extractor: Arc::new(ContentExtractor::new()),
            cache,
            promoter: Arc::new(promoter),
            stats,
            term_stats: Arc::new(TermDocFreq::new()),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    #[test]
    fn discovery_skips_junk_and_hidden() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keep.txt"), "body").unwrap();
        std::fs::write(dir.path().join("._keep.txt"), "resource fork").unwrap();
        std::fs::write(dir.path().join(".DS_Store"), "junk").unwrap();
        std::fs::create_dir(dir.path().join(".hidden")).unwrap();
        std::fs::write(dir.path().join(".hidden/inside.txt"), "hidden body").unwrap();
        std::fs::write(dir.path().join("skip.exe"), "binary").unwrap();

        let exts = EngineConfig::default().extension_set();
        let found = discover_files(dir.path(), &exts);
        let names: Vec<String> =
            found.iter().map(|p| p.file_name().unwrap().to_string_lossy().into_owned()).collect();
        assert_eq!(names, vec!["keep.txt".to_string()]);
    }

    #[test]
    fn index_file_feeds_immediate_tier() {
        let dir = tempfile::tempdir().unwrap();
        let d = deps(dir.path());
        let file = dir.path().join("note.txt");
        std::fs::write(&file, "searchable body text").unwrap();

        assert!(index_file(&d, &file));
        assert_eq!(d.cache.immediate_len(), 1);
        assert_eq!(d.stats.indexed_files.load(Ordering::Relaxed), 1);
        d.promoter.shutdown();
    }

    #[test]
    fn run_indexes_a_small_tree() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("docs");
        std::fs::create_dir_all(tree.join("sub")).unwrap();
        for i in 0..10 {
            std::fs::write(tree.join(format!("f{i}.txt")), format!("document body {i}")).unwrap();
        }
        std::fs::write(tree.join("sub/deep.txt"), "nested document").unwrap();

        let d = deps(dir.path());
        let exts = EngineConfig::default().extension_set();
        let summary = run(&d, &tree, &exts, Some(2), None);

        assert_eq!(summary.total_files, 11);
        assert_eq!(summary.successful, 11);
        assert!(!summary.cancelled);
        assert_eq!(d.cache.immediate_len(), 11);
        d.promoter.shutdown();
    }

    #[test]
    fn cancellation_truncates_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("docs");
        std::fs::create_dir_all(&tree).unwrap();
        for i in 0..5 {
            std::fs::write(tree.join(format!("f{i}.txt")), "body").unwrap();
        }

        let d = deps(dir.path());
        d.cancel.store(true, Ordering::Release);
        // run() resets the flag, so re-set it through the progress callback
        let cancel = Arc::clone(&d.cancel);
        let progress: ProgressCallback =
            Arc::new(move |_, _, _| cancel.store(true, Ordering::Release));
        let exts = EngineConfig::default().extension_set();
        let summary = run(&d, &tree, &exts, Some(2), Some(progress));
        assert!(summary.cancelled);
        assert!(summary.successful <= summary.total_files);
        d.promoter.shutdown();
    }

    #[test]
    fn progress_callback_sees_every_file() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("docs");
        std::fs::create_dir_all(&tree).unwrap();
        for i in 0..4 {
            std::fs::write(tree.join(format!("f{i}.txt")), format!("body {i}")).unwrap();
        }

        let d = deps(dir.path());
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = Arc::clone(&seen);
        let progress: ProgressCallback = Arc::new(move |_, _, _| {
            seen_cb.fetch_add(1, Ordering::SeqCst);
        });
        let exts = EngineConfig::default().extension_set();
        run(&d, &tree, &exts, Some(2), Some(progress));
        assert_eq!(seen.load(Ordering::SeqCst), 4);
        d.promoter.shutdown();
    }
}
