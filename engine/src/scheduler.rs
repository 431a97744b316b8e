//! Deferred tier promotion.
//!
//! A single scheduler thread owns two FIFO queues of deadlines: one for
//! immediate→hot moves (~1 s after extraction) and one for →durable moves
//! (~5 s). Delays are constant per run, so the queues stay sorted without a
//! heap. Due durable entries are drained together and grouped by shard so
//! the stores see batched transactions instead of row-at-a-time writes.

use crate::cache::TieredCache;
use crate::shard::shard_index;
use crate::stats::EngineStats;
use crate::store::ShardStore;
use crate::types::Document;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Idle wake-up interval when both queues are empty.
const IDLE_TICK: Duration = Duration::from_millis(500);

struct Queues {
    hot: VecDeque<(Instant, String, Arc<str>)>,
    durable: VecDeque<(Instant, Document)>,
}

struct Inner {
    queues: Mutex<Queues>,
    wakeup: Condvar,
    shutdown: AtomicBool,
    cache: Arc<TieredCache>,
    stores: Arc<Vec<ShardStore>>,
    stats: Arc<EngineStats>,
    hot_delay: Duration,
    durable_delay: Duration,
}

/// Handle to the promotion scheduler thread.
pub struct Promoter {
    inner: Arc<Inner>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Promoter {
    pub fn start(
        cache: Arc<TieredCache>,
        stores: Arc<Vec<ShardStore>>,
        stats: Arc<EngineStats>,
        hot_delay: Duration,
        durable_delay: Duration,
    ) -> Self {
        let inner = Arc::new(Inner {
            queues: Mutex::new(Queues { hot: VecDeque::new(), durable: VecDeque::new() }),
            wakeup: Condvar::new(),
            shutdown: AtomicBool::new(false),
            cache,
            stores,
            stats,
            hot_delay,
            durable_delay,
        });

        let thread_inner = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name("docfind-promoter".to_string())
            .spawn(move || run(thread_inner))
            .expect("failed to spawn promoter thread");

        Self { inner, handle: Mutex::new(Some(handle)) }
    }

    /// Schedule both promotions for a freshly indexed document.
    pub fn schedule(&self, doc: Document) {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return;
        }
        let now = Instant::now();
        {
            let mut queues = self.inner.queues.lock().expect("promoter queues poisoned");
            queues.hot.push_back((
                now + self.inner.hot_delay,
                doc.file_path.clone(),
                Arc::clone(&doc.content),
            ));
            queues.durable.push_back((now + self.inner.durable_delay, doc));
        }
        self.inner.wakeup.notify_one();
    }

    /// Number of documents still waiting for their durable move.
    pub fn pending_durable(&self) -> usize {
        self.inner.queues.lock().expect("promoter queues poisoned").durable.len()
    }

    /// Promote everything currently queued, ignoring remaining delays. Used
    /// at the end of an indexing run and during shutdown so no accepted
    /// document is left stranded in the volatile tier.
    pub fn flush(&self) {
        let (hot, durable) = {
            let mut queues = self.inner.queues.lock().expect("promoter queues poisoned");
            (std::mem::take(&mut queues.hot), std::mem::take(&mut queues.durable))
        };
        process_hot(&self.inner, hot.into_iter().map(|(_, p, c)| (p, c)).collect());
        process_durable(&self.inner, durable.into_iter().map(|(_, d)| d).collect());
    }

    /// Stop the scheduler: flush outstanding promotions and join the thread.
    /// Bounded by one final bulk write pass.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.wakeup.notify_all();
        let handle = self.handle.lock().expect("promoter handle poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler loop
// ---------------------------------------------------------------------------

fn run(inner: Arc<Inner>) {
    loop {
        let (due_hot, due_durable) = {
            let mut queues = inner.queues.lock().expect("promoter queues poisoned");

            if inner.shutdown.load(Ordering::Acquire) {
                // Final drain: everything still queued promotes now.
                let hot = std::mem::take(&mut queues.hot);
                let durable = std::mem::take(&mut queues.durable);
                drop(queues);
                process_hot(&inner, hot.into_iter().map(|(_, p, c)| (p, c)).collect());
                process_durable(&inner, durable.into_iter().map(|(_, d)| d).collect());
                return;
            }

            let now = Instant::now();
            let next_deadline = [queues.hot.front().map(|e| e.0), queues.durable.front().map(|e| e.0)]
                .into_iter()
                .flatten()
                .min();

            match next_deadline {
                Some(deadline) if deadline > now => {
                    let wait = deadline.saturating_duration_since(now);
                    let (q, _) = inner
                        .wakeup
                        .wait_timeout(queues, wait)
                        .expect("promoter queues poisoned");
                    queues = q;
                }
                None => {
                    let (q, _) = inner
                        .wakeup
                        .wait_timeout(queues, IDLE_TICK)
                        .expect("promoter queues poisoned");
                    queues = q;
                }
                _ => {}
            }

            let now = Instant::now();
            let mut due_hot = Vec::new();
            while queues.hot.front().is_some_and(|e| e.0 <= now) {
                let (_, path, content) = queues.hot.pop_front().expect("front checked");
                due_hot.push((path, content));
            }
            let mut due_durable = Vec::new();
            while queues.durable.front().is_some_and(|e| e.0 <= now) {
                let (_, doc) = queues.durable.pop_front().expect("front checked");
                due_durable.push(doc);
            }
            (due_hot, due_durable)
        };

        process_hot(&inner, due_hot);
        let wrote = !due_durable.is_empty();
        process_durable(&inner, due_durable);
        if wrote {
            inner.cache.maybe_save();
        }
    }
}

fn process_hot(inner: &Inner, moves: Vec<(String, Arc<str>)>) {
    for (path, content) in moves {
        inner.cache.promote_to_hot(&path, &content);
    }
}

/// Group due documents by shard and push each group in one batched
/// transaction. This grouping is the pipeline's main throughput lever.
fn process_durable(inner: &Inner, docs: Vec<Document>) {
    if docs.is_empty() {
        return;
    }
    let shard_count = inner.stores.len();
    let mut groups: HashMap<usize, Vec<Document>> = HashMap::new();
    for doc in docs {
        groups.entry(shard_index(&doc.file_path, shard_count)).or_default().push(doc);
    }

    for (shard, group) in groups {
        let store = &inner.stores[shard];
        let result = if group.len() > 1 {
            store.bulk_upsert(&group).map(|_| ())
        } else {
            store.upsert(&group[0])
        };
        match result {
            Ok(()) => {
                inner.stats.durable_writes.fetch_add(group.len() as u64, Ordering::Relaxed);
                for doc in &group {
                    inner.cache.on_durable_promotion(&doc.file_path);
                }
                debug!(shard, batch = group.len(), "Durable promotion");
            }
            Err(e) => {
                inner.stats.durable_failures.fetch_add(group.len() as u64, Ordering::Relaxed);
                warn!(shard, batch = group.len(), error = %e, "Durable promotion failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::now_secs;

    fn doc(path: &str, content: &str) -> Document {
        Document {
            file_path: path.to_string(),
            file_name: path.rsplit('/').next().unwrap_or(path).to_string(),
            content: Arc::from(content),
            file_type: ".txt".to_string(),
            size: content.len() as u64,
            modified_time: now_secs(),
            indexed_time: now_secs(),
            hash: format!("{:x}", md5::compute(content.as_bytes())),
        }
    }

    fn fixture(dir: &std::path::Path, shards: usize) -> (Arc<TieredCache>, Arc<Vec<ShardStore>>) {
        let cache = Arc::new(TieredCache::new(dir, 1000, 1000, Duration::from_secs(60)));
        let stores: Vec<ShardStore> = (0..shards)
            .map(|i| ShardStore::open(&dir.join("data_storage"), i).expect("shard opens"))
            .collect();
        (cache, Arc::new(stores))
    }

    #[test]
    fn promotes_through_hot_to_durable() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, stores) = fixture(dir.path(), 2);
        let stats = Arc::new(EngineStats::new());
        let promoter = Promoter::start(
            Arc::clone(&cache),
            Arc::clone(&stores),
            Arc::clone(&stats),
            Duration::from_millis(30),
            Duration::from_millis(80),
        );

        let d = doc("/docs/a.txt", "text to persist");
        cache.insert_immediate(&d.file_path, &d.file_name, &d.file_type, d.size, &d.content);
        promoter.schedule(d.clone());

        std::thread::sleep(Duration::from_millis(300));

        assert_eq!(cache.immediate_len(), 0, "entry left the immediate tier");
        assert_eq!(cache.hot_len(), 1, "entry reached the hot tier");
        let shard = shard_index(&d.file_path, 2);
        assert_eq!(stores[shard].stats().document_count, 1, "row reached its shard");
        assert_eq!(stats.durable_writes.load(Ordering::Relaxed), 1);
        promoter.shutdown();
    }

    #[test]
    fn shutdown_flushes_pending_documents() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, stores) = fixture(dir.path(), 2);
        let stats = Arc::new(EngineStats::new());
        let promoter = Promoter::start(
            Arc::clone(&cache),
            Arc::clone(&stores),
            stats,
            Duration::from_secs(60),
            Duration::from_secs(60),
        );

        for i in 0..5 {
            promoter.schedule(doc(&format!("/docs/f{i}.txt"), "pending content"));
        }
        promoter.shutdown();

        let total: u64 = stores.iter().map(|s| s.stats().document_count).sum();
        assert_eq!(total, 5, "shutdown drained the durable queue");
    }

    #[test]
    fn flush_groups_by_shard() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, stores) = fixture(dir.path(), 4);
        let stats = Arc::new(EngineStats::new());
        let promoter = Promoter::start(
            cache,
            Arc::clone(&stores),
            Arc::clone(&stats),
            Duration::from_secs(60),
            Duration::from_secs(60),
        );

        for i in 0..40 {
            promoter.schedule(doc(&format!("/bulk/file_{i}.txt"), &format!("bulk body {i}")));
        }
        promoter.flush();
        let total: u64 = stores.iter().map(|s| s.stats().document_count).sum();
        assert_eq!(total, 40);
        assert_eq!(stats.durable_writes.load(Ordering::Relaxed), 40);
        promoter.shutdown();
    }
}
