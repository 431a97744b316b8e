//! Shared types for the docfind engine: documents, cache entries, search
//! results, indexing summaries, runtime configuration, and the error enum.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Files at or above this size are rejected outright.
pub const MAX_FILE_SIZE: u64 = 500 * 1024 * 1024;

/// Files at or above this size index as name-only (extractor bypassed).
pub const NAME_ONLY_THRESHOLD: u64 = 3 * 1024 * 1024;

/// Immediate-tier entries carry a preview of this many characters.
pub const IMMEDIATE_PREVIEW_CHARS: usize = 500;

/// Hot-tier entries carry up to this many characters of content.
pub const HOT_CONTENT_CHARS: usize = 10_000;

/// Search results carry a preview of this many characters.
pub const RESULT_PREVIEW_CHARS: usize = 200;

/// Extensions accepted by default when indexing a directory.
pub const DEFAULT_EXTENSIONS: &[&str] = &[
    "txt", "docx", "xlsx", "pdf", "tif", "tiff", "doc", "xls", "ppt", "pptx", "dot", "dotx",
    "dotm", "docm", "xlt", "xltx", "xltm", "xlsm", "xlsb", "zip", "jwc", "dxf", "sfc", "jww",
    "dwg", "dwt", "mpp", "mpz",
];

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

/// A document headed for (or read back from) a shard store. The content is
/// shared because the same text is referenced by both promotion queues.
#[derive(Debug, Clone)]
pub struct Document {
    pub file_path: String,
    pub file_name: String,
    pub content: Arc<str>,
    pub file_type: String,
    pub size: u64,
    pub modified_time: f64,
    pub indexed_time: f64,
    pub hash: String,
}

/// Derive the content-type tag from a path (lowercased extension with dot,
/// matching the on-disk rows of previous versions).
pub fn file_type_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_lowercase()))
        .unwrap_or_default()
}

/// Base name of a path as stored in document rows.
pub fn file_name_of(path: &Path) -> String {
    path.file_name().and_then(|n| n.to_str()).unwrap_or("").to_string()
}

// ---------------------------------------------------------------------------
// Cache entries
// ---------------------------------------------------------------------------

/// Immediate-tier entry: serves queries within one scheduling quantum of
/// extraction, before any durable write.
#[derive(Debug, Clone)]
pub struct ImmediateEntry {
    pub file_path: String,
    pub file_name: String,
    pub content_preview: String,
    pub file_type: String,
    pub size: u64,
    pub indexed_time: f64,
}

/// Hot-tier entry: mid-lived, persisted across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotEntry {
    pub file_path: String,
    pub file_name: String,
    pub content: String,
    pub file_type: String,
    pub size: u64,
    pub indexed_time: f64,
    /// Fixed tier tag kept for file-format compatibility.
    #[serde(default = "hot_layer_tag")]
    pub layer: String,
    pub moved_from_immediate: f64,
}

fn hot_layer_tag() -> String {
    "hot".to_string()
}

// ---------------------------------------------------------------------------
// Search results
// ---------------------------------------------------------------------------

/// One ranked search result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub file_path: String,
    pub file_name: String,
    pub content_preview: String,
    pub file_type: String,
    /// Source tier: `immediate`, `hot`, or `complete:<shard>`.
    pub layer: String,
    pub relevance_score: f64,
}

impl SearchHit {
    /// Coarse dedup priority: durable rows beat immediate beat hot.
    pub fn tier_priority(&self) -> u32 {
        if self.layer.starts_with("complete") {
            1000
        } else if self.layer == "immediate" {
            100
        } else if self.layer == "hot" {
            10
        } else {
            1
        }
    }
}

// ---------------------------------------------------------------------------
// Indexing
// ---------------------------------------------------------------------------

/// Size category driving worker budgets and result deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeCategory {
    Light,
    Medium,
    Heavy,
}

impl SizeCategory {
    pub fn of(size: u64) -> Self {
        if size < 10 * 1024 * 1024 {
            Self::Light
        } else if size <= 100 * 1024 * 1024 {
            Self::Medium
        } else {
            Self::Heavy
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Medium => "medium",
            Self::Heavy => "heavy",
        }
    }
}

/// Outcome of an `index_directory` run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexSummary {
    pub total_files: usize,
    pub successful: usize,
    pub errors: usize,
    pub cancelled: bool,
    pub duration_secs: f64,
    pub files_per_second: f64,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Ranking constants gathered in one place so tuning does not scatter magic
/// numbers across the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RankWeights {
    pub immediate_base: f64,
    pub hot_base: f64,
    pub pattern_priority: f64,
    pub phrase_bonus: f64,
    pub prefix_bonus: f64,
    pub bareword_bonus: f64,
    pub like_bonus: f64,
    pub exact_cache_bonus: f64,
    pub exact_fts_bonus: f64,
    pub strictness_penalty: f64,
    pub tfidf_weight: f64,
    pub position_weight: f64,
    pub filetype_weight: f64,
}

impl Default for RankWeights {
    fn default() -> Self {
        Self {
            immediate_base: 1.0,
            hot_base: 0.8,
            pattern_priority: 0.1,
            phrase_bonus: 2.0,
            prefix_bonus: 1.0,
            bareword_bonus: 0.5,
            like_bonus: 1.5,
            exact_cache_bonus: 2.0,
            exact_fts_bonus: 3.0,
            strictness_penalty: 1.0,
            tfidf_weight: 0.8,
            position_weight: 1.2,
            filetype_weight: 0.5,
        }
    }
}

impl RankWeights {
    /// File-type preference multiplier applied (scaled) to every hit.
    pub fn filetype_factor(file_type: &str) -> f64 {
        match file_type.trim_start_matches('.') {
            "txt" | "md" => 1.5,
            "doc" | "docx" | "dot" | "dotx" | "dotm" | "docm" => 1.3,
            "pdf" => 1.2,
            "xls" | "xlsx" | "xlt" | "xltx" | "xltm" | "xlsm" | "xlsb" => 1.1,
            "tif" | "tiff" => 0.9,
            _ => 1.0,
        }
    }
}

/// Engine configuration. Defaults match the shipping behavior; a
/// `docfind.toml` next to the data root overrides individual fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Fixed shard count (skips the capacity heuristic). The on-disk count
    /// always wins once shards exist.
    pub shard_count: Option<usize>,
    /// Fixed extraction pool size (skips the load heuristic).
    pub worker_threads: Option<usize>,
    pub max_immediate_cache: usize,
    pub max_hot_cache: usize,
    /// Delay before an immediate-tier entry moves to the hot tier.
    pub hot_delay_ms: u64,
    /// Delay before a document is promoted to its durable shard.
    pub durable_delay_ms: u64,
    /// Minimum interval between hot-tier persistence runs.
    pub save_interval_ms: u64,
    /// Accepted extensions (no dots). Empty means the default set.
    pub extensions: Vec<String>,
    pub pattern_cache_capacity: usize,
    pub rank: RankWeights,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shard_count: None,
            worker_threads: None,
            max_immediate_cache: 150_000,
            max_hot_cache: 1_500_000,
            hot_delay_ms: 1_000,
            durable_delay_ms: 5_000,
            save_interval_ms: 5_000,
            extensions: Vec::new(),
            pattern_cache_capacity: 1000,
            rank: RankWeights::default(),
        }
    }
}

impl EngineConfig {
    /// Load `docfind.toml` from the given root, falling back to defaults for
    /// a missing file and keeping defaults for any unparsable content.
    pub fn load(root: &Path) -> Self {
        let path = root.join("docfind.toml");
        match std::fs::read_to_string(&path) {
            Ok(raw) => match toml::from_str(&raw) {
                Ok(cfg) => cfg,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Ignoring invalid config");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Accepted extension set, lowercased and dot-free.
    pub fn extension_set(&self) -> std::collections::HashSet<String> {
        let source: Vec<String> = if self.extensions.is_empty() {
            DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect()
        } else {
            self.extensions.clone()
        };
        source.into_iter().map(|e| e.trim_start_matches('.').to_lowercase()).collect()
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by the public engine API. Per-file trouble inside the
/// pipeline never reaches this type; it is counted and logged instead.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("cache persistence error: {0}")]
    Persistence(#[from] serde_json::Error),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("engine is shut down")]
    Shutdown,
}

/// Convenience alias used across the engine.
pub type EngineResult<T> = Result<T, EngineError>;

// ---------------------------------------------------------------------------
// Term statistics
// ---------------------------------------------------------------------------

/// Per-term document frequency feeding the IDF-weighted ranking term.
/// Rebuilt as documents are indexed; an empty table simply mutes the term.
#[derive(Debug, Default)]
pub struct TermDocFreq {
    total_docs: std::sync::atomic::AtomicU64,
    freq: dashmap::DashMap<String, u64>,
}

/// Only this many distinct terms per document feed the frequency table.
const MAX_TERMS_PER_DOC: usize = 512;

impl TermDocFreq {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one document's distinct terms.
    pub fn record(&self, file_name: &str, content: &str) {
        let mut seen = std::collections::HashSet::new();
        let words = file_name.split_whitespace().chain(content.split_whitespace());
        for word in words {
            let term: String = word
                .chars()
                .filter(|c| c.is_alphanumeric())
                .flat_map(char::to_lowercase)
                .collect();
            if term.is_empty() || !seen.insert(term.clone()) {
                continue;
            }
            *self.freq.entry(term).or_insert(0) += 1;
            if seen.len() >= MAX_TERMS_PER_DOC {
                break;
            }
        }
        self.total_docs.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn total_docs(&self) -> u64 {
        self.total_docs.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// IDF with Laplace smoothing: ln((N+1)/(df+1)) + 1, floored at 1.
    /// Unknown terms default to df = N so they score as common.
    pub fn idf(&self, term: &str) -> f64 {
        let n = self.total_docs();
        let df = self.freq.get(term).map(|e| *e.value()).unwrap_or(n);
        ((((n + 1) as f64) / ((df + 1) as f64)).ln() + 1.0).max(1.0)
    }
}

/// Seconds since the Unix epoch as a float, the timestamp representation
/// shared by document rows and cache entries.
pub fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Data directory under the engine root holding the shard stores.
pub fn data_storage_dir(root: &Path) -> PathBuf {
    root.join("data_storage")
}

/// Cache directory under the engine root.
pub fn cache_dir(root: &Path) -> PathBuf {
    root.join("cache")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_categories_split_at_10_and_100_mib() {
        assert_eq!(SizeCategory::of(1), SizeCategory::Light);
        assert_eq!(SizeCategory::of(10 * 1024 * 1024), SizeCategory::Medium);
        assert_eq!(SizeCategory::of(100 * 1024 * 1024), SizeCategory::Medium);
        assert_eq!(SizeCategory::of(100 * 1024 * 1024 + 1), SizeCategory::Heavy);
    }

    #[test]
    fn tier_priority_ordering() {
        let mk = |layer: &str| SearchHit {
            file_path: "/a".into(),
            file_name: "a".into(),
            content_preview: String::new(),
            file_type: ".txt".into(),
            layer: layer.into(),
            relevance_score: 0.0,
        };
        assert!(mk("complete:3").tier_priority() > mk("immediate").tier_priority());
        assert!(mk("immediate").tier_priority() > mk("hot").tier_priority());
    }

    #[test]
    fn default_extension_set_contains_spec_formats() {
        let cfg = EngineConfig::default();
        let set = cfg.extension_set();
        for ext in ["txt", "docx", "xlsx", "pdf", "tif", "zip", "jww"] {
            assert!(set.contains(ext), "missing {ext}");
        }
    }

    #[test]
    fn file_type_is_lowercased_with_dot() {
        assert_eq!(file_type_of(Path::new("/x/REPORT.PDF")), ".pdf");
        assert_eq!(file_type_of(Path::new("/x/noext")), "");
    }

    #[test]
    fn rare_terms_have_higher_idf() {
        let stats = TermDocFreq::new();
        for i in 0..20 {
            stats.record(&format!("f{i}.txt"), "common filler words everywhere");
        }
        stats.record("special.txt", "common plus a zirconium mention");

        assert_eq!(stats.total_docs(), 21);
        assert!(stats.idf("zirconium") > stats.idf("common"));
        // Unknown terms score like common ones, not like rare ones
        assert!(stats.idf("neverseen") < stats.idf("zirconium"));
    }

    #[test]
    fn idf_is_floored_at_one() {
        let stats = TermDocFreq::new();
        stats.record("a.txt", "word");
        assert!(stats.idf("word") >= 1.0);
        assert!(stats.idf("absent") >= 1.0);
    }
}
