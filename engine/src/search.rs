//! Three-tier query planner.
//!
//! A query fans out across the immediate tier, the hot tier, and every
//! shard store in parallel; each source returns its own partial list and the
//! planner merges, scores, deduplicates by path, and truncates. While
//! indexing is active the cache tiers are consulted first and the shards are
//! only asked when the caches come up short, which keeps queries off pages
//! the writer is churning.

use crate::cache::{CacheHit, TieredCache};
use crate::store::{MatchKind, ShardStore, StoreHit};
use crate::types::{RankWeights, SearchHit, TermDocFreq};
use crossbeam_channel::{bounded, RecvTimeoutError};
use docfind_core::normalize::PatternSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Per-shard query ceiling; a slower shard contributes nothing.
const SHARD_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn search(
    patterns: &Arc<PatternSet>,
    cache: &Arc<TieredCache>,
    stores: &Arc<Vec<ShardStore>>,
    weights: &RankWeights,
    term_stats: &TermDocFreq,
    indexing_in_progress: bool,
    max_results: usize,
    type_filter: &str,
) -> Vec<SearchHit> {
    if patterns.is_empty() || max_results == 0 {
        return Vec::new();
    }

    let mut hits: Vec<SearchHit> = Vec::new();

    if indexing_in_progress {
        // Cache tiers first; the stores only when the caches come up short.
        let immediate = cache.search_immediate(patterns, max_results / 2);
        let hot = cache.search_hot(patterns, max_results / 2);
        let cache_total = immediate.len() + hot.len();
        hits.extend(score_cache_hits(immediate, "immediate", patterns, weights, term_stats));
        hits.extend(score_cache_hits(hot, "hot", patterns, weights, term_stats));

        if cache_total < max_results / 4 {
            let per_shard = (max_results / 4).max(1);
            hits.extend(fan_out_shards(patterns, stores, weights, term_stats, per_shard));
        }
    } else {
        let per_shard = max_results / stores.len().max(1) + 20;
        let cache_ask = (max_results / 4).max(1);

        // Cache scans and the shard fan-out all run concurrently.
        let (immediate, hot, shard_hits) = std::thread::scope(|scope| {
            let immediate =
                scope.spawn(|| cache.search_immediate(patterns, cache_ask));
            let hot = scope.spawn(|| cache.search_hot(patterns, cache_ask));
            let shard_hits = fan_out_shards(patterns, stores, weights, term_stats, per_shard);
            (
                immediate.join().unwrap_or_default(),
                hot.join().unwrap_or_default(),
                shard_hits,
            )
        });

        hits.extend(score_cache_hits(immediate, "immediate", patterns, weights, term_stats));
        hits.extend(score_cache_hits(hot, "hot", patterns, weights, term_stats));
        hits.extend(shard_hits);
    }

    let mut results = dedup_and_rank(hits, max_results);
    apply_type_filter(&mut results, type_filter);
    results
}

// ---------------------------------------------------------------------------
// Shard fan-out
// ---------------------------------------------------------------------------

/// One query per shard on its own thread, collected under a hard ceiling.
/// Failed or late shards drop out; the fan-out never aborts the query.
fn fan_out_shards(
    patterns: &Arc<PatternSet>,
    stores: &Arc<Vec<ShardStore>>,
    weights: &RankWeights,
    term_stats: &TermDocFreq,
    per_shard: usize,
) -> Vec<SearchHit> {
    let shard_count = stores.len();
    if shard_count == 0 {
        return Vec::new();
    }

    let (tx, rx) = bounded::<(usize, Vec<StoreHit>)>(shard_count);
    for shard in 0..shard_count {
        let tx = tx.clone();
        let stores = Arc::clone(stores);
        let patterns = Arc::clone(patterns);
        std::thread::spawn(move || {
            let result = match stores[shard].query(&patterns, per_shard) {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(shard, error = %e, "Shard query failed");
                    Vec::new()
                }
            };
            let _ = tx.send((shard, result));
        });
    }
    drop(tx);

    let deadline = Instant::now() + SHARD_QUERY_TIMEOUT;
    let mut hits = Vec::new();
    let mut answered = 0usize;
    while answered < shard_count {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok((shard, rows)) => {
                answered += 1;
                for row in rows {
                    hits.push(score_store_hit(row, shard, patterns, weights, term_stats));
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                debug!(answered, shard_count, "Shard fan-out deadline reached");
                break;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    hits
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// Occurrence/position term shared by both hit kinds: filename containment,
/// filename prefix, content start, and repeated occurrences (capped).
fn position_term(original: &str, file_name: &str, preview: &str) -> f64 {
    let query = original.to_lowercase();
    if query.is_empty() {
        return 0.0;
    }
    let name = file_name.to_lowercase();
    let body = preview.to_lowercase();

    let mut term = 0.0;
    if name.contains(&query) {
        term += 3.0;
    }
    if name.starts_with(&query) {
        term += 2.0;
    }
    if body.starts_with(&query) {
        term += 1.5;
    }
    let occurrences = body.matches(&query).count();
    if occurrences > 1 {
        term += (0.2 * (occurrences - 1) as f64).min(1.0);
    }
    term
}

/// IDF-weighted frequency term, bounded so one rare word cannot drown the
/// tier and form bonuses.
fn tfidf_term(original: &str, file_name: &str, preview: &str, stats: &TermDocFreq) -> f64 {
    if stats.total_docs() == 0 {
        return 0.0;
    }
    let terms: Vec<String> = original.split_whitespace().map(str::to_lowercase).collect();
    if terms.is_empty() {
        return 0.0;
    }
    let avg_idf = terms.iter().map(|t| stats.idf(t)).sum::<f64>() / terms.len() as f64;

    let haystack = format!("{} {}", file_name.to_lowercase(), preview.to_lowercase());
    let tf = terms.iter().map(|t| haystack.matches(t.as_str()).count()).sum::<usize>() as f64;
    let tf_norm = tf / (tf + 1.5);
    (tf_norm * avg_idf).min(3.0)
}

#[allow(clippy::too_many_arguments)]
fn common_terms(
    base: f64,
    pattern_index: usize,
    file_name: &str,
    preview: &str,
    file_type: &str,
    exact_bonus: f64,
    patterns: &PatternSet,
    weights: &RankWeights,
    term_stats: &TermDocFreq,
) -> f64 {
    let original = patterns.original();
    let mut score = base;

    score += weights.pattern_priority * (patterns.len() - pattern_index) as f64;

    let haystack = format!("{file_name} {preview}");
    if haystack.contains(original) {
        score += exact_bonus;
    }
    if original.chars().count() >= 4 && pattern_index > 0 {
        score -= weights.strictness_penalty;
    }

    score += weights.tfidf_weight * tfidf_term(original, file_name, preview, term_stats);
    score += weights.position_weight * position_term(original, file_name, preview);
    score += weights.filetype_weight * RankWeights::filetype_factor(file_type);
    score
}

fn score_cache_hits(
    hits: Vec<CacheHit>,
    layer: &str,
    patterns: &PatternSet,
    weights: &RankWeights,
    term_stats: &TermDocFreq,
) -> Vec<SearchHit> {
    let base = if layer == "immediate" { weights.immediate_base } else { weights.hot_base };
    hits.into_iter()
        .map(|hit| {
            let score = common_terms(
                base,
                hit.pattern_index,
                &hit.file_name,
                &hit.preview,
                &hit.file_type,
                weights.exact_cache_bonus,
                patterns,
                weights,
                term_stats,
            );
            SearchHit {
                file_path: hit.file_path,
                file_name: hit.file_name,
                content_preview: hit.preview,
                file_type: hit.file_type,
                layer: layer.to_string(),
                relevance_score: score,
            }
        })
        .collect()
}

fn score_store_hit(
    hit: StoreHit,
    shard: usize,
    patterns: &PatternSet,
    weights: &RankWeights,
    term_stats: &TermDocFreq,
) -> SearchHit {
    let form_bonus = match hit.matched_by {
        MatchKind::Phrase => weights.phrase_bonus,
        MatchKind::Prefix => weights.prefix_bonus,
        MatchKind::Bareword => weights.bareword_bonus,
        MatchKind::Like => weights.like_bonus,
    };
    let preview = docfind_core::truncate_chars(&hit.preview, crate::types::RESULT_PREVIEW_CHARS);
    let score = common_terms(
        hit.rank + form_bonus,
        hit.pattern_index,
        &hit.file_name,
        preview,
        &hit.file_type,
        weights.exact_fts_bonus,
        patterns,
        weights,
        term_stats,
    );
    SearchHit {
        file_path: hit.file_path,
        file_name: hit.file_name,
        content_preview: preview.to_string(),
        file_type: hit.file_type,
        layer: format!("complete:{shard}"),
        relevance_score: score,
    }
}

// ---------------------------------------------------------------------------
// Dedup, rank, filter
// ---------------------------------------------------------------------------

/// Durable rows outrank cache rows regardless of score; within a tier the
/// composite score decides. The first occurrence of each path survives.
fn dedup_and_rank(mut hits: Vec<SearchHit>, max_results: usize) -> Vec<SearchHit> {
    hits.sort_by(|a, b| {
        b.tier_priority().cmp(&a.tier_priority()).then(
            b.relevance_score
                .partial_cmp(&a.relevance_score)
                .unwrap_or(std::cmp::Ordering::Equal),
        )
    });

    let mut seen = std::collections::HashSet::new();
    let mut unique = Vec::with_capacity(hits.len().min(max_results));
    for hit in hits {
        if unique.len() >= max_results {
            break;
        }
        if seen.insert(hit.file_path.clone()) {
            unique.push(hit);
        }
    }
    unique
}

fn apply_type_filter(results: &mut Vec<SearchHit>, type_filter: &str) {
    if type_filter.is_empty() || type_filter == "all" {
        return;
    }
    let suffix = type_filter.to_lowercase();
    results.retain(|hit| hit.file_path.to_lowercase().ends_with(&suffix));
}
