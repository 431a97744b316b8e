//! Query pattern expansion and match rules for Japanese and mixed
//! ASCII/wide-character queries.
//!
//! A raw query expands into a deterministic ordered pattern set: the original
//! query first, then NFKC/fullwidth/lowercase variants, kana folds, whitespace
//! tokens, and single-character/bigram expansions, with everything after the
//! original sorted by descending length. The cache tiers match entries against
//! this set with a strictness rule tied to the original query length; the
//! shard stores turn each pattern into full-text clauses.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use unicode_normalization::UnicodeNormalization;

// ---------------------------------------------------------------------------
// Folding primitives
// ---------------------------------------------------------------------------

/// ASCII printable range shifted into the fullwidth block.
fn to_fullwidth(s: &str) -> String {
    s.chars()
        .map(|c| {
            if ('!'..='~').contains(&c) {
                char::from_u32(c as u32 + 0xFEE0).unwrap_or(c)
            } else {
                c
            }
        })
        .collect()
}

fn hiragana_to_katakana(s: &str) -> String {
    s.chars()
        .map(|c| {
            if ('ぁ'..='ゖ').contains(&c) {
                char::from_u32(c as u32 + 0x60).unwrap_or(c)
            } else {
                c
            }
        })
        .collect()
}

fn katakana_to_hiragana(s: &str) -> String {
    s.chars()
        .map(|c| {
            if ('ァ'..='ヶ').contains(&c) {
                char::from_u32(c as u32 - 0x60).unwrap_or(c)
            } else {
                c
            }
        })
        .collect()
}

fn nfkc(s: &str) -> String {
    s.nfkc().collect()
}

// ---------------------------------------------------------------------------
// Pattern set
// ---------------------------------------------------------------------------

/// Ordered, deduplicated expansion of a raw query.
///
/// The original query is always first; the remaining patterns are sorted by
/// non-increasing character length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternSet {
    patterns: Vec<String>,
}

impl PatternSet {
    /// Expand a raw query into its pattern set.
    pub fn build(query: &str) -> Self {
        let query = query.trim();
        if query.is_empty() {
            return Self { patterns: Vec::new() };
        }

        let mut patterns: Vec<String> = vec![query.to_string()];
        let push = |patterns: &mut Vec<String>, candidate: String| {
            if !candidate.is_empty() && !patterns.iter().any(|p| *p == candidate) {
                patterns.push(candidate);
            }
        };

        push(&mut patterns, nfkc(query));
        push(&mut patterns, to_fullwidth(query));

        let lower = query.to_lowercase();
        push(&mut patterns, lower.clone());

        // Single characters and bigrams make short CJK tokens findable in
        // caches and trigram stores that would otherwise miss them.
        if query.chars().count() >= 2 {
            for c in query.chars().filter(|c| !c.is_whitespace()) {
                push(&mut patterns, c.to_string());
            }
            let chars: Vec<char> = query.chars().collect();
            for pair in chars.windows(2) {
                push(&mut patterns, pair.iter().collect());
            }
        }

        push(&mut patterns, hiragana_to_katakana(&lower));
        push(&mut patterns, katakana_to_hiragana(&lower));

        let words: Vec<&str> = query.split_whitespace().collect();
        if words.len() > 1 {
            for word in words {
                push(&mut patterns, word.to_string());
                push(&mut patterns, nfkc(word));
            }
        }

        // Original stays in front, the tail sorts longest-first (stable, so
        // equal-length patterns keep insertion order).
        let tail = &mut patterns[1..];
        tail.sort_by(|a, b| b.chars().count().cmp(&a.chars().count()));

        Self { patterns }
    }

    /// The original query (always present for a non-empty query).
    pub fn original(&self) -> &str {
        self.patterns.first().map(String::as_str).unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(String::as_str)
    }

    /// Minimum pattern length admitted by the strictness rule, derived from
    /// the original query length: 4+ char queries only match through 3+ char
    /// patterns, 2-3 char queries through 2+ char patterns, 1 char queries
    /// through anything.
    pub fn min_match_len(&self) -> usize {
        match self.original().chars().count() {
            n if n >= 4 => 3,
            n if n >= 2 => 2,
            _ => 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Cache-side substring matching
// ---------------------------------------------------------------------------

fn fold_variants(s: &str) -> [String; 4] {
    let lower = s.to_lowercase();
    let normalized = nfkc(&lower);
    let h2k = hiragana_to_katakana(&lower);
    let k2h = katakana_to_hiragana(&lower);
    [lower, normalized, h2k, k2h]
}

/// Index of the first pattern that matches `text` under the strictness rule,
/// or `None`. Folding (case, NFKC width, kana) is applied to both sides.
pub fn match_index(text: &str, patterns: &PatternSet) -> Option<usize> {
    if text.is_empty() || patterns.is_empty() {
        return None;
    }

    let min_len = patterns.min_match_len();
    let text_variants = fold_variants(text);

    for (idx, pattern) in patterns.iter().enumerate() {
        if pattern.trim().chars().count() < min_len {
            continue;
        }
        for pv in fold_variants(pattern) {
            if pv.is_empty() {
                continue;
            }
            if text.contains(&pv) || text_variants.iter().any(|tv| tv.contains(&pv)) {
                return Some(idx);
            }
        }
    }
    None
}

/// Substring match of a text value against a pattern set.
pub fn matches(text: &str, patterns: &PatternSet) -> bool {
    match_index(text, patterns).is_some()
}

// ---------------------------------------------------------------------------
// Full-text clause generation
// ---------------------------------------------------------------------------

/// One full-text query expression for a single pattern, in decreasing
/// precedence: exact phrase, bareword, prefix. Patterns too short for the
/// trigram index probe with a substring LIKE instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FtsClause {
    Phrase(String),
    Bareword(String),
    Prefix(String),
    Like(String),
}

impl FtsClause {
    pub fn pattern(&self) -> &str {
        match self {
            Self::Phrase(p) | Self::Bareword(p) | Self::Prefix(p) | Self::Like(p) => p,
        }
    }
}

/// Bareword clauses are only safe when the pattern cannot be mistaken for
/// FTS5 query syntax.
fn is_bareword_safe(pattern: &str) -> bool {
    !pattern.is_empty() && pattern.chars().all(|c| c.is_alphanumeric() || c == '_')
}

/// Clauses for one pattern, highest precedence first.
pub fn fts_clauses(pattern: &str) -> Vec<FtsClause> {
    if pattern.chars().count() >= 3 {
        let mut clauses = vec![FtsClause::Phrase(pattern.to_string())];
        if is_bareword_safe(pattern) {
            clauses.push(FtsClause::Bareword(pattern.to_string()));
        }
        clauses.push(FtsClause::Prefix(pattern.to_string()));
        clauses
    } else {
        vec![FtsClause::Like(pattern.to_string())]
    }
}

// ---------------------------------------------------------------------------
// Memoized expansion
// ---------------------------------------------------------------------------

/// Bounded memoization of [`PatternSet::build`] keyed by the raw query.
pub struct PatternCache {
    cache: Mutex<LruCache<String, std::sync::Arc<PatternSet>>>,
}

impl PatternCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("max(1) is non-zero");
        Self { cache: Mutex::new(LruCache::new(capacity)) }
    }

    /// Expansion for `query`, computed at most once per cached entry.
    pub fn get(&self, query: &str) -> std::sync::Arc<PatternSet> {
        let mut cache = self.cache.lock().expect("pattern cache lock poisoned");
        if let Some(hit) = cache.get(query) {
            return std::sync::Arc::clone(hit);
        }
        let built = std::sync::Arc::new(PatternSet::build(query));
        cache.put(query.to_string(), std::sync::Arc::clone(&built));
        built
    }
}

impl Default for PatternCache {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn original_query_is_first_pattern() {
        let ps = PatternSet::build("検索テスト");
        assert_eq!(ps.original(), "検索テスト");
        assert!(ps.iter().next() == Some("検索テスト"));
    }

    #[test]
    fn tail_is_sorted_by_non_increasing_length() {
        let ps = PatternSet::build("search term");
        let lens: Vec<usize> = ps.iter().skip(1).map(|p| p.chars().count()).collect();
        for pair in lens.windows(2) {
            assert!(pair[0] >= pair[1], "tail not sorted: {:?}", lens);
        }
    }

    #[test]
    fn expansion_contains_bigrams_and_singles() {
        let ps = PatternSet::build("検索");
        let all: Vec<&str> = ps.iter().collect();
        assert!(all.contains(&"検"));
        assert!(all.contains(&"索"));
        assert!(all.contains(&"検索"));
    }

    #[test]
    fn fullwidth_variant_is_generated() {
        let ps = PatternSet::build("ABC");
        assert!(ps.iter().any(|p| p == "ＡＢＣ"));
    }

    #[test]
    fn kana_folds_are_generated() {
        let ps = PatternSet::build("てすと");
        assert!(ps.iter().any(|p| p == "テスト"));
    }

    #[test]
    fn fullwidth_query_matches_ascii_text() {
        let ps = PatternSet::build("ＡＢＣ");
        assert!(matches("report abc final", &ps));
    }

    #[test]
    fn katakana_query_matches_hiragana_text() {
        let ps = PatternSet::build("テスト");
        assert!(matches("これはてすとです", &ps));
    }

    #[test]
    fn long_query_ignores_single_char_patterns() {
        // Strictness rule: a 4+ char query must not match through the
        // 1-char expansions of its own pattern set.
        let ps = PatternSet::build("abcdef");
        assert!(!matches("only a and b appear separately", &ps));
        assert!(matches("contains abcdef verbatim", &ps));
    }

    #[test]
    fn two_char_query_matches_through_itself() {
        let ps = PatternSet::build("検索");
        assert!(matches("全文検索エンジン", &ps));
        assert!(!matches("unrelated text", &ps));
    }

    #[test]
    fn match_index_prefers_earlier_patterns() {
        let ps = PatternSet::build("検索テスト");
        // Full phrase present: must match at index 0, not a later bigram.
        assert_eq!(match_index("検索テスト ABC", &ps), Some(0));
    }

    #[test]
    fn clauses_for_long_pattern() {
        let clauses = fts_clauses("report");
        assert!(matches!(clauses[0], FtsClause::Phrase(_)));
        assert!(matches!(clauses[1], FtsClause::Bareword(_)));
        assert!(matches!(clauses.last(), Some(FtsClause::Prefix(_))));
    }

    #[test]
    fn clauses_for_short_pattern_probe_with_like() {
        let clauses = fts_clauses("ab");
        assert_eq!(clauses, vec![FtsClause::Like("ab".to_string())]);
    }

    #[test]
    fn bareword_skipped_for_syntax_characters() {
        let clauses = fts_clauses("a-b-c");
        assert!(!clauses.iter().any(|c| matches!(c, FtsClause::Bareword(_))));
    }

    #[test]
    fn pattern_cache_returns_identical_expansion() {
        let cache = PatternCache::new(10);
        let a = cache.get("検索");
        let b = cache.get("検索");
        assert!(std::sync::Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn empty_query_expands_to_nothing() {
        assert!(PatternSet::build("  ").is_empty());
    }
}
