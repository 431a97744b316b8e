//! Core text algorithms for docfind.
//!
//! Everything in this crate is pure and deterministic: query pattern
//! expansion with width/case/kana folding, the tiered substring match rules
//! used by the cache layers, full-text clause generation for the shard
//! stores, and the cleanup applied to extracted document text.

pub mod normalize;
pub mod text;

pub use normalize::{match_index, matches, FtsClause, PatternCache, PatternSet};
pub use text::{clean_extracted, truncate_chars, MAX_CONTENT_CHARS};
