//! Search Module
//!
//! Retrieval over observations and permanent memory:
//! - Layer 1: compact ranked index (FTS5 + BM25)
//! - Layer 2: chronological timeline around an anchor
//! - Layer 3: full-detail fetch by id
//!
//! Plus the error-similarity scorer used for mistake diagnosis.

mod index;
pub mod similarity;

pub use index::{
    FullRecord, IndexHit, OrderBy, SearchIndex, SearchOptions, SearchSource, Timeline,
    TimelineAnchor, TimelineEntry,
};

/// Turn free text into an FTS5 expression of quoted OR-terms.
///
/// Double quotes inside terms are dropped so user input can never produce
/// FTS5 syntax. Returns `None` when nothing searchable remains.
pub fn build_fts_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|term| term.replace('"', ""))
        .filter(|term| term.chars().any(char::is_alphanumeric))
        .map(|term| format!("\"{}\"", term))
        .collect();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

/// Map a BM25 rank (lower is better, usually negative) into 0-1, higher is better.
pub fn normalize_rank(rank: f64) -> f64 {
    let magnitude = rank.abs();
    magnitude / (1.0 + magnitude)
}
