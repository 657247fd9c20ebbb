//! Error Similarity Scoring
//!
//! Finds past mistakes that resemble a new error message. Three signals are
//! combined per candidate:
//!
//! - IDF-weighted unigram overlap (0.4)
//! - adjacent-pair (bigram) overlap (0.3)
//! - fuzzy token matching via Levenshtein distance (0.3)
//!
//! The IDF table is built over the candidate corpus plus the query itself, so
//! terms that appear in every mistake carry little weight.

use std::collections::{HashMap, HashSet};

/// Weight of the IDF unigram signal
pub const UNIGRAM_WEIGHT: f64 = 0.4;
/// Weight of the bigram overlap signal
pub const BIGRAM_WEIGHT: f64 = 0.3;
/// Weight of the fuzzy match signal
pub const FUZZY_WEIGHT: f64 = 0.3;

/// Default minimum combined score for a candidate to be returned
pub const DEFAULT_THRESHOLD: f64 = 0.3;

/// Max edit distance for a fuzzy token match
const MAX_EDIT_DISTANCE: usize = 2;

/// Tokens this short only ever match exactly
const FUZZY_MIN_LEN: usize = 4;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "can", "could", "did", "do", "does",
    "for", "from", "had", "has", "have", "if", "in", "into", "is", "it", "its", "may", "not",
    "of", "on", "or", "should", "so", "such", "than", "that", "the", "their", "then", "there",
    "these", "this", "to", "was", "were", "when", "which", "while", "will", "with", "would",
];

// ============================================================================
// TOKENIZATION
// ============================================================================

/// Lower-case, strip everything but alphanumerics and hyphens, split on
/// whitespace, then drop stopwords and single-character tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c.is_whitespace() { c } else { ' ' })
        .collect();

    cleaned
        .split_whitespace()
        .filter(|tok| tok.chars().count() > 1)
        .filter(|tok| !STOPWORDS.contains(tok))
        .map(str::to_string)
        .collect()
}

fn bigrams(tokens: &[String]) -> Vec<(&str, &str)> {
    tokens
        .windows(2)
        .map(|pair| (pair[0].as_str(), pair[1].as_str()))
        .collect()
}

/// Classic edit distance (insert/delete/substitute), by characters.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

// ============================================================================
// IDF TABLE
// ============================================================================

/// Inverse document frequency over a tokenized corpus.
#[derive(Debug, Clone)]
pub struct IdfTable {
    idf: HashMap<String, f64>,
    num_docs: usize,
}

impl IdfTable {
    /// `idf = ln((N + 1) / (df + 1)) + 1`
    pub fn build<'a, I>(documents: I) -> Self
    where
        I: IntoIterator<Item = &'a [String]>,
    {
        let mut doc_freq: HashMap<&str, usize> = HashMap::new();
        let mut num_docs = 0;

        for doc in documents {
            num_docs += 1;
            let unique: HashSet<&str> = doc.iter().map(String::as_str).collect();
            for tok in unique {
                *doc_freq.entry(tok).or_insert(0) += 1;
            }
        }

        let idf = doc_freq
            .into_iter()
            .map(|(tok, df)| {
                let value = ((num_docs as f64 + 1.0) / (df as f64 + 1.0)).ln() + 1.0;
                (tok.to_string(), value)
            })
            .collect();

        Self { idf, num_docs }
    }

    /// Weight of a token; unseen tokens get the rarest-possible weight.
    pub fn weight(&self, token: &str) -> f64 {
        self.idf
            .get(token)
            .copied()
            .unwrap_or_else(|| ((self.num_docs as f64 + 1.0) / 1.0).ln() + 1.0)
    }
}

// ============================================================================
// SCORING
// ============================================================================

/// Per-signal breakdown of one comparison.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityBreakdown {
    pub unigram: f64,
    pub bigram: f64,
    pub fuzzy: f64,
}

impl SimilarityBreakdown {
    pub fn combined(&self) -> f64 {
        UNIGRAM_WEIGHT * self.unigram + BIGRAM_WEIGHT * self.bigram + FUZZY_WEIGHT * self.fuzzy
    }
}

/// Compare query tokens against one target document.
pub fn compare(query: &[String], target: &[String], idf: &IdfTable) -> SimilarityBreakdown {
    if query.is_empty() || target.is_empty() {
        return SimilarityBreakdown {
            unigram: 0.0,
            bigram: 0.0,
            fuzzy: 0.0,
        };
    }

    let target_set: HashSet<&str> = target.iter().map(String::as_str).collect();

    let total_weight: f64 = query.iter().map(|t| idf.weight(t)).sum();
    let matched_weight: f64 = query
        .iter()
        .filter(|t| target_set.contains(t.as_str()))
        .map(|t| idf.weight(t))
        .sum();
    let unigram = if total_weight > 0.0 {
        matched_weight / total_weight
    } else {
        0.0
    };

    let query_pairs = bigrams(query);
    let bigram = if query_pairs.is_empty() {
        0.0
    } else {
        let target_pairs: HashSet<(&str, &str)> = bigrams(target).into_iter().collect();
        let hits = query_pairs.iter().filter(|p| target_pairs.contains(p)).count();
        hits as f64 / query_pairs.len() as f64
    };

    let fuzzy_hits = query
        .iter()
        .filter(|q| {
            target_set.contains(q.as_str())
                || (q.chars().count() >= FUZZY_MIN_LEN
                    && target.iter().any(|t| levenshtein(q, t) <= MAX_EDIT_DISTANCE))
        })
        .count();
    let fuzzy = fuzzy_hits as f64 / query.len() as f64;

    SimilarityBreakdown {
        unigram,
        bigram,
        fuzzy,
    }
}

/// A document that scored at or above the threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityMatch {
    /// Position in the input slice
    pub index: usize,
    /// Combined score rounded to two decimals
    pub score: f64,
}

/// Score every document against `query`, keeping those at or above
/// `threshold`, highest first.
pub fn rank_documents<S: AsRef<str>>(query: &str, documents: &[S], threshold: f64) -> Vec<SimilarityMatch> {
    let query_tokens = tokenize(query);
    if query_tokens.is_empty() {
        return Vec::new();
    }

    let doc_tokens: Vec<Vec<String>> = documents.iter().map(|d| tokenize(d.as_ref())).collect();
    let idf = IdfTable::build(
        doc_tokens
            .iter()
            .map(Vec::as_slice)
            .chain(std::iter::once(query_tokens.as_slice())),
    );

    let mut matches: Vec<SimilarityMatch> = doc_tokens
        .iter()
        .enumerate()
        .filter_map(|(index, tokens)| {
            let raw = compare(&query_tokens, tokens, &idf).combined();
            (raw >= threshold).then(|| SimilarityMatch {
                index,
                score: round2(raw),
            })
        })
        .collect();

    matches.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.index.cmp(&b.index))
    });
    matches
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
