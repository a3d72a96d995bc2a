//! Duplicate detection against the backlog and recent publish history.
//!
//! Two checks, in order:
//! - exact: the candidate's canonical key is already queued or published;
//! - fuzzy: Jaccard similarity of title signatures (order-insensitive token sets)
//!   or of content fingerprints (word shingles over title + excerpt).
//!
//! Signatures are recomputed on every comparison and never persisted.
//!
//! An empty excerpt degrades the fingerprint to the title alone. Two short
//! title-only fingerprints can then collide more easily than full ones; that
//! false-duplicate risk is accepted.

use std::collections::HashSet;
use std::hash::Hash;

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::OnceCell;
use regex::{Captures, Regex};

use crate::backlog::Backlog;
use crate::ingest::types::CandidateItem;
use crate::store::{lookback_start, HistoryView};

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "of", "to", "in", "on", "for", "and", "or", "at", "by", "with", "from",
    "as", "is", "are", "was", "its", "it", "after", "over", "into",
];

/// Tunables for the detector.
#[derive(Clone, Debug)]
pub struct DedupParams {
    /// Title signature similarity in [0.0, 1.0]; >= this is a near-identical headline.
    pub title_threshold: f64,
    /// Content fingerprint similarity in [0.0, 1.0]; >= this is substantially shared content.
    pub content_threshold: f64,
    /// Words per shingle.
    pub shingle_size: usize,
    /// Only history posted within this window is compared.
    pub lookback: Duration,
    /// ...and at most this many of the newest records.
    pub lookback_records: usize,
}

impl Default for DedupParams {
    fn default() -> Self {
        Self {
            title_threshold: 0.8,
            content_threshold: 0.5,
            shingle_size: 3,
            lookback: Duration::days(14),
            lookback_records: 300,
        }
    }
}

/// Order-insensitive token set of a normalized title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleSignature(HashSet<String>);

/// Word-shingle set over title + excerpt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentFingerprint(HashSet<String>);

impl TitleSignature {
    pub fn of(title: &str) -> Self {
        Self(tokens(title).into_iter().collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn similarity(&self, other: &Self) -> f64 {
        jaccard(&self.0, &other.0)
    }
}

impl ContentFingerprint {
    pub fn of(title: &str, excerpt: &str, shingle_size: usize) -> Self {
        let mut words = tokens(title);
        words.extend(tokens(excerpt));
        let k = shingle_size.max(1);
        if words.is_empty() {
            return Self(HashSet::new());
        }
        if words.len() < k {
            return Self(HashSet::from([words.join(" ")]));
        }
        Self(words.windows(k).map(|w| w.join(" ")).collect())
    }

    pub fn similarity(&self, other: &Self) -> f64 {
        jaccard(&self.0, &other.0)
    }
}

/// |A ∩ B| / |A ∪ B|; two empty sets share no evidence and score 0.
pub fn jaccard<T: Eq + Hash>(a: &HashSet<T>, b: &HashSet<T>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let inter = a.intersection(b).count();
    let union = a.len() + b.len() - inter;
    inter as f64 / union as f64
}

/// Lowercase word tokens with magnitude shorthand expanded and stopwords removed.
fn tokens(s: &str) -> Vec<String> {
    static RE_MAGNITUDE: OnceCell<Regex> = OnceCell::new();
    static RE_WORD: OnceCell<Regex> = OnceCell::new();
    let re_mag = RE_MAGNITUDE.get_or_init(|| {
        Regex::new(r"\b(\d+(?:\.\d+)?)(k|m|mn|mln|b|bn|bln)\b").unwrap()
    });
    let re_word = RE_WORD.get_or_init(|| Regex::new(r"(?u)[\p{L}\p{N}]+(?:\.\p{N}+)?").unwrap());

    let lower = s.to_lowercase();
    let expanded = re_mag.replace_all(&lower, |c: &Captures| {
        let word = match &c[2] {
            "k" => "thousand",
            "m" | "mn" | "mln" => "million",
            _ => "billion",
        };
        format!("{} {}", &c[1], word)
    });

    re_word
        .find_iter(&expanded)
        .map(|m| m.as_str())
        .filter(|w| !STOPWORDS.contains(w))
        .map(str::to_string)
        .collect()
}

/// Outcome of a duplicate check.
#[derive(Debug, Clone, PartialEq)]
pub enum DedupVerdict {
    Unique,
    /// No usable title; rejected without comparison.
    Unprocessable,
    AlreadyQueued,
    AlreadyPublished,
    /// Dropped after a failure on an earlier run and not aged out yet.
    PreviouslyDropped,
    SimilarTitle { matched_key: String, score: f64 },
    SimilarContent { matched_key: String, score: f64 },
}

impl DedupVerdict {
    pub fn is_duplicate(&self) -> bool {
        !matches!(self, DedupVerdict::Unique)
    }

    /// Short label for logs and metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            DedupVerdict::Unique => "unique",
            DedupVerdict::Unprocessable => "unprocessable",
            DedupVerdict::AlreadyQueued => "queued",
            DedupVerdict::AlreadyPublished => "published",
            DedupVerdict::PreviouslyDropped => "dropped",
            DedupVerdict::SimilarTitle { .. } => "similar_title",
            DedupVerdict::SimilarContent { .. } => "similar_content",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DuplicateDetector {
    params: DedupParams,
}

impl DuplicateDetector {
    pub fn new(mut params: DedupParams) -> Self {
        params.title_threshold = params.title_threshold.clamp(0.0, 1.0);
        params.content_threshold = params.content_threshold.clamp(0.0, 1.0);
        if params.shingle_size == 0 {
            params.shingle_size = 1;
        }
        Self { params }
    }

    pub fn params(&self) -> &DedupParams {
        &self.params
    }

    pub fn is_duplicate(
        &self,
        now: DateTime<Utc>,
        candidate: &CandidateItem,
        backlog: &Backlog,
        history: HistoryView<'_>,
    ) -> bool {
        self.check(now, candidate, backlog, history).is_duplicate()
    }

    pub fn check(
        &self,
        now: DateTime<Utc>,
        candidate: &CandidateItem,
        backlog: &Backlog,
        history: HistoryView<'_>,
    ) -> DedupVerdict {
        let title = TitleSignature::of(&candidate.title);
        if title.is_empty() {
            return DedupVerdict::Unprocessable;
        }
        if history.contains_key(&candidate.key) {
            return DedupVerdict::AlreadyPublished;
        }
        if history.was_dropped(&candidate.key) {
            return DedupVerdict::PreviouslyDropped;
        }
        if backlog.contains_key(&candidate.key) {
            return DedupVerdict::AlreadyQueued;
        }

        let content =
            ContentFingerprint::of(&candidate.title, &candidate.excerpt, self.params.shingle_size);

        let since = lookback_start(now, self.params.lookback);
        let queued = backlog
            .iter()
            .map(|e| (e.key(), e.item.title.as_str(), e.item.excerpt.as_str()));
        let published = history
            .recent(since, self.params.lookback_records)
            .map(|r| (r.key.as_str(), r.title.as_str(), r.excerpt.as_str()));

        for (key, other_title, other_excerpt) in queued.chain(published) {
            let score = title.similarity(&TitleSignature::of(other_title));
            if score >= self.params.title_threshold {
                return DedupVerdict::SimilarTitle {
                    matched_key: key.to_string(),
                    score,
                };
            }
            let other =
                ContentFingerprint::of(other_title, other_excerpt, self.params.shingle_size);
            let score = content.similarity(&other);
            if score >= self.params.content_threshold {
                return DedupVerdict::SimilarContent {
                    matched_key: key.to_string(),
                    score,
                };
            }
        }
        DedupVerdict::Unique
    }
}
