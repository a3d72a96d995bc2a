// src/ingest/mod.rs
pub mod rss;
pub mod types;

use crate::ingest::types::CandidateItem;
use chrono::{DateTime, Duration, Utc};
use once_cell::sync::OnceCell;
use url::Url;

/// Query parameters that only carry tracking state and never identify an article.
const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "mc_cid", "mc_eid", "ref", "cmpid"];

/// Normalize text: decode entities, strip tags, collapse whitespace.
pub fn normalize_text(s: &str) -> String {
    // 1) HTML entity decode
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Strip HTML tags
    static RE_TAGS: OnceCell<regex::Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").unwrap());
    out = re_tags.replace_all(&out, "").to_string();

    // 3) Normalize “ ” ‘ ’ « » to ASCII quotes
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // 4) Collapse whitespace
    static RE_WS: OnceCell<regex::Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").unwrap());
    out = re_ws.replace_all(&out, " ").to_string();
    out = out.trim().to_string();

    // 5) Length cap: 2000 chars
    if out.chars().count() > 2000 {
        out = out.chars().take(2000).collect();
    }

    out
}

/// Canonical form of an item key, used for every exact-key comparison.
///
/// URLs lose their fragment, tracking parameters and trailing slash; the host is
/// lowercased by the parser. Anything that does not parse as a URL is only trimmed.
pub fn canonical_key(raw: &str) -> String {
    let trimmed = raw.trim();
    let Ok(mut url) = Url::parse(trimmed) else {
        return trimmed.to_string();
    };
    url.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| {
            let k = k.to_ascii_lowercase();
            !k.starts_with("utm_") && !TRACKING_PARAMS.contains(&k.as_str())
        })
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    let mut out = url.to_string();
    while out.ends_with('/') && !out.ends_with("://") {
        out.pop();
    }
    out
}

pub fn is_whitelisted<S: AsRef<str>>(source: S, whitelist: &[String]) -> bool {
    let s = source.as_ref();
    whitelist.iter().any(|w| w.eq_ignore_ascii_case(s))
}

fn mentions_blocked(item: &CandidateItem, blocked: &[String]) -> bool {
    if blocked.is_empty() {
        return false;
    }
    let hay = format!("{} {}", item.title, item.excerpt).to_lowercase();
    blocked
        .iter()
        .map(|k| k.trim().to_lowercase())
        .any(|k| !k.is_empty() && hay.contains(&k))
}

/// Filter criteria applied to freshly fetched candidates before dedup.
#[derive(Debug, Clone, Default)]
pub struct CandidateFilter {
    pub source_whitelist: Vec<String>,
    pub blocked_keywords: Vec<String>,
    pub max_item_age: Option<Duration>,
}

/// Normalize + filter a fetched batch. Returns (kept, filtered_count).
///
/// Items with no usable title are kept here on purpose; the duplicate detector
/// rejects them as unprocessable so the rejection is counted in one place.
pub fn filter_candidates(
    now: DateTime<Utc>,
    raw: Vec<CandidateItem>,
    filter: &CandidateFilter,
) -> (Vec<CandidateItem>, usize) {
    let mut filtered_out = 0usize;
    let mut keep = Vec::with_capacity(raw.len());

    for mut item in raw {
        item.title = normalize_text(&item.title);
        item.excerpt = normalize_text(&item.excerpt);
        item.key = canonical_key(&item.key);

        let whitelisted = filter.source_whitelist.is_empty()
            || is_whitelisted(&item.source, &filter.source_whitelist);
        let too_old = match (filter.max_item_age, item.published_at) {
            (Some(max_age), Some(ts)) => now - ts > max_age,
            _ => false,
        };
        if item.key.is_empty()
            || !whitelisted
            || too_old
            || mentions_blocked(&item, &filter.blocked_keywords)
        {
            filtered_out += 1;
            tracing::debug!(target: "ingest", source = %item.source, "candidate filtered");
            continue;
        }
        keep.push(item);
    }

    (keep, filtered_out)
}
