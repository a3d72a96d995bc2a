// src/ingest/types.rs
use anyhow::Result;
use chrono::{DateTime, Utc};

/// A freshly fetched, not-yet-vetted news item.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct CandidateItem {
    pub key: String,     // source URI, stable per article
    pub title: String,   // normalized headline
    pub excerpt: String, // normalized description, may be empty
    pub published_at: Option<DateTime<Utc>>,
    pub source: String, // e.g. "Reuters", "TechCrunch"
}

#[async_trait::async_trait]
pub trait NewsSource: Send + Sync {
    async fn fetch(&self, max_items: usize) -> Result<Vec<CandidateItem>>;
    fn name(&self) -> &'static str;
}
