//! Content generation: turns a queued item into the final post text.
//!
//! Failures are tagged so the pipeline can tell "this article is gone" apart from
//! "the AI provider is out of quota".

pub mod openai;

use async_trait::async_trait;
use thiserror::Error;

use crate::ingest::types::CandidateItem;

#[derive(Debug, Error)]
pub enum GenerateError {
    /// The item's own content could not be reached (dead link, paywall, 4xx).
    #[error("article content unreachable: {0}")]
    Unreachable(String),
    /// The generation provider refused for quota/billing reasons.
    #[error("generation quota exhausted: {0}")]
    Quota(String),
    #[error("generation failed: {0}")]
    Other(String),
}

impl GenerateError {
    pub fn kind(&self) -> &'static str {
        match self {
            GenerateError::Unreachable(_) => "unreachable",
            GenerateError::Quota(_) => "quota",
            GenerateError::Other(_) => "other",
        }
    }
}

#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(&self, item: &CandidateItem) -> Result<String, GenerateError>;
    fn name(&self) -> &'static str;
}

/// No AI: headline plus link.
#[derive(Debug, Clone)]
pub struct TemplateGenerator {
    max_chars: usize,
}

impl TemplateGenerator {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }
}

#[async_trait]
impl ContentGenerator for TemplateGenerator {
    async fn generate(&self, item: &CandidateItem) -> Result<String, GenerateError> {
        let text = sanitize_post(&item.title);
        if text.is_empty() {
            return Err(GenerateError::Other("empty title".into()));
        }
        Ok(compose_post(&text, &item.key, self.max_chars))
    }

    fn name(&self) -> &'static str {
        "template"
    }
}

/// Single line, collapsed whitespace, no wrapping quotes.
pub fn sanitize_post(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut prev_space = false;
    for ch in input.chars() {
        let c = if ch.is_whitespace() || ch.is_control() {
            ' '
        } else {
            ch
        };
        if c == ' ' {
            if !prev_space && !out.is_empty() {
                out.push(' ');
            }
            prev_space = true;
        } else {
            out.push(c);
            prev_space = false;
        }
    }
    let trimmed = out.trim();
    let unquoted = trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(trimmed);
    unquoted.trim().to_string()
}

/// `text` + blank line + `link`, shortening `text` with an ellipsis so the whole
/// post fits in `max_chars` characters. Links are never cut.
pub fn compose_post(text: &str, link: &str, max_chars: usize) -> String {
    let link = link.trim();
    let sep = if link.is_empty() { "" } else { "\n\n" };
    let reserved = sep.chars().count() + link.chars().count();
    let budget = max_chars.saturating_sub(reserved);

    let body = if text.chars().count() <= budget {
        text.to_string()
    } else if budget == 0 {
        String::new()
    } else {
        let mut cut: String = text.chars().take(budget - 1).collect();
        cut = cut.trim_end().to_string();
        cut.push('…');
        cut
    };

    if body.is_empty() {
        link.to_string()
    } else {
        format!("{body}{sep}{link}")
    }
}
