//! OpenAI Chat Completions generator. Requires an API key.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::{compose_post, sanitize_post, ContentGenerator, GenerateError};
use crate::ingest::{normalize_text, types::CandidateItem};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

const SYSTEM_PROMPT: &str = "You write short social media posts about news articles. \
Return ONE or TWO sentences, plain text, no hashtags, no emojis, no links. \
Stay factual and do not invent numbers. Output only the post text.";

pub struct OpenAiGenerator {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    fetch_article: bool,
    max_chars: usize,
}

impl OpenAiGenerator {
    pub fn new(
        api_key: String,
        model: &str,
        fetch_article: bool,
        max_chars: usize,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("newsdrip/0.1")
            .connect_timeout(Duration::from_secs(5))
            .timeout(timeout)
            .build()
            .context("building openai http client")?;
        Ok(Self {
            http,
            api_key,
            model: model.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            fetch_article,
            max_chars,
        })
    }

    /// Point at a compatible endpoint (proxy, local server).
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// Fetch the article page and reduce it to plain text (capped by `normalize_text`).
    async fn article_text(&self, url: &str) -> Result<String, GenerateError> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| GenerateError::Unreachable(format!("{url}: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(GenerateError::Unreachable(format!("{url}: HTTP {status}")));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| GenerateError::Unreachable(format!("{url}: {e}")))?;
        Ok(normalize_text(&body))
    }

    fn user_prompt(item: &CandidateItem, article: Option<&str>) -> String {
        let mut p = format!("Title: {}\nSource: {}\n", item.title, item.source);
        if !item.excerpt.is_empty() {
            p.push_str(&format!("Summary: {}\n", item.excerpt));
        }
        if let Some(text) = article.filter(|t| !t.is_empty()) {
            p.push_str(&format!("Article text: {text}\n"));
        }
        p
    }
}

/// Map a non-2xx completion response onto a failure kind.
pub fn classify_completion_failure(status: StatusCode, body: &str) -> GenerateError {
    let snippet: String = body.chars().take(200).collect();
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::PAYMENT_REQUIRED
        || body.contains("insufficient_quota")
    {
        GenerateError::Quota(format!("HTTP {status}: {snippet}"))
    } else {
        GenerateError::Other(format!("HTTP {status}: {snippet}"))
    }
}

#[derive(Serialize)]
struct Msg<'a> {
    role: &'a str,
    content: &'a str,
}
#[derive(Serialize)]
struct Req<'a> {
    model: &'a str,
    messages: Vec<Msg<'a>>,
    temperature: f32,
    max_tokens: u32,
}
#[derive(Deserialize)]
struct Resp {
    choices: Vec<Choice>,
}
#[derive(Deserialize)]
struct Choice {
    message: ChoiceMsg,
}
#[derive(Deserialize)]
struct ChoiceMsg {
    content: String,
}

#[async_trait]
impl ContentGenerator for OpenAiGenerator {
    async fn generate(&self, item: &CandidateItem) -> Result<String, GenerateError> {
        if self.api_key.is_empty() {
            return Err(GenerateError::Other("OPENAI_API_KEY not set".into()));
        }

        let article = if self.fetch_article && item.key.starts_with("http") {
            Some(self.article_text(&item.key).await?)
        } else {
            None
        };

        let user = Self::user_prompt(item, article.as_deref());
        let req = Req {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                Msg {
                    role: "user",
                    content: &user,
                },
            ],
            temperature: 0.4,
            max_tokens: 160,
        };

        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .map_err(|e| GenerateError::Other(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_completion_failure(status, &body));
        }
        let body: Resp = resp
            .json()
            .await
            .map_err(|e| GenerateError::Other(format!("bad completion payload: {e}")))?;
        let content = body
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or("");
        let cleaned = sanitize_post(content);
        if cleaned.is_empty() {
            return Err(GenerateError::Other("empty completion".into()));
        }
        tracing::debug!(
            target: "generate",
            model = %self.model,
            chars = cleaned.chars().count(),
            "completion ok"
        );
        Ok(compose_post(&cleaned, &item.key, self.max_chars))
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}
