use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header::HeaderMap, Client, StatusCode};
use serde::Serialize;

use super::{PublishError, Publisher};
use crate::config::MAX_PUBLISH_RETRIES;

const BACKOFF_BASE_MS: u64 = 500;

/// Posts `{"content": text}` to a webhook-style endpoint.
#[derive(Clone)]
pub struct WebhookPublisher {
    webhook: String,
    client: Client,
    timeout: Duration,
    max_retries: u8,
}

impl WebhookPublisher {
    pub fn new(webhook: String) -> Self {
        Self {
            webhook,
            client: Client::new(),
            timeout: Duration::from_secs(10),
            max_retries: 3,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Attempts per post, clamped into `1..=MAX_PUBLISH_RETRIES`.
    pub fn with_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries.clamp(1, MAX_PUBLISH_RETRIES);
        self
    }
}

/// Sleep before attempt `attempt + 1`: 500 ms doubling, capped at the last allowed retry.
fn backoff(attempt: u8) -> Duration {
    let exp = u32::from(attempt.clamp(1, MAX_PUBLISH_RETRIES) - 1);
    Duration::from_millis(BACKOFF_BASE_MS << exp)
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    content: &'a str,
}

/// What to do with one HTTP response.
#[derive(Debug, PartialEq, Eq)]
pub enum ResponseClass {
    Ok,
    RateLimited(Option<Duration>),
    Retryable,
    Fatal,
}

pub fn classify_response(status: StatusCode, headers: &HeaderMap) -> ResponseClass {
    if status.is_success() {
        ResponseClass::Ok
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ResponseClass::RateLimited(retry_after(headers))
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ResponseClass::Retryable
    } else {
        ResponseClass::Fatal
    }
}

/// `Retry-After` in delta-seconds form; HTTP-date values are ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl Publisher for WebhookPublisher {
    async fn publish(&self, text: &str) -> Result<(), PublishError> {
        let payload = WebhookPayload { content: text };

        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            let res = self
                .client
                .post(&self.webhook)
                .timeout(self.timeout)
                .json(&payload)
                .send()
                .await;

            let failure = match res {
                Ok(rsp) => match classify_response(rsp.status(), rsp.headers()) {
                    ResponseClass::Ok => return Ok(()),
                    ResponseClass::RateLimited(retry_after) => {
                        return Err(PublishError::RateLimited { retry_after })
                    }
                    ResponseClass::Fatal => {
                        return Err(PublishError::Other(format!(
                            "webhook HTTP {}",
                            rsp.status()
                        )))
                    }
                    ResponseClass::Retryable => format!("webhook HTTP {}", rsp.status()),
                },
                Err(e) => format!("webhook request failed: {e}"),
            };

            if attempt >= self.max_retries {
                return Err(PublishError::Other(failure));
            }
            tracing::debug!(target: "publish", attempt, %failure, "retrying");
            tokio::time::sleep(backoff(attempt)).await;
        }
    }

    fn name(&self) -> &'static str {
        "webhook"
    }
}
