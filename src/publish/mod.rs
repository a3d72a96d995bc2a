pub mod webhook;

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PublishError {
    /// The platform refused because of its posting quota.
    #[error("rate limited by platform")]
    RateLimited { retry_after: Option<Duration> },
    #[error("publish failed: {0}")]
    Other(String),
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, text: &str) -> Result<(), PublishError>;
    fn name(&self) -> &'static str;
}

/// Logs instead of posting. Records what it was given.
#[derive(Debug, Default)]
pub struct DryRunPublisher {
    pub sent: Mutex<Vec<String>>,
}

impl DryRunPublisher {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Publisher for DryRunPublisher {
    async fn publish(&self, text: &str) -> Result<(), PublishError> {
        tracing::info!(target: "publish", chars = text.chars().count(), "dry-run post:\n{text}");
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(text.to_string());
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "dry-run"
    }
}
