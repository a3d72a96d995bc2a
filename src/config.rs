// src/config.rs
use anyhow::{anyhow, bail, Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use crate::cooldown::CooldownPolicy;
use crate::dedup::DedupParams;
use crate::ingest::{rss::FeedSpec, CandidateFilter};

pub const ENV_CONFIG_PATH: &str = "NEWSDRIP_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/newsdrip.toml";

const ENV_STATE_PATH: &str = "NEWSDRIP_STATE_PATH";
const ENV_MIN_INTERVAL: &str = "NEWSDRIP_MIN_INTERVAL_MINS";
const ENV_DRY_RUN: &str = "NEWSDRIP_DRY_RUN";
const ENV_WEBHOOK_URL: &str = "NEWSDRIP_WEBHOOK_URL";
const ENV_FEEDS: &str = "NEWSDRIP_FEEDS";
const ENV_OPENAI_KEY: &str = "OPENAI_API_KEY";

/// Upper bound for every configured span (one year), so conversions never overflow.
const MAX_SPAN_MINS: i64 = 366 * 24 * 60;
/// Webhook attempts per post; backoff doubles from 500 ms, so 6 attempts wait at most 15.5 s.
pub const MAX_PUBLISH_RETRIES: u8 = 6;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub store: StoreSection,
    pub gate: GateSection,
    pub dedup: DedupSection,
    pub backlog: BacklogSection,
    pub ingest: IngestSection,
    pub generate: GenerateSection,
    pub publish: PublishSection,
    pub timeouts: TimeoutSection,
    pub metrics: MetricsSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub path: PathBuf,
    pub excerpt_max_chars: usize,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("state/newsdrip.json"),
            excerpt_max_chars: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateSection {
    pub min_interval_mins: i64,
    /// Escalation schedule; the last entry is the ceiling.
    pub cooldown_tiers_mins: Vec<i64>,
}

impl Default for GateSection {
    fn default() -> Self {
        Self {
            min_interval_mins: 90,
            cooldown_tiers_mins: vec![120, 360],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupSection {
    pub title_threshold: f64,
    pub content_threshold: f64,
    pub shingle_size: usize,
    pub lookback_days: i64,
    pub lookback_records: usize,
}

impl Default for DedupSection {
    fn default() -> Self {
        Self {
            title_threshold: 0.8,
            content_threshold: 0.5,
            shingle_size: 3,
            lookback_days: 14,
            lookback_records: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacklogSection {
    pub max_age_hours: i64,
    /// How long a key dropped after a failure is refused on later fetches.
    pub dropped_retention_hours: i64,
    pub dropped_max_records: usize,
}

impl Default for BacklogSection {
    fn default() -> Self {
        Self {
            max_age_hours: 48,
            dropped_retention_hours: 168,
            dropped_max_records: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSection {
    pub feeds: Vec<FeedSpec>,
    pub max_items: usize,
    pub source_whitelist: Vec<String>,
    pub blocked_keywords: Vec<String>,
    pub max_item_age_hours: i64,
}

impl Default for IngestSection {
    fn default() -> Self {
        Self {
            feeds: Vec::new(),
            max_items: 30,
            source_whitelist: Vec::new(),
            blocked_keywords: Vec::new(),
            max_item_age_hours: 72,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeneratorKind {
    Template,
    OpenAi,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerateSection {
    pub provider: GeneratorKind,
    pub model: String,
    pub fetch_article: bool,
    pub max_post_chars: usize,
    /// Resolved from `OPENAI_API_KEY`; never read from the file.
    #[serde(skip)]
    pub api_key: String,
}

impl Default for GenerateSection {
    fn default() -> Self {
        Self {
            provider: GeneratorKind::Template,
            model: "gpt-4o-mini".to_string(),
            fetch_article: true,
            max_post_chars: 280,
            api_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PublisherKind {
    Webhook,
    DryRun,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishSection {
    pub kind: PublisherKind,
    pub webhook_url: Option<String>,
    pub max_retries: u8,
}

impl Default for PublishSection {
    fn default() -> Self {
        Self {
            kind: PublisherKind::DryRun,
            webhook_url: None,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSection {
    pub fetch_secs: u64,
    pub generate_secs: u64,
    pub publish_secs: u64,
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            fetch_secs: 20,
            generate_secs: 30,
            publish_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSection {
    pub textfile_path: Option<PathBuf>,
}

impl BotConfig {
    /// Load from an explicit TOML file, then apply env overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        let mut cfg: BotConfig = toml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Resolution order:
    /// 1) $NEWSDRIP_CONFIG_PATH (must exist)
    /// 2) config/newsdrip.toml
    /// 3) built-in defaults
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::load_from(&pb);
            }
            return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
        }
        let fallback = PathBuf::from(DEFAULT_CONFIG_PATH);
        if fallback.exists() {
            return Self::load_from(&fallback);
        }
        let mut cfg = BotConfig::default();
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(p) = std::env::var(ENV_STATE_PATH) {
            if !p.trim().is_empty() {
                self.store.path = PathBuf::from(p.trim());
            }
        }
        if let Ok(v) = std::env::var(ENV_MIN_INTERVAL) {
            self.gate.min_interval_mins = v
                .trim()
                .parse()
                .with_context(|| format!("{ENV_MIN_INTERVAL} is not an integer: {v}"))?;
        }
        // A webhook URL from the environment selects the webhook publisher;
        // NEWSDRIP_DRY_RUN still wins.
        if let Ok(url) = std::env::var(ENV_WEBHOOK_URL) {
            if !url.trim().is_empty() {
                self.publish.webhook_url = Some(url.trim().to_string());
                self.publish.kind = PublisherKind::Webhook;
            }
        }
        if let Ok(v) = std::env::var(ENV_DRY_RUN) {
            if matches!(v.trim(), "1" | "true" | "yes") {
                self.publish.kind = PublisherKind::DryRun;
            }
        }
        if let Ok(list) = std::env::var(ENV_FEEDS) {
            let feeds: Vec<FeedSpec> = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(FeedSpec::from_url)
                .collect();
            if !feeds.is_empty() {
                self.ingest.feeds = feeds;
            }
        }
        self.generate.api_key = std::env::var(ENV_OPENAI_KEY).unwrap_or_default();
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.gate.min_interval_mins < 0 {
            bail!("gate.min_interval_mins must not be negative");
        }
        if self.gate.cooldown_tiers_mins.is_empty() {
            bail!("gate.cooldown_tiers_mins needs at least one tier");
        }
        if self.gate.cooldown_tiers_mins.iter().any(|m| *m <= 0) {
            bail!("gate.cooldown_tiers_mins must be positive");
        }
        if self.backlog.max_age_hours <= 0 {
            bail!("backlog.max_age_hours must be positive");
        }
        if self.backlog.dropped_retention_hours < 0 {
            bail!("backlog.dropped_retention_hours must not be negative");
        }
        let spans = [
            ("gate.min_interval_mins", self.gate.min_interval_mins),
            ("backlog.max_age_hours", self.backlog.max_age_hours.saturating_mul(60)),
            (
                "backlog.dropped_retention_hours",
                self.backlog.dropped_retention_hours.saturating_mul(60),
            ),
            ("ingest.max_item_age_hours", self.ingest.max_item_age_hours.saturating_mul(60)),
            ("dedup.lookback_days", self.dedup.lookback_days.saturating_mul(24 * 60)),
        ];
        for (name, mins) in spans {
            if mins > MAX_SPAN_MINS {
                bail!("{name} is longer than a year");
            }
        }
        if self.gate.cooldown_tiers_mins.iter().any(|m| *m > MAX_SPAN_MINS) {
            bail!("gate.cooldown_tiers_mins entries must be at most a year");
        }
        self.publish.max_retries = self.publish.max_retries.clamp(1, MAX_PUBLISH_RETRIES);
        if self.publish.kind == PublisherKind::Webhook && self.publish.webhook_url.is_none() {
            bail!("publish.kind = \"webhook\" needs publish.webhook_url or {ENV_WEBHOOK_URL}");
        }
        self.dedup.title_threshold = self.dedup.title_threshold.clamp(0.0, 1.0);
        self.dedup.content_threshold = self.dedup.content_threshold.clamp(0.0, 1.0);
        Ok(())
    }

    pub fn cooldown_policy(&self) -> CooldownPolicy {
        CooldownPolicy::new(
            minutes(self.gate.min_interval_mins),
            self.gate
                .cooldown_tiers_mins
                .iter()
                .map(|m| minutes(*m))
                .collect(),
        )
    }

    pub fn dedup_params(&self) -> DedupParams {
        DedupParams {
            title_threshold: self.dedup.title_threshold,
            content_threshold: self.dedup.content_threshold,
            shingle_size: self.dedup.shingle_size,
            lookback: minutes(self.dedup.lookback_days.saturating_mul(24 * 60)),
            lookback_records: self.dedup.lookback_records,
        }
    }

    pub fn candidate_filter(&self) -> CandidateFilter {
        CandidateFilter {
            source_whitelist: self.ingest.source_whitelist.clone(),
            blocked_keywords: self.ingest.blocked_keywords.clone(),
            max_item_age: (self.ingest.max_item_age_hours > 0)
                .then(|| minutes(self.ingest.max_item_age_hours.saturating_mul(60))),
        }
    }

    pub fn backlog_max_age(&self) -> Duration {
        minutes(self.backlog.max_age_hours.saturating_mul(60))
    }

    pub fn dropped_retention(&self) -> Duration {
        minutes(self.backlog.dropped_retention_hours.saturating_mul(60))
    }

    pub fn fetch_timeout(&self) -> StdDuration {
        StdDuration::from_secs(self.timeouts.fetch_secs)
    }

    pub fn generate_timeout(&self) -> StdDuration {
        StdDuration::from_secs(self.timeouts.generate_secs)
    }

    pub fn publish_timeout(&self) -> StdDuration {
        StdDuration::from_secs(self.timeouts.publish_secs)
    }
}

/// Configured span in minutes, clamped into `0..=MAX_SPAN_MINS`.
fn minutes(m: i64) -> Duration {
    Duration::minutes(m.clamp(0, MAX_SPAN_MINS))
}
