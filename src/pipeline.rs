//! One end-to-end run: gate, fetch, filter, dedupe, enqueue, evict, then try queued
//! items oldest-first until one is posted or the queue runs dry.
//!
//! The snapshot is loaded once at the start and saved once at every exit that
//! changed something; a gate-blocked run touches nothing.

use std::future::Future;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use metrics::{counter, gauge};
use tracing::{debug, error, info, warn};

use crate::config::{BotConfig, GeneratorKind, PublisherKind};
use crate::cooldown::{CooldownGate, GateDecision};
use crate::dedup::DuplicateDetector;
use crate::generate::{openai::OpenAiGenerator, ContentGenerator, GenerateError, TemplateGenerator};
use crate::ingest::{
    filter_candidates,
    rss::RssSource,
    types::{CandidateItem, NewsSource},
    CandidateFilter,
};
use crate::metrics::ensure_metrics_described;
use crate::publish::{webhook::WebhookPublisher, DryRunPublisher, PublishError, Publisher};
use crate::store::{PersistentStore, StoreSnapshot};

/// Final state of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Posted { key: String },
    SkippedCooldown,
    SkippedEmptyQueue,
    SourceUnavailable,
    GeneratorUnavailable,
    RateLimited,
    Error(String),
}

impl RunStatus {
    pub fn label(&self) -> &'static str {
        match self {
            RunStatus::Posted { .. } => "posted",
            RunStatus::SkippedCooldown => "skipped_cooldown",
            RunStatus::SkippedEmptyQueue => "skipped_empty_queue",
            RunStatus::SourceUnavailable => "source_unavailable",
            RunStatus::GeneratorUnavailable => "generator_unavailable",
            RunStatus::RateLimited => "rate_limited",
            RunStatus::Error(_) => "error",
        }
    }

    /// 0 for anything the next trigger can simply retry; 1 for internal errors.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Error(_) => 1,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub status: RunStatus,
    pub fetched: usize,
    pub filtered: usize,
    pub rejected: usize,
    pub accepted: usize,
    pub evicted: usize,
    pub skipped: usize,
}

impl RunReport {
    fn new(status: RunStatus) -> Self {
        Self {
            status,
            fetched: 0,
            filtered: 0,
            rejected: 0,
            accepted: 0,
            evicted: 0,
            skipped: 0,
        }
    }
}

/// Knobs the orchestrator needs beyond its components.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub max_items: usize,
    pub backlog_max_age: Duration,
    pub excerpt_max_chars: usize,
    pub fetch_timeout: StdDuration,
    pub generate_timeout: StdDuration,
    pub publish_timeout: StdDuration,
    /// How long a dropped item's key keeps it from being queued again.
    pub dropped_retention: Duration,
    pub dropped_max_records: usize,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            max_items: 30,
            backlog_max_age: Duration::hours(48),
            excerpt_max_chars: 500,
            fetch_timeout: StdDuration::from_secs(20),
            generate_timeout: StdDuration::from_secs(30),
            publish_timeout: StdDuration::from_secs(15),
            dropped_retention: Duration::days(7),
            dropped_max_records: 1_000,
        }
    }
}

pub struct Pipeline {
    store: PersistentStore,
    gate: CooldownGate,
    detector: DuplicateDetector,
    filter: CandidateFilter,
    settings: RunSettings,
    source: Box<dyn NewsSource>,
    generator: Box<dyn ContentGenerator>,
    publisher: Box<dyn Publisher>,
}

/// Short, stable id for logging an item without its URL.
pub fn short_id(key: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(key.as_bytes());
    let mut out = String::with_capacity(12);
    for b in digest.iter().take(6) {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

/// Await `fut` for at most `limit`; `None` on timeout.
async fn bounded<T>(limit: StdDuration, fut: impl Future<Output = T>) -> Option<T> {
    tokio::time::timeout(limit, fut).await.ok()
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: PersistentStore,
        gate: CooldownGate,
        detector: DuplicateDetector,
        filter: CandidateFilter,
        settings: RunSettings,
        source: Box<dyn NewsSource>,
        generator: Box<dyn ContentGenerator>,
        publisher: Box<dyn Publisher>,
    ) -> Self {
        Self {
            store,
            gate,
            detector,
            filter,
            settings,
            source,
            generator,
            publisher,
        }
    }

    /// Wire the real adapters from configuration.
    pub fn from_config(cfg: &BotConfig) -> Result<Self> {
        let source: Box<dyn NewsSource> = Box::new(RssSource::from_feeds(
            cfg.ingest.feeds.clone(),
            cfg.fetch_timeout(),
        )?);

        let generator: Box<dyn ContentGenerator> = match cfg.generate.provider {
            GeneratorKind::Template => {
                Box::new(TemplateGenerator::new(cfg.generate.max_post_chars))
            }
            GeneratorKind::OpenAi => Box::new(OpenAiGenerator::new(
                cfg.generate.api_key.clone(),
                &cfg.generate.model,
                cfg.generate.fetch_article,
                cfg.generate.max_post_chars,
                cfg.generate_timeout(),
            )?),
        };

        let publisher: Box<dyn Publisher> = match (cfg.publish.kind, &cfg.publish.webhook_url) {
            (PublisherKind::Webhook, Some(url)) => Box::new(
                WebhookPublisher::new(url.clone())
                    .with_timeout(cfg.publish_timeout())
                    .with_retries(cfg.publish.max_retries),
            ),
            _ => Box::new(DryRunPublisher::new()),
        };

        let settings = RunSettings {
            max_items: cfg.ingest.max_items,
            backlog_max_age: cfg.backlog_max_age(),
            excerpt_max_chars: cfg.store.excerpt_max_chars,
            fetch_timeout: cfg.fetch_timeout(),
            generate_timeout: cfg.generate_timeout(),
            publish_timeout: cfg.publish_timeout(),
            dropped_retention: cfg.dropped_retention(),
            dropped_max_records: cfg.backlog.dropped_max_records,
        };

        Ok(Self::new(
            PersistentStore::new(cfg.store.path.clone()),
            CooldownGate::new(cfg.cooldown_policy()),
            DuplicateDetector::new(cfg.dedup_params()),
            cfg.candidate_filter(),
            settings,
            source,
            generator,
            publisher,
        ))
    }

    pub fn store(&self) -> &PersistentStore {
        &self.store
    }

    /// Execute one scheduled run at `now`.
    pub async fn run_once(&self, now: DateTime<Utc>) -> RunReport {
        ensure_metrics_described();
        let report = self.run_inner(now).await;

        counter!("newsdrip_runs_total", "status" => report.status.label()).increment(1);
        info!(
            target: "pipeline",
            status = report.status.label(),
            fetched = report.fetched,
            filtered = report.filtered,
            rejected = report.rejected,
            accepted = report.accepted,
            evicted = report.evicted,
            skipped = report.skipped,
            "run finished"
        );
        report
    }

    async fn run_inner(&self, now: DateTime<Utc>) -> RunReport {
        let mut snapshot = self.store.load();

        match self.gate.check(&snapshot.cooldown, now) {
            GateDecision::Ready => {}
            GateDecision::IntervalNotElapsed { next_allowed } => {
                info!(target: "gate", %next_allowed, "minimum interval not elapsed");
                return RunReport::new(RunStatus::SkippedCooldown);
            }
            GateDecision::Cooling { level, until } => {
                info!(target: "gate", level, %until, "cooldown active");
                return RunReport::new(RunStatus::SkippedCooldown);
            }
        }

        let mut report = RunReport::new(RunStatus::SkippedEmptyQueue);

        // Fetch
        let fetched = match bounded(
            self.settings.fetch_timeout,
            self.source.fetch(self.settings.max_items),
        )
        .await
        {
            Some(Ok(items)) => items,
            Some(Err(e)) => {
                warn!(target: "pipeline", error = ?e, source = self.source.name(), "fetch failed");
                let report = report.with(RunStatus::SourceUnavailable);
                return self.finish(snapshot, now, false, false, report);
            }
            None => {
                warn!(target: "pipeline", source = self.source.name(), "fetch timed out");
                let report = report.with(RunStatus::SourceUnavailable);
                return self.finish(snapshot, now, false, false, report);
            }
        };
        report.fetched = fetched.len();
        counter!("newsdrip_candidates_fetched_total").increment(fetched.len() as u64);

        let forgotten = snapshot.prune_skipped(
            now,
            self.settings.dropped_retention,
            self.settings.dropped_max_records,
        );
        if forgotten > 0 {
            debug!(target: "store", forgotten, "dropped keys aged out");
        }

        // Filter + dedupe + enqueue
        let (kept, filtered) = filter_candidates(now, fetched, &self.filter);
        report.filtered = filtered;
        self.admit(&mut snapshot, now, kept, &mut report);

        // Evict
        let evicted = snapshot
            .queued_items
            .evict_stale(now, self.settings.backlog_max_age);
        if !evicted.is_empty() {
            report.evicted = evicted.len();
            counter!("newsdrip_backlog_evicted_total").increment(evicted.len() as u64);
            for e in &evicted {
                debug!(
                    target: "backlog",
                    id = %short_id(e.key()),
                    enqueued_at = %e.enqueued_at,
                    "evicted stale entry"
                );
            }
        }

        // Select, generate, publish
        while let Some(entry) = snapshot.queued_items.peek_next().cloned() {
            let id = short_id(entry.key());

            let generated = bounded(
                self.settings.generate_timeout,
                self.generator.generate(&entry.item),
            )
            .await;
            let text = match generated {
                Some(Ok(text)) => text,
                Some(Err(GenerateError::Quota(msg))) => {
                    warn!(target: "pipeline", %id, %msg, "generator out of quota, keeping item");
                    let report = report.with(RunStatus::GeneratorUnavailable);
                    return self.finish(snapshot, now, false, false, report);
                }
                Some(Err(e)) => {
                    warn!(
                        target: "pipeline",
                        %id,
                        kind = e.kind(),
                        error = %e,
                        "generation failed, dropping item"
                    );
                    self.drop_item(&mut snapshot, now, entry.key(), e.kind(), &mut report);
                    continue;
                }
                None => {
                    warn!(target: "pipeline", %id, "generation timed out, dropping item");
                    let reason = "generate_timeout";
                    self.drop_item(&mut snapshot, now, entry.key(), reason, &mut report);
                    continue;
                }
            };

            match bounded(self.settings.publish_timeout, self.publisher.publish(&text)).await {
                Some(Ok(())) => {
                    snapshot.queued_items.dequeue(entry.key());
                    snapshot.record_published(&entry, now, self.settings.excerpt_max_chars);
                    counter!("newsdrip_posts_total").increment(1);
                    info!(
                        target: "pipeline",
                        %id,
                        source = %entry.item.source,
                        publisher = self.publisher.name(),
                        "posted"
                    );
                    let status = RunStatus::Posted {
                        key: entry.item.key.clone(),
                    };
                    return self.finish(snapshot, now, true, false, report.with(status));
                }
                Some(Err(PublishError::RateLimited { retry_after })) => {
                    counter!("newsdrip_rate_limited_total").increment(1);
                    self.gate
                        .record_run_outcome(&mut snapshot.cooldown, now, false, true);
                    if let Some(hint) = retry_after.and_then(|d| Duration::from_std(d).ok()) {
                        self.gate.extend_cooldown(&mut snapshot.cooldown, now + hint);
                    }
                    return self.save_and_report(snapshot, report.with(RunStatus::RateLimited));
                }
                Some(Err(PublishError::Other(msg))) => {
                    warn!(target: "pipeline", %id, %msg, "publish failed, dropping item");
                    let reason = "publish_failed";
                    self.drop_item(&mut snapshot, now, entry.key(), reason, &mut report);
                }
                None => {
                    warn!(target: "pipeline", %id, "publish timed out, dropping item");
                    let reason = "publish_timeout";
                    self.drop_item(&mut snapshot, now, entry.key(), reason, &mut report);
                }
            }
        }

        info!(target: "pipeline", "nothing left to post");
        self.finish(snapshot, now, false, false, report)
    }

    /// Dedupe each candidate against the live backlog and history, enqueueing survivors.
    fn admit(
        &self,
        snapshot: &mut StoreSnapshot,
        now: DateTime<Utc>,
        candidates: Vec<CandidateItem>,
        report: &mut RunReport,
    ) {
        for item in candidates {
            let verdict = self
                .detector
                .check(now, &item, &snapshot.queued_items, snapshot.history());
            if verdict.is_duplicate() {
                report.rejected += 1;
                counter!("newsdrip_candidates_rejected_total", "reason" => verdict.reason())
                    .increment(1);
                debug!(
                    target: "dedup",
                    id = %short_id(&item.key),
                    reason = verdict.reason(),
                    ?verdict,
                    "rejected"
                );
                continue;
            }
            debug!(target: "dedup", id = %short_id(&item.key), "accepted");
            snapshot.queued_items.enqueue(item, now);
            report.accepted += 1;
        }
    }

    /// Remove a failed item from the backlog and remember its key, so the next
    /// fetch of the same entry is rejected instead of tried again.
    fn drop_item(
        &self,
        snapshot: &mut StoreSnapshot,
        now: DateTime<Utc>,
        key: &str,
        reason: &'static str,
        report: &mut RunReport,
    ) {
        snapshot.queued_items.dequeue(key);
        snapshot.record_skipped(key, reason, now);
        report.skipped += 1;
        counter!("newsdrip_items_skipped_total", "reason" => reason).increment(1);
    }

    /// Record the outcome on the gate, then save.
    fn finish(
        &self,
        mut snapshot: StoreSnapshot,
        now: DateTime<Utc>,
        succeeded: bool,
        was_rate_limited: bool,
        report: RunReport,
    ) -> RunReport {
        self.gate
            .record_run_outcome(&mut snapshot.cooldown, now, succeeded, was_rate_limited);
        self.save_and_report(snapshot, report)
    }

    fn save_and_report(&self, snapshot: StoreSnapshot, report: RunReport) -> RunReport {
        gauge!("newsdrip_backlog_len").set(snapshot.queued_items.len() as f64);
        match self.store.save(&snapshot) {
            Ok(()) => report,
            Err(e) => {
                error!(target: "store", error = ?e, "saving state failed");
                report.with(RunStatus::Error(format!("{e:#}")))
            }
        }
    }
}

impl RunReport {
    fn with(mut self, status: RunStatus) -> Self {
        self.status = status;
        self
    }
}
