// tests/pipeline_run.rs
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use newsdrip::cooldown::{CooldownGate, CooldownPolicy};
use newsdrip::dedup::{DedupParams, DuplicateDetector};
use newsdrip::generate::{ContentGenerator, GenerateError};
use newsdrip::ingest::types::{CandidateItem, NewsSource};
use newsdrip::ingest::CandidateFilter;
use newsdrip::pipeline::RunSettings;
use newsdrip::publish::{PublishError, Publisher};
use newsdrip::{PersistentStore, Pipeline, RunStatus};
use tempfile::TempDir;

fn t(min: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap() + Duration::minutes(min)
}

fn item(key: &str, title: &str) -> CandidateItem {
    CandidateItem {
        key: key.into(),
        title: title.into(),
        excerpt: String::new(),
        published_at: None,
        source: "Wire".into(),
    }
}

struct FixedSource {
    items: Option<Vec<CandidateItem>>,
    delay: Option<StdDuration>,
}

#[async_trait]
impl NewsSource for FixedSource {
    async fn fetch(&self, max_items: usize) -> Result<Vec<CandidateItem>> {
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        match &self.items {
            Some(v) => Ok(v.iter().take(max_items).cloned().collect()),
            None => Err(anyhow!("feed down")),
        }
    }
    fn name(&self) -> &'static str {
        "fixed"
    }
}

#[derive(Default)]
struct ScriptedGenerator {
    unreachable: HashSet<String>,
    quota: bool,
    attempts: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl ContentGenerator for ScriptedGenerator {
    async fn generate(&self, item: &CandidateItem) -> Result<String, GenerateError> {
        self.attempts.lock().unwrap().push(item.key.clone());
        if self.quota {
            return Err(GenerateError::Quota("no credits".into()));
        }
        if self.unreachable.contains(&item.key) {
            return Err(GenerateError::Unreachable(item.key.clone()));
        }
        Ok(format!("{} {}", item.title, item.key))
    }
    fn name(&self) -> &'static str {
        "scripted"
    }
}

enum Outcome {
    RateLimited,
    Fail,
}

#[derive(Clone, Default)]
struct Recorder {
    sent: Arc<Mutex<Vec<String>>>,
    script: Arc<Mutex<VecDeque<Outcome>>>,
}

#[async_trait]
impl Publisher for Recorder {
    async fn publish(&self, text: &str) -> Result<(), PublishError> {
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Outcome::RateLimited) => Err(PublishError::RateLimited { retry_after: None }),
            Some(Outcome::Fail) => Err(PublishError::Other("500".into())),
            None => {
                self.sent.lock().unwrap().push(text.to_string());
                Ok(())
            }
        }
    }
    fn name(&self) -> &'static str {
        "recorder"
    }
}

struct Harness {
    dir: TempDir,
    publisher: Recorder,
}

impl Harness {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            publisher: Recorder::default(),
        }
    }

    fn store(&self) -> PersistentStore {
        PersistentStore::new(self.dir.path().join("state.json"))
    }

    fn pipeline(&self, source: FixedSource, generator: ScriptedGenerator) -> Pipeline {
        Pipeline::new(
            self.store(),
            CooldownGate::new(CooldownPolicy::new(
                Duration::minutes(90),
                vec![Duration::minutes(120), Duration::minutes(360)],
            )),
            DuplicateDetector::new(DedupParams {
                title_threshold: 0.7,
                ..DedupParams::default()
            }),
            CandidateFilter::default(),
            RunSettings {
                fetch_timeout: StdDuration::from_secs(5),
                ..RunSettings::default()
            },
            Box::new(source),
            Box::new(generator),
            Box::new(self.publisher.clone()),
        )
    }

    fn feed(&self, items: Vec<CandidateItem>) -> Pipeline {
        self.pipeline(
            FixedSource {
                items: Some(items),
                delay: None,
            },
            ScriptedGenerator::default(),
        )
    }

    fn script(&self, outcomes: Vec<Outcome>) {
        self.publisher.script.lock().unwrap().extend(outcomes);
    }

    fn sent(&self) -> Vec<String> {
        self.publisher.sent.lock().unwrap().clone()
    }
}

#[tokio::test]
async fn posts_oldest_item_and_keeps_the_rest() {
    let h = Harness::new();
    let p = h.feed(vec![
        item("https://e.com/a", "Alpha launches rocket"),
        item("https://e.com/b", "Beta opens office"),
    ]);

    let report = p.run_once(t(0)).await;
    assert_eq!(
        report.status,
        RunStatus::Posted {
            key: "https://e.com/a".into()
        }
    );
    assert_eq!(report.accepted, 2);
    assert_eq!(h.sent().len(), 1);

    let snap = h.store().load();
    assert_eq!(snap.cooldown.last_run_time, Some(t(0)));
    assert!(snap.published_uris.contains("https://e.com/a"));
    assert_eq!(snap.queued_items.len(), 1);
    assert_eq!(
        snap.queued_items.peek_next().map(|e| e.key()),
        Some("https://e.com/b")
    );
}

#[tokio::test]
async fn gate_blocked_run_leaves_state_untouched() {
    let h = Harness::new();
    h.feed(vec![item("https://e.com/a", "Alpha launches rocket")])
        .run_once(t(0))
        .await;
    let before = std::fs::read_to_string(h.store().path()).unwrap();

    let report = h
        .feed(vec![item("https://e.com/z", "Zeta merges")])
        .run_once(t(60))
        .await;
    assert_eq!(report.status, RunStatus::SkippedCooldown);
    assert_eq!(report.fetched, 0);
    let after = std::fs::read_to_string(h.store().path()).unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn fetch_failure_does_not_advance_last_run_time() {
    let h = Harness::new();
    h.feed(vec![item("https://e.com/a", "Alpha launches rocket")])
        .run_once(t(0))
        .await;

    let down = h.pipeline(
        FixedSource {
            items: None,
            delay: None,
        },
        ScriptedGenerator::default(),
    );
    let report = down.run_once(t(100)).await;
    assert_eq!(report.status, RunStatus::SourceUnavailable);
    assert_eq!(report.status.exit_code(), 0);
    assert_eq!(h.store().load().cooldown.last_run_time, Some(t(0)));

    // Next trigger is not delayed by the failed attempt
    let report = h
        .feed(vec![item("https://e.com/b", "Beta opens office")])
        .run_once(t(101))
        .await;
    assert!(matches!(report.status, RunStatus::Posted { .. }));
}

#[tokio::test(start_paused = true)]
async fn fetch_timeout_counts_as_source_failure() {
    let h = Harness::new();
    let slow = h.pipeline(
        FixedSource {
            items: Some(vec![item("https://e.com/a", "Alpha launches rocket")]),
            delay: Some(StdDuration::from_secs(60)),
        },
        ScriptedGenerator::default(),
    );
    let report = slow.run_once(t(0)).await;
    assert_eq!(report.status, RunStatus::SourceUnavailable);
    assert!(h.store().load().queued_items.is_empty());
}

#[tokio::test]
async fn rate_limit_cools_down_then_recovers() {
    let h = Harness::new();
    h.feed(vec![item("https://e.com/a", "Alpha launches rocket")])
        .run_once(t(0))
        .await;

    // t=100: rate limited
    h.script(vec![Outcome::RateLimited]);
    let report = h
        .feed(vec![item("https://e.com/b", "Beta opens office")])
        .run_once(t(100))
        .await;
    assert_eq!(report.status, RunStatus::RateLimited);
    let snap = h.store().load();
    assert_eq!(snap.cooldown.escalation_level, 1);
    assert_eq!(snap.cooldown.cooldown_until, Some(t(100 + 120)));
    assert_eq!(snap.cooldown.last_run_time, Some(t(0)));
    assert_eq!(snap.queued_items.len(), 1, "item stays queued");

    // t=105: blocked
    let report = h.feed(vec![]).run_once(t(105)).await;
    assert_eq!(report.status, RunStatus::SkippedCooldown);

    // t=221: succeeds and resets
    let report = h.feed(vec![]).run_once(t(221)).await;
    assert_eq!(
        report.status,
        RunStatus::Posted {
            key: "https://e.com/b".into()
        }
    );
    let snap = h.store().load();
    assert_eq!(snap.cooldown.escalation_level, 0);
    assert_eq!(snap.cooldown.cooldown_until, None);
    assert_eq!(snap.cooldown.last_run_time, Some(t(221)));
}

#[tokio::test]
async fn consecutive_rate_limits_escalate() {
    let h = Harness::new();
    h.script(vec![Outcome::RateLimited, Outcome::RateLimited]);
    let p = h.feed(vec![item("https://e.com/a", "Alpha launches rocket")]);

    p.run_once(t(0)).await;
    let first = h.store().load().cooldown.cooldown_until.unwrap();
    p.run_once(t(121)).await;
    let snap = h.store().load();
    assert_eq!(snap.cooldown.escalation_level, 2);
    assert!(snap.cooldown.cooldown_until.unwrap() >= first);
    assert_eq!(snap.cooldown.cooldown_until, Some(t(121 + 360)));
    assert_eq!(snap.cooldown.last_run_time, None);
}

#[tokio::test]
async fn unreachable_content_skips_to_next_item_without_cooldown() {
    let h = Harness::new();
    let p = h.pipeline(
        FixedSource {
            items: Some(vec![
                item("https://e.com/dead", "Dead link story"),
                item("https://e.com/live", "Live link story about chips"),
            ]),
            delay: None,
        },
        ScriptedGenerator {
            unreachable: HashSet::from(["https://e.com/dead".to_string()]),
            quota: false,
            ..ScriptedGenerator::default()
        },
    );
    let report = p.run_once(t(0)).await;
    assert_eq!(
        report.status,
        RunStatus::Posted {
            key: "https://e.com/live".into()
        }
    );
    assert_eq!(report.skipped, 1);
    let snap = h.store().load();
    assert!(snap.queued_items.is_empty(), "dead item is not re-queued");
    assert_eq!(snap.cooldown.escalation_level, 0);
    assert_eq!(snap.cooldown.cooldown_until, None);
}

#[tokio::test]
async fn generator_quota_keeps_item_and_does_not_escalate() {
    let h = Harness::new();
    let p = h.pipeline(
        FixedSource {
            items: Some(vec![item("https://e.com/a", "Alpha launches rocket")]),
            delay: None,
        },
        ScriptedGenerator {
            unreachable: HashSet::new(),
            quota: true,
            ..ScriptedGenerator::default()
        },
    );
    let report = p.run_once(t(0)).await;
    assert_eq!(report.status, RunStatus::GeneratorUnavailable);
    let snap = h.store().load();
    assert_eq!(snap.queued_items.len(), 1);
    assert_eq!(snap.cooldown.last_run_time, None);
    assert_eq!(snap.cooldown.escalation_level, 0);
}

#[tokio::test]
async fn other_publish_failure_drops_item_and_tries_next() {
    let h = Harness::new();
    h.script(vec![Outcome::Fail]);
    let report = h
        .feed(vec![
            item("https://e.com/a", "Alpha launches rocket"),
            item("https://e.com/b", "Beta opens office"),
        ])
        .run_once(t(0))
        .await;
    assert_eq!(
        report.status,
        RunStatus::Posted {
            key: "https://e.com/b".into()
        }
    );
    assert_eq!(report.skipped, 1);
    assert!(h.store().load().queued_items.is_empty());
}

#[tokio::test]
async fn all_items_failing_ends_with_empty_queue() {
    let h = Harness::new();
    h.script(vec![Outcome::Fail, Outcome::Fail]);
    let report = h
        .feed(vec![
            item("https://e.com/a", "Alpha launches rocket"),
            item("https://e.com/b", "Beta opens office"),
        ])
        .run_once(t(0))
        .await;
    assert_eq!(report.status, RunStatus::SkippedEmptyQueue);
    assert_eq!(report.skipped, 2);
    assert_eq!(h.store().load().cooldown.last_run_time, None);
}

#[tokio::test]
async fn same_key_across_runs_is_queued_or_published_once() {
    let h = Harness::new();
    let feed = vec![
        item("https://e.com/a", "Alpha launches rocket"),
        item("https://e.com/b", "Beta opens office"),
    ];
    h.feed(feed.clone()).run_once(t(0)).await;
    let report = h.feed(feed).run_once(t(90)).await;
    assert_eq!(report.rejected, 2);
    assert_eq!(report.accepted, 0);

    let snap = h.store().load();
    for key in ["https://e.com/a", "https://e.com/b"] {
        let queued = snap.queued_items.iter().filter(|e| e.key() == key).count();
        let published = usize::from(snap.published_uris.contains(key));
        assert_eq!(queued + published, 1, "{key}");
    }
}

#[tokio::test]
async fn near_duplicate_headlines_in_one_batch_keep_the_first() {
    let h = Harness::new();
    h.script(vec![Outcome::Fail]);
    let report = h
        .feed(vec![
            item("u1", "X raises $5M"),
            item("u2", "x Raises $5 Million"),
        ])
        .run_once(t(0))
        .await;
    assert_eq!(report.accepted, 1);
    assert_eq!(report.rejected, 1);
}

#[tokio::test]
async fn stale_entries_are_evicted_before_selection() {
    let h = Harness::new();
    // Generator out of quota: the item is queued at t=0 but not posted.
    let stuck = h.pipeline(
        FixedSource {
            items: Some(vec![item("https://e.com/old", "Old story nobody posted")]),
            delay: None,
        },
        ScriptedGenerator {
            unreachable: HashSet::new(),
            quota: true,
            ..ScriptedGenerator::default()
        },
    );
    stuck.run_once(t(0)).await;
    assert_eq!(h.store().load().queued_items.len(), 1);

    // 49h later the leftover is too old to post.
    let report = h.feed(vec![]).run_once(t(49 * 60)).await;
    assert_eq!(report.evicted, 1);
    assert_eq!(report.status, RunStatus::SkippedEmptyQueue);
    assert!(h.sent().is_empty());
    assert!(h.store().load().queued_items.is_empty());
}

#[tokio::test]
async fn unwritable_store_reports_error() {
    let h = Harness::new();
    // A directory where the state file should be makes the rename fail.
    std::fs::create_dir_all(h.store().path()).unwrap();
    let report = h
        .feed(vec![item("https://e.com/a", "Alpha launches rocket")])
        .run_once(t(0))
        .await;
    assert!(matches!(report.status, RunStatus::Error(_)));
    assert_eq!(report.status.exit_code(), 1);
}

#[tokio::test]
async fn unreachable_item_is_not_retried_on_later_runs() {
    let h = Harness::new();
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let feed = vec![
        item("https://e.com/dead", "Dead link story"),
        item("https://e.com/l1", "Harbor reopens after storm"),
        item("https://e.com/l2", "Council approves new budget"),
        item("https://e.com/l3", "Museum unveils rare painting"),
    ];

    let mut statuses = Vec::new();
    for run in 0..6 {
        let p = h.pipeline(
            FixedSource {
                items: Some(feed.clone()),
                delay: None,
            },
            ScriptedGenerator {
                unreachable: HashSet::from(["https://e.com/dead".to_string()]),
                attempts: attempts.clone(),
                ..ScriptedGenerator::default()
            },
        );
        let report = p.run_once(t(run * 100)).await;
        if run > 0 {
            assert_eq!(report.skipped, 0, "run {run}");
        }
        statuses.push(report.status);
    }

    let dead_tries = attempts
        .lock()
        .unwrap()
        .iter()
        .filter(|k| k.as_str() == "https://e.com/dead")
        .count();
    assert_eq!(dead_tries, 1);
    assert_eq!(h.sent().len(), 3);
    assert!(statuses[3..]
        .iter()
        .all(|s| *s == RunStatus::SkippedEmptyQueue));

    let snap = h.store().load();
    assert!(snap.history().was_dropped("https://e.com/dead"));
    assert!(!snap.queued_items.contains_key("https://e.com/dead"));
}

#[tokio::test]
async fn failed_publish_is_not_sent_again_on_later_runs() {
    let h = Harness::new();
    h.script(vec![Outcome::Fail]);
    let feed = vec![item("https://e.com/bad", "Post the platform refuses")];

    let first = h.feed(feed.clone()).run_once(t(0)).await;
    assert_eq!(first.status, RunStatus::SkippedEmptyQueue);
    assert_eq!(first.skipped, 1);

    for run in 1..4 {
        let report = h.feed(feed.clone()).run_once(t(run * 100)).await;
        assert_eq!(report.rejected, 1, "run {run}");
        assert_eq!(report.accepted, 0, "run {run}");
        assert_eq!(report.status, RunStatus::SkippedEmptyQueue);
    }
    assert!(h.sent().is_empty());
}

#[tokio::test]
async fn dropped_key_is_accepted_again_after_retention() {
    let h = Harness::new();
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let feed = vec![item("https://e.com/flaky", "Flaky site story")];
    let run = |now: DateTime<Utc>| {
        let p = h.pipeline(
            FixedSource {
                items: Some(feed.clone()),
                delay: None,
            },
            ScriptedGenerator {
                unreachable: HashSet::from(["https://e.com/flaky".to_string()]),
                attempts: attempts.clone(),
                ..ScriptedGenerator::default()
            },
        );
        async move { p.run_once(now).await }
    };

    let _ = run(t(0)).await;
    let _ = run(t(24 * 60)).await;
    assert_eq!(attempts.lock().unwrap().len(), 1);

    // Default retention is 7 days.
    let report = run(t(8 * 24 * 60)).await;
    assert_eq!(report.accepted, 1);
    assert_eq!(attempts.lock().unwrap().len(), 2);
}
