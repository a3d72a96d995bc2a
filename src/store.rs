//! Durable state document: gate state, publish history and the backlog.
//!
//! Every run does `load -> mutate in memory -> save`. Saves are staged into a
//! sibling temp file, flushed, then renamed over the canonical path, so readers
//! only ever see a complete document. Loading never fails: a missing or
//! unreadable document yields a fresh snapshot.

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backlog::{Backlog, QueueEntry};
use crate::cooldown::CooldownState;

/// A successfully published item. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishedRecord {
    pub key: String,
    pub title: String,
    pub source: String,
    #[serde(default)]
    pub excerpt: String,
    pub published_at: Option<DateTime<Utc>>,
    pub posted_at: DateTime<Utc>,
}

/// A queued item that was given up on after a generation or publish failure.
///
/// Kept for a while so the same feed entry is not queued and tried again on
/// every run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkippedRecord {
    pub key: String,
    pub reason: String,
    pub dropped_at: DateTime<Utc>,
}

/// The whole persisted document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreSnapshot {
    pub cooldown: CooldownState,
    pub published_uris: BTreeSet<String>,
    pub published_history: Vec<PublishedRecord>,
    pub queued_items: Backlog,
    pub skipped_items: Vec<SkippedRecord>,
}

/// Read-only view over what has already been published.
#[derive(Debug, Clone, Copy)]
pub struct HistoryView<'a> {
    pub uris: &'a BTreeSet<String>,
    pub records: &'a [PublishedRecord],
    pub skipped: &'a [SkippedRecord],
}

impl<'a> HistoryView<'a> {
    pub fn contains_key(&self, key: &str) -> bool {
        self.uris.contains(key)
    }

    /// The key was dropped after a failure and has not aged out yet.
    pub fn was_dropped(&self, key: &str) -> bool {
        self.skipped.iter().any(|r| r.key == key)
    }

    /// Newest records posted at or after `since`, at most `max_records` of them.
    pub fn recent(
        &self,
        since: DateTime<Utc>,
        max_records: usize,
    ) -> impl Iterator<Item = &'a PublishedRecord> {
        let records: &'a [PublishedRecord] = self.records;
        records
            .iter()
            .rev()
            .take(max_records)
            .filter(move |r| r.posted_at >= since)
    }
}

impl StoreSnapshot {
    pub fn history(&self) -> HistoryView<'_> {
        HistoryView {
            uris: &self.published_uris,
            records: &self.published_history,
            skipped: &self.skipped_items,
        }
    }

    /// Append the history record for a just-published entry.
    pub fn record_published(
        &mut self,
        entry: &QueueEntry,
        posted_at: DateTime<Utc>,
        excerpt_max_chars: usize,
    ) {
        let item = &entry.item;
        self.published_uris.insert(item.key.clone());
        self.published_history.push(PublishedRecord {
            key: item.key.clone(),
            title: item.title.clone(),
            source: item.source.clone(),
            excerpt: truncate_chars(&item.excerpt, excerpt_max_chars),
            published_at: item.published_at,
            posted_at,
        });
    }

    /// Remember a dropped key so later fetches of it are rejected.
    pub fn record_skipped(&mut self, key: &str, reason: &str, now: DateTime<Utc>) {
        self.skipped_items.retain(|r| r.key != key);
        self.skipped_items.push(SkippedRecord {
            key: key.to_string(),
            reason: reason.to_string(),
            dropped_at: now,
        });
    }

    /// Forget skipped keys older than `retention`, then keep at most the newest
    /// `max_records`. Returns how many were forgotten.
    pub fn prune_skipped(
        &mut self,
        now: DateTime<Utc>,
        retention: Duration,
        max_records: usize,
    ) -> usize {
        let before = self.skipped_items.len();
        let since = lookback_start(now, retention);
        self.skipped_items.retain(|r| r.dropped_at >= since);
        if self.skipped_items.len() > max_records {
            let excess = self.skipped_items.len() - max_records;
            self.skipped_items.drain(..excess);
        }
        before - self.skipped_items.len()
    }

    /// Re-establish document invariants after a load.
    ///
    /// Returns how many queue entries were dropped.
    pub fn repair(&mut self) -> usize {
        for r in &self.published_history {
            if !self.published_uris.contains(&r.key) {
                self.published_uris.insert(r.key.clone());
            }
        }

        let published = &self.published_uris;
        let mut seen: HashSet<String> = HashSet::new();
        let dropped = self
            .queued_items
            .retain(|e| !published.contains(e.key()) && seen.insert(e.key().to_string()));

        if let (Some(until), Some(last)) =
            (self.cooldown.cooldown_until, self.cooldown.last_run_time)
        {
            if until < last {
                self.cooldown.cooldown_until = Some(last);
            }
        }
        dropped
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// File-backed store for [`StoreSnapshot`].
#[derive(Debug, Clone)]
pub struct PersistentStore {
    path: PathBuf,
}

impl PersistentStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        self.path.with_extension("json.tmp")
    }

    /// Load the document, falling back to an empty snapshot on any problem.
    pub fn load(&self) -> StoreSnapshot {
        let raw = match fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(target: "store", path = %self.path.display(), "no state yet, starting fresh");
                return StoreSnapshot::default();
            }
            Err(e) => {
                warn!(target: "store", error = %e, "state unreadable, starting fresh");
                return StoreSnapshot::default();
            }
        };

        let mut snapshot: StoreSnapshot = match serde_json::from_str(&raw) {
            Ok(s) => s,
            Err(e) => {
                warn!(target: "store", error = %e, "state corrupt, starting fresh");
                self.preserve_corrupt(&raw);
                return StoreSnapshot::default();
            }
        };

        let dropped = snapshot.repair();
        if dropped > 0 {
            warn!(target: "store", dropped, "dropped already-published or repeated queue entries");
        }
        debug!(
            target: "store",
            queued = snapshot.queued_items.len(),
            history = snapshot.published_history.len(),
            "state loaded"
        );
        snapshot
    }

    /// Keep a copy of an unparseable document next to the canonical path; best-effort.
    fn preserve_corrupt(&self, raw: &str) {
        let backup = self.path.with_extension("json.corrupt");
        if let Err(e) = fs::write(&backup, raw) {
            warn!(target: "store", error = %e, "could not keep corrupt state copy");
        }
    }

    /// Write the full snapshot atomically.
    pub fn save(&self, snapshot: &StoreSnapshot) -> Result<()> {
        self.stage(snapshot)?.commit()
    }

    /// First half of `save`: serialize and flush to the temp file.
    ///
    /// Dropping the returned value without `commit` leaves the canonical document
    /// untouched, which is exactly what a crash between the two steps does.
    pub fn stage(&self, snapshot: &StoreSnapshot) -> Result<StagedWrite> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating state dir {}", dir.display()))?;
        }
        let tmp = self.temp_path();
        let json = serde_json::to_vec_pretty(snapshot).context("serializing state")?;
        let mut f = fs::File::create(&tmp)
            .with_context(|| format!("creating temp state {}", tmp.display()))?;
        f.write_all(&json).context("writing temp state")?;
        f.sync_all().context("flushing temp state")?;
        Ok(StagedWrite {
            tmp,
            target: self.path.clone(),
        })
    }
}

/// A fully written temp file waiting to replace the canonical document.
#[must_use = "a staged write does nothing until committed"]
#[derive(Debug)]
pub struct StagedWrite {
    tmp: PathBuf,
    target: PathBuf,
}

impl StagedWrite {
    pub fn commit(self) -> Result<()> {
        fs::rename(&self.tmp, &self.target).with_context(|| {
            format!(
                "replacing {} with {}",
                self.target.display(),
                self.tmp.display()
            )
        })?;
        debug!(target: "store", path = %self.target.display(), "state saved");
        Ok(())
    }
}

/// `now - window`, saturating at the earliest representable instant.
pub(crate) fn lookback_start(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(window)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
