//! # Backlog
//! FIFO queue of accepted-but-unpublished items, persisted inside the store snapshot.
//!
//! The backlog never re-checks for duplicates; callers run the duplicate detector
//! before `enqueue`. Selection is always the oldest entry by enqueue time, ties
//! broken by insertion order.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::ingest::types::CandidateItem;

/// A candidate accepted into the backlog. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueEntry {
    #[serde(flatten)]
    pub item: CandidateItem,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn key(&self) -> &str {
        &self.item.key
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Backlog {
    entries: Vec<QueueEntry>,
}

impl Backlog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|e| e.item.key == key)
    }

    /// Append an item stamped with `now`.
    pub fn enqueue(&mut self, item: CandidateItem, now: DateTime<Utc>) {
        self.entries.push(QueueEntry {
            item,
            enqueued_at: now,
        });
    }

    /// Oldest entry by enqueue time, without removing it.
    pub fn peek_next(&self) -> Option<&QueueEntry> {
        self.entries
            .iter()
            .enumerate()
            .min_by_key(|(idx, e)| (e.enqueued_at, *idx))
            .map(|(_, e)| e)
    }

    /// Remove the entry with `key`, wherever it sits.
    pub fn dequeue(&mut self, key: &str) -> Option<QueueEntry> {
        let pos = self.entries.iter().position(|e| e.item.key == key)?;
        Some(self.entries.remove(pos))
    }

    /// Drop entries enqueued more than `max_age` before `now`. Returns what was removed.
    pub fn evict_stale(&mut self, now: DateTime<Utc>, max_age: Duration) -> Vec<QueueEntry> {
        let (stale, fresh): (Vec<_>, Vec<_>) = self
            .entries
            .drain(..)
            .partition(|e| now - e.enqueued_at > max_age);
        self.entries = fresh;
        stale
    }

    /// Keep only entries matching `keep`; used by load-time repair.
    pub(crate) fn retain<F: FnMut(&QueueEntry) -> bool>(&mut self, keep: F) -> usize {
        let before = self.entries.len();
        self.entries.retain(keep);
        before - self.entries.len()
    }
}
