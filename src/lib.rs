// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod backlog;
pub mod config;
pub mod cooldown;
pub mod dedup;
pub mod store;

// Collaborator adapters (news in, text out, post out)
pub mod generate;
pub mod ingest;
pub mod publish;

pub mod metrics;
pub mod pipeline;

// ---- Re-exports for stable public API ----
pub use crate::config::BotConfig;
pub use crate::pipeline::{Pipeline, RunReport, RunStatus};
pub use crate::store::{PersistentStore, StoreSnapshot};
