use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

/// One-time metrics registration (so series carry descriptions).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("newsdrip_runs_total", "Pipeline runs by final status.");
        describe_counter!(
            "newsdrip_candidates_fetched_total",
            "Candidates returned by the news source."
        );
        describe_counter!(
            "newsdrip_candidates_rejected_total",
            "Candidates rejected by the duplicate detector, by reason."
        );
        describe_counter!(
            "newsdrip_backlog_evicted_total",
            "Queued items evicted for staleness."
        );
        describe_counter!(
            "newsdrip_items_skipped_total",
            "Queued items dropped after a generation or publish failure."
        );
        describe_counter!("newsdrip_posts_total", "Successful posts.");
        describe_counter!(
            "newsdrip_rate_limited_total",
            "Publish attempts refused by the platform rate limit."
        );
        describe_counter!("newsdrip_feed_errors_total", "Per-feed fetch/parse errors.");
        describe_gauge!("newsdrip_backlog_len", "Backlog length at the end of a run.");
        describe_histogram!("newsdrip_rss_parse_ms", "Feed parse time in milliseconds.");
    });
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the process-wide Prometheus recorder.
    pub fn init() -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;
        ensure_metrics_described();
        Ok(Self { handle })
    }

    pub fn render(&self) -> String {
        self.handle.render()
    }

    /// Write the exposition text for a textfile collector; tmp + rename like the state file.
    pub fn write_textfile(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating metrics dir {}", dir.display()))?;
        }
        let tmp = path.with_extension("prom.tmp");
        let mut f = fs::File::create(&tmp)
            .with_context(|| format!("creating {}", tmp.display()))?;
        f.write_all(self.render().as_bytes())
            .context("writing metrics textfile")?;
        fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }
}
