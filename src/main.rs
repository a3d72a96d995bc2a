//! newsdrip: one scheduled run per invocation.
//! Meant to be triggered by cron or CI. Exit code 1 means the run hit an
//! unexpected error; skips and rate limits exit 0.

use std::process::ExitCode;

use chrono::Utc;
use newsdrip::{metrics::Metrics, BotConfig, Pipeline};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// Log targets used across the crate; anything else only at warn.
const DEFAULT_FILTER: &str =
    "newsdrip=info,pipeline=info,gate=info,store=info,backlog=info,ingest=info,generate=info,publish=info,warn";

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let json = std::env::var("NEWSDRIP_LOG_JSON")
        .ok()
        .is_some_and(|v| v == "1");

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = match BotConfig::load_default() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(error = ?e, "config error");
            return ExitCode::from(2);
        }
    };

    let metrics = match cfg.metrics.textfile_path {
        Some(_) => match Metrics::init() {
            Ok(m) => Some(m),
            Err(e) => {
                tracing::warn!(error = ?e, "metrics disabled");
                None
            }
        },
        None => None,
    };

    let pipeline = match Pipeline::from_config(&cfg) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(error = ?e, "could not build pipeline");
            return ExitCode::from(2);
        }
    };

    let report = pipeline.run_once(Utc::now()).await;

    if let (Some(m), Some(path)) = (&metrics, &cfg.metrics.textfile_path) {
        if let Err(e) = m.write_textfile(path) {
            tracing::warn!(error = ?e, "writing metrics textfile failed");
        }
    }

    println!("{}", report.status.label());
    ExitCode::from(report.status.exit_code() as u8)
}
