//! feed-digest binary entrypoint.
//! Loads config, optionally exposes /metrics, then runs the pipeline once or
//! on a fixed interval.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use feed_digest::config::{AppConfig, RunMode};
use feed_digest::metrics::Metrics;
use feed_digest::pipeline::Pipeline;
use feed_digest::scheduler::{self, SchedulerCfg};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// `LOG_FORMAT=json` switches to JSON lines; default is compact text.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("feed_digest=info,warn"));

    let json = std::env::var("LOG_FORMAT")
        .ok()
        .is_some_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = AppConfig::load_default().context("loading configuration")?;

    let _metrics_task = match cfg.metrics.listen_addr.as_deref() {
        Some(addr) => {
            let metrics = Metrics::init()?;
            Some(metrics.serve(addr).await?)
        }
        None => None,
    };

    let pipeline = Arc::new(Pipeline::from_config(&cfg).context("building pipeline")?);
    tracing::info!(
        sources = pipeline.sources().len(),
        mode = ?cfg.schedule.run_mode,
        "feed-digest starting"
    );

    match cfg.schedule.run_mode {
        RunMode::Once => {
            let report = pipeline.run_once(Utc::now()).await;
            if !report.flagged.is_empty() {
                tracing::warn!(sources = ?report.flagged, "sources need attention");
            }
        }
        RunMode::Schedule => {
            let handle = scheduler::spawn(pipeline, SchedulerCfg::from(&cfg.schedule));
            tokio::select! {
                res = handle => {
                    if let Err(e) = res {
                        tracing::error!(error = %e, "scheduler task ended");
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutdown requested");
                }
            }
        }
    }
    Ok(())
}
