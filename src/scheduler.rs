// src/scheduler.rs
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::{ScheduleSection, MAX_INTERVAL_SECS};
use crate::pipeline::Pipeline;

#[derive(Clone, Copy, Debug)]
pub struct SchedulerCfg {
    pub interval: Duration,
    /// Run immediately instead of waiting one full interval.
    pub initial_run: bool,
}

impl From<&ScheduleSection> for SchedulerCfg {
    fn from(s: &ScheduleSection) -> Self {
        Self {
            interval: Duration::from_secs(s.interval_secs.clamp(1, MAX_INTERVAL_SECS)),
            initial_run: s.initial_run,
        }
    }
}

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("digest_runs_total", "Scheduled digest runs completed.");
    });
}

/// Periodic trigger for [`Pipeline::run_once`]. Runs never overlap: a tick
/// that fires while a run is still going is skipped.
pub fn spawn(pipeline: Arc<Pipeline>, cfg: SchedulerCfg) -> JoinHandle<()> {
    ensure_metrics_described();
    tokio::spawn(async move {
        let start = if cfg.initial_run {
            tokio::time::Instant::now()
        } else {
            tokio::time::Instant::now() + cfg.interval
        };
        let mut ticker = tokio::time::interval_at(start, cfg.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let report = pipeline.run_once(Utc::now()).await;
            counter!("digest_runs_total").increment(1);
            tracing::info!(
                target: "ingest",
                new_items = report.stats.new_items,
                delivered = report.delivered,
                next_in_secs = cfg.interval.as_secs(),
                "scheduled run complete"
            );
        }
    })
}
