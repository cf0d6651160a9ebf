//! Fixed-interval trigger for the monitoring cycle.  Intended to be
//! `tokio::spawn`-ed from main.
//!
//! Cycles run strictly one after another: the tick awaits the cycle, and the
//! `Monitor` gate also covers on-demand and manual callers.  A failed cycle
//! rolls back as a batch; the next tick is the retry — there is no backoff
//! policy here.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant};
use tracing::{error, info};

use crate::monitor::Monitor;

pub async fn run(monitor: Arc<Monitor>, interval_hours: i64) {
    let period = Duration::from_secs(interval_hours.max(1) as u64 * 3600);

    // First fire after one full interval, matching the wall-clock cadence of
    // a freshly scheduled job.
    let mut ticker = interval_at(Instant::now() + period, period);

    info!(interval_hours, "monitoring scheduler started");

    loop {
        ticker.tick().await;
        match monitor.run_cycle().await {
            Ok(outcome) => info!(
                readings_saved = outcome.readings_saved,
                pumps_run = outcome.pumps_run,
                "monitoring cycle complete"
            ),
            Err(e) => error!("monitoring cycle failed: {e:#}"),
        }
    }
}
