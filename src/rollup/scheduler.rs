//! Periodic driver for the aggregator

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::{Aggregator, RunOutcome};

/// Run the aggregator immediately, then once per `every`.
///
/// A failed run is logged and retried on the next tick; the process keeps serving.
pub fn spawn_scheduler(aggregator: Arc<Aggregator>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = every.as_secs(), "Aggregation scheduler started");
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            // The first tick completes immediately, catching up on any backlog at startup
            interval.tick().await;
            run_once(&aggregator).await;
        }
    })
}

async fn run_once(aggregator: &Aggregator) {
    match aggregator.run_now().await {
        Ok(RunOutcome::Completed(summary)) => info!(
            days = summary.days.len(),
            events = summary.events,
            page_rows = summary.page_rows,
            referral_rows = summary.referral_rows,
            geo_rows = summary.geo_rows,
            purged = summary.purged,
            backlog = summary.backlog_remaining,
            "Aggregation run completed"
        ),
        Ok(RunOutcome::Skipped) => debug!("Aggregation run skipped"),
        Ok(RunOutcome::Busy) => warn!("Previous aggregation run still in progress, skipping tick"),
        Err(e) => error!(error = %e, "Aggregation run failed, retrying on next tick"),
    }
}
