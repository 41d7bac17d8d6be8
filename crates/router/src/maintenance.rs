//! Periodic retention sweep.
//!
//! Drops cap counters whose period ended more than the grace window ago and
//! Unassigned Sink entries past their TTL. Terminal assignment records are
//! never touched; they are the idempotency anchor.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use leadroute_db::repositories::{CapCounterRepository, RepositoryError, UnassignedRepository};

const DEFAULT_COUNTER_GRACE_DAYS: i64 = 7;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub counters_purged: u64,
    pub unassigned_purged: u64,
}

pub struct RetentionSweeper {
    counters: Arc<dyn CapCounterRepository>,
    unassigned: Arc<dyn UnassignedRepository>,
    counter_grace: Duration,
}

impl RetentionSweeper {
    pub fn new(
        counters: Arc<dyn CapCounterRepository>,
        unassigned: Arc<dyn UnassignedRepository>,
    ) -> Self {
        Self { counters, unassigned, counter_grace: Duration::days(DEFAULT_COUNTER_GRACE_DAYS) }
    }

    pub fn with_counter_grace(mut self, grace: Duration) -> Self {
        self.counter_grace = grace;
        self
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, RepositoryError> {
        let counters_purged = self.counters.purge_ended_before(now - self.counter_grace).await?;
        let unassigned_purged = self.unassigned.purge_expired(now).await?;
        Ok(SweepReport { counters_purged, unassigned_purged })
    }

    /// Sweeps on a fixed interval until `cancel` fires.
    pub async fn run(self, interval: StdDuration, cancel: CancellationToken) {
        info!(
            event_name = "router.sweep.started",
            correlation_id = "sweep",
            interval_secs = interval.as_secs(),
            grace_days = self.counter_grace.num_days(),
            "retention sweeper started"
        );

        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(
                        event_name = "router.sweep.stopped",
                        correlation_id = "sweep",
                        "retention sweeper stopping"
                    );
                    break;
                }
                _ = ticker.tick() => match self.sweep(Utc::now()).await {
                    Ok(report) if report.counters_purged + report.unassigned_purged > 0 => info!(
                        event_name = "router.sweep.completed",
                        correlation_id = "sweep",
                        counters_purged = report.counters_purged,
                        unassigned_purged = report.unassigned_purged,
                        "retention sweep purged expired rows"
                    ),
                    Ok(_) => debug!(
                        event_name = "router.sweep.completed",
                        correlation_id = "sweep",
                        "retention sweep found nothing to purge"
                    ),
                    Err(sweep_error) => error!(
                        event_name = "router.sweep.failed",
                        correlation_id = "sweep",
                        error = %sweep_error,
                        "retention sweep failed"
                    ),
                },
            }
        }
    }
}
