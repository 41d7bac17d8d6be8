//! Lease-based consumption of the lead event queue.
//!
//! A claim is a compare-and-swap on `state_version`; two workers reading the
//! same row can both attempt it but only one lease lands. Events whose lease
//! lapses become claimable again, which is how an interrupted delivery is
//! recovered.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use leadroute_core::domain::queue::{LeadEventId, LeadEventRecord, LeadEventState};
use leadroute_core::lease::{ClaimOutcome, LeaseEngine, LeaseError, RetryPolicy};
use leadroute_db::repositories::{LeadEventQueueRepository, RepositoryError};

use crate::dispatcher::{AssignmentDispatcher, DispatchReport};

const CLAIM_BATCH: u32 = 8;

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Lease(#[from] LeaseError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Nothing claimable right now.
    Idle,
    /// Claimable events existed but other workers leased all of them first.
    Contended,
    Completed { event_id: LeadEventId, report: Box<DispatchReport> },
    Retrying { event_id: LeadEventId, error_class: String, available_at: DateTime<Utc> },
    DeadLettered { event_id: LeadEventId, error_class: String },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub completed: u32,
    pub retrying: u32,
    pub dead_lettered: u32,
}

pub struct LeadEventConsumer {
    queue: Arc<dyn LeadEventQueueRepository>,
    dispatcher: Arc<AssignmentDispatcher>,
    engine: LeaseEngine,
}

impl LeadEventConsumer {
    pub fn new(
        queue: Arc<dyn LeadEventQueueRepository>,
        dispatcher: Arc<AssignmentDispatcher>,
        engine: LeaseEngine,
    ) -> Self {
        Self { queue, dispatcher, engine }
    }

    pub async fn process_next(&self, worker_id: &str) -> Result<ProcessOutcome, ConsumerError> {
        self.process_next_at(worker_id, Utc::now()).await
    }

    /// Claims one event, routes it and records the result on the queue row.
    pub async fn process_next_at(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ProcessOutcome, ConsumerError> {
        let candidates = self.queue.find_claimable(now, CLAIM_BATCH).await?;
        if candidates.is_empty() {
            return Ok(ProcessOutcome::Idle);
        }

        for candidate in candidates {
            let expected_version = candidate.state_version;
            let claimed = match self.engine.claim(candidate, worker_id, now) {
                Ok(claimed) => claimed,
                Err(error) => {
                    debug!(
                        event_name = "router.queue.claim_skipped",
                        worker_id,
                        error = %error,
                        "candidate no longer claimable"
                    );
                    continue;
                }
            };

            match claimed {
                ClaimOutcome::DeadLettered(record) => {
                    if self.queue.compare_and_swap(&record, expected_version).await? {
                        warn!(
                            event_name = "router.queue.dead_lettered",
                            correlation_id = %record.id.0,
                            lead_id = lead_id_field(&record),
                            attempts = record.attempt_count,
                            error_class = record.error_class.as_deref().unwrap_or(""),
                            "lease expired with no attempts left"
                        );
                        return Ok(ProcessOutcome::DeadLettered {
                            event_id: record.id,
                            error_class: record.error_class.unwrap_or_default(),
                        });
                    }
                }
                ClaimOutcome::Leased(record) => {
                    if self.queue.compare_and_swap(&record, expected_version).await? {
                        return self.handle(record, worker_id, now).await;
                    }
                    debug!(
                        event_name = "router.queue.claim_lost",
                        correlation_id = %record.id.0,
                        worker_id,
                        "another worker leased this event first"
                    );
                }
            }
        }

        Ok(ProcessOutcome::Contended)
    }

    /// Processes until nothing is claimable. Events backing off for a retry
    /// are left for a later pass.
    pub async fn drain(&self, worker_id: &str) -> Result<DrainSummary, ConsumerError> {
        let mut summary = DrainSummary::default();
        loop {
            match self.process_next(worker_id).await? {
                ProcessOutcome::Idle => return Ok(summary),
                ProcessOutcome::Contended => tokio::task::yield_now().await,
                ProcessOutcome::Completed { .. } => summary.completed += 1,
                ProcessOutcome::Retrying { .. } => summary.retrying += 1,
                ProcessOutcome::DeadLettered { .. } => summary.dead_lettered += 1,
            }
        }
    }

    async fn handle(
        &self,
        record: LeadEventRecord,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ProcessOutcome, ConsumerError> {
        let leased_version = record.state_version;
        let event_id = record.id.clone();

        match self.dispatcher.dispatch_payload(&record.payload_json, &event_id.0, now).await {
            Ok(report) => {
                let completed = self.engine.complete(record, worker_id, now)?;
                self.store_release(&completed, leased_version).await?;
                debug!(
                    event_name = "router.queue.completed",
                    correlation_id = %event_id.0,
                    lead_id = %report.assignment.lead_id.0,
                    disposition = report.disposition.as_str(),
                    "lead event acknowledged"
                );
                Ok(ProcessOutcome::Completed { event_id, report: Box::new(report) })
            }
            Err(error) => {
                let policy =
                    if error.is_retryable() { RetryPolicy::Retry } else { RetryPolicy::DeadLetter };
                let failed = self.engine.fail(
                    record,
                    worker_id,
                    error.to_string(),
                    error.error_class(),
                    policy,
                    now,
                )?;
                self.store_release(&failed, leased_version).await?;

                let error_class = error.error_class().to_string();
                if failed.state == LeadEventState::DeadLettered {
                    warn!(
                        event_name = "router.queue.dead_lettered",
                        correlation_id = %event_id.0,
                        lead_id = lead_id_field(&failed),
                        attempts = failed.attempt_count,
                        error_class = %error_class,
                        error = %error,
                        "lead event moved to dead letters"
                    );
                    Ok(ProcessOutcome::DeadLettered { event_id, error_class })
                } else {
                    warn!(
                        event_name = "router.queue.retry_scheduled",
                        correlation_id = %event_id.0,
                        lead_id = lead_id_field(&failed),
                        attempts = failed.attempt_count,
                        available_at = %failed.available_at,
                        error_class = %error_class,
                        error = %error,
                        "lead event will be redelivered"
                    );
                    Ok(ProcessOutcome::Retrying {
                        event_id,
                        error_class,
                        available_at: failed.available_at,
                    })
                }
            }
        }
    }

    /// A failed swap means the lease lapsed and someone else took the event;
    /// their delivery settles it through the idempotency anchor.
    async fn store_release(
        &self,
        record: &LeadEventRecord,
        leased_version: u32,
    ) -> Result<(), ConsumerError> {
        if !self.queue.compare_and_swap(record, leased_version).await? {
            warn!(
                event_name = "router.queue.lease_lost",
                correlation_id = %record.id.0,
                lead_id = lead_id_field(record),
                "lease expired before the result was recorded"
            );
        }
        Ok(())
    }
}

fn lead_id_field(record: &LeadEventRecord) -> &str {
    record.lead_id.as_ref().map(|id| id.0.as_str()).unwrap_or("unknown")
}

/// N independent workers polling the queue until cancelled.
pub struct WorkerPool {
    consumer: Arc<LeadEventConsumer>,
    worker_count: usize,
    poll_interval: StdDuration,
}

impl WorkerPool {
    pub fn new(
        consumer: Arc<LeadEventConsumer>,
        worker_count: usize,
        poll_interval: StdDuration,
    ) -> Self {
        Self { consumer, worker_count: worker_count.max(1), poll_interval }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut workers = JoinSet::new();
        for index in 0..self.worker_count {
            let worker_id = format!("worker-{}-{index}", std::process::id());
            workers.spawn(run_worker(
                Arc::clone(&self.consumer),
                worker_id,
                self.poll_interval,
                cancel.clone(),
            ));
        }

        let poll_interval_ms = u64::try_from(self.poll_interval.as_millis()).unwrap_or(u64::MAX);
        info!(
            event_name = "router.workers.started",
            correlation_id = "workers",
            worker_count = self.worker_count,
            poll_interval_ms,
            "lead event workers started"
        );

        while let Some(joined) = workers.join_next().await {
            if let Err(error) = joined {
                warn!(
                    event_name = "router.workers.panicked",
                    correlation_id = "workers",
                    error = %error,
                    "lead event worker terminated abnormally"
                );
            }
        }

        info!(
            event_name = "router.workers.stopped",
            correlation_id = "workers",
            "lead event workers stopped"
        );
    }
}

async fn run_worker(
    consumer: Arc<LeadEventConsumer>,
    worker_id: String,
    poll_interval: StdDuration,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }

        let wait = match consumer.process_next(&worker_id).await {
            Ok(ProcessOutcome::Idle | ProcessOutcome::Contended) => true,
            Ok(_) => false,
            Err(error) => {
                warn!(
                    event_name = "router.workers.poll_failed",
                    correlation_id = %worker_id,
                    error = %error,
                    "queue poll failed; backing off"
                );
                true
            }
        };

        if wait {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }
}
