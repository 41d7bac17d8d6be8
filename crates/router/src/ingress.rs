use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::info;

use leadroute_core::domain::queue::{LeadEventId, LeadEventRecord, LeadEventState};
use leadroute_core::lease::{LeaseEngine, LeaseError};
use leadroute_db::repositories::{LeadEventQueueRepository, RepositoryError};

#[derive(Debug, Error)]
pub enum RequeueError {
    #[error("lead event `{0}` was not found")]
    NotFound(String),
    #[error(transparent)]
    Lease(#[from] LeaseError),
    #[error("lead event `{0}` changed while it was being requeued")]
    Conflict(String),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Accepts raw "lead created" payloads onto the queue.
///
/// Payloads are stored verbatim. Validation happens at dispatch so a bad event
/// still leaves an operator-visible dead letter instead of vanishing.
pub struct LeadEventIngress {
    queue: Arc<dyn LeadEventQueueRepository>,
    engine: LeaseEngine,
}

impl LeadEventIngress {
    pub fn new(queue: Arc<dyn LeadEventQueueRepository>, engine: LeaseEngine) -> Self {
        Self { queue, engine }
    }

    pub async fn enqueue(
        &self,
        payload_json: &str,
        now: DateTime<Utc>,
    ) -> Result<LeadEventRecord, RepositoryError> {
        let record = self.engine.enqueue(payload_json, now);
        self.queue.insert(record.clone()).await?;

        info!(
            event_name = "router.ingress.enqueued",
            correlation_id = %record.id.0,
            lead_id = record.lead_id.as_ref().map(|id| id.0.as_str()).unwrap_or("unknown"),
            payload_hash = %record.payload_hash,
            "lead event enqueued"
        );

        Ok(record)
    }

    pub async fn dead_letters(&self, limit: u32) -> Result<Vec<LeadEventRecord>, RepositoryError> {
        self.queue.list_by_state(LeadEventState::DeadLettered, limit).await
    }

    /// Puts a dead-lettered event back in line with a fresh attempt budget.
    pub async fn requeue(
        &self,
        id: &LeadEventId,
        now: DateTime<Utc>,
    ) -> Result<LeadEventRecord, RequeueError> {
        let record = self
            .queue
            .find_by_id(id)
            .await?
            .ok_or_else(|| RequeueError::NotFound(id.0.clone()))?;
        let expected_version = record.state_version;

        let requeued = self.engine.requeue(record, now)?;
        if !self.queue.compare_and_swap(&requeued, expected_version).await? {
            return Err(RequeueError::Conflict(id.0.clone()));
        }

        info!(
            event_name = "router.ingress.requeued",
            correlation_id = %requeued.id.0,
            lead_id = requeued.lead_id.as_ref().map(|id| id.0.as_str()).unwrap_or("unknown"),
            "dead-lettered lead event requeued"
        );

        Ok(requeued)
    }
}
