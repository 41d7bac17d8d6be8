use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::info;

use leadroute_core::config::PublisherSink;
use leadroute_core::domain::assignment::OutcomeEvent;
use leadroute_db::repositories::{OutboxRepository, RepositoryError};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("outcome sink rejected event: {0}")]
    Sink(String),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Notifies downstream consumers of a lead's terminal outcome.
///
/// Delivery may repeat after a crash between publish and the published mark;
/// consumers dedupe on `leadId`.
#[async_trait]
pub trait OutcomePublisher: Send + Sync {
    fn sink_name(&self) -> &'static str;

    async fn publish(&self, event: &OutcomeEvent, at: DateTime<Utc>) -> Result<(), PublishError>;
}

pub struct OutboxOutcomePublisher {
    outbox: Arc<dyn OutboxRepository>,
}

impl OutboxOutcomePublisher {
    pub fn new(outbox: Arc<dyn OutboxRepository>) -> Self {
        Self { outbox }
    }
}

#[async_trait]
impl OutcomePublisher for OutboxOutcomePublisher {
    fn sink_name(&self) -> &'static str {
        PublisherSink::Outbox.as_str()
    }

    async fn publish(&self, event: &OutcomeEvent, at: DateTime<Utc>) -> Result<(), PublishError> {
        self.outbox.append(event, at).await?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TracingOutcomePublisher;

#[async_trait]
impl OutcomePublisher for TracingOutcomePublisher {
    fn sink_name(&self) -> &'static str {
        PublisherSink::Log.as_str()
    }

    async fn publish(&self, event: &OutcomeEvent, _at: DateTime<Utc>) -> Result<(), PublishError> {
        let payload =
            serde_json::to_string(event).map_err(|error| PublishError::Sink(error.to_string()))?;
        info!(
            event_name = "router.outcome.published",
            lead_id = %event.lead_id,
            outcome = event.outcome.as_str(),
            payload = %payload,
            "lead outcome published"
        );
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryOutcomePublisher {
    published: Arc<Mutex<Vec<OutcomeEvent>>>,
}

impl InMemoryOutcomePublisher {
    pub fn published(&self) -> Vec<OutcomeEvent> {
        match self.published.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn published_for(&self, lead_id: &str) -> Vec<OutcomeEvent> {
        self.published().into_iter().filter(|event| event.lead_id == lead_id).collect()
    }
}

#[async_trait]
impl OutcomePublisher for InMemoryOutcomePublisher {
    fn sink_name(&self) -> &'static str {
        "memory"
    }

    async fn publish(&self, event: &OutcomeEvent, _at: DateTime<Utc>) -> Result<(), PublishError> {
        match self.published.lock() {
            Ok(mut events) => events.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
        Ok(())
    }
}

pub fn publisher_for(
    sink: PublisherSink,
    outbox: Arc<dyn OutboxRepository>,
) -> Arc<dyn OutcomePublisher> {
    match sink {
        PublisherSink::Outbox => Arc::new(OutboxOutcomePublisher::new(outbox)),
        PublisherSink::Log => Arc::new(TracingOutcomePublisher),
    }
}
