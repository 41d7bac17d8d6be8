//! Lease state machine for the lead event queue.
//!
//! Models at-least-once delivery: a claimed event is leased to one worker for a
//! visibility window; if the worker neither acks nor fails it before the lease
//! expires, the event becomes claimable again. All transitions are pure and
//! bump `state_version` so storage can apply them with compare-and-swap.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::lead::LeadCreatedEvent;
use crate::domain::queue::{LeadEventId, LeadEventRecord, LeadEventState};

pub const ERROR_CLASS_LEASE_EXHAUSTED: &str = "lease_attempts_exhausted";

/// Configuration for the lease engine
#[derive(Clone, Debug)]
pub struct LeaseEngineConfig {
    /// Visibility window of a claim
    pub lease_seconds: i64,
    /// Deliveries allowed before an event is dead-lettered
    pub max_attempts: u32,
    /// Base delay in seconds between retries
    pub retry_base_delay_seconds: i64,
    /// Backoff multiplier for retries
    pub retry_backoff_multiplier: u32,
    /// Upper bound on any single retry delay
    pub retry_max_delay_seconds: i64,
}

impl Default for LeaseEngineConfig {
    fn default() -> Self {
        Self {
            lease_seconds: 60,
            max_attempts: 5,
            retry_base_delay_seconds: 2,
            retry_backoff_multiplier: 2,
            retry_max_delay_seconds: 3600,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LeaseError {
    #[error("invalid lease transition from {from:?} to {to:?}: {reason}")]
    InvalidTransition { from: LeadEventState, to: LeadEventState, reason: String },
    #[error("event {0:?} is leased by `{1}` until its lease expires")]
    LeaseHeld(LeadEventId, String),
    #[error("event {0:?} is not yet available")]
    NotYetAvailable(LeadEventId),
    #[error("event {0:?} is not leased by `{1}`")]
    NotLeaseHolder(LeadEventId, String),
}

/// Policy for handling failures
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Retry with exponential backoff until attempts run out
    Retry,
    /// Dead-letter immediately
    DeadLetter,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClaimOutcome {
    Leased(LeadEventRecord),
    /// Redelivery budget spent by expired leases; the event was dead-lettered
    /// instead of being handed out again.
    DeadLettered(LeadEventRecord),
}

#[derive(Clone, Debug, Default)]
pub struct LeaseEngine {
    config: LeaseEngineConfig,
}

impl LeaseEngine {
    pub fn new() -> Self {
        Self::with_config(LeaseEngineConfig::default())
    }

    pub fn with_config(config: LeaseEngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LeaseEngineConfig {
        &self.config
    }

    /// Wraps a raw inbound payload in a fresh queued record.
    pub fn enqueue(&self, payload_json: impl Into<String>, now: DateTime<Utc>) -> LeadEventRecord {
        let payload_json = payload_json.into();
        let lead_id = LeadCreatedEvent::from_json(&payload_json)
            .ok()
            .and_then(|event| event.lead_id());

        LeadEventRecord {
            id: LeadEventId(Uuid::new_v4().to_string()),
            lead_id,
            payload_hash: hash_payload(&payload_json),
            payload_json,
            state: LeadEventState::Queued,
            attempt_count: 0,
            max_attempts: self.config.max_attempts.max(1),
            available_at: now,
            leased_by: None,
            lease_expires_at: None,
            last_error: None,
            error_class: None,
            state_version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Queued|RetryableFailed|expired Leased -> Leased.
    pub fn claim(
        &self,
        mut record: LeadEventRecord,
        worker_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, LeaseError> {
        let worker_id = worker_id.into();

        match &record.state {
            LeadEventState::Queued | LeadEventState::RetryableFailed => {
                if now < record.available_at {
                    return Err(LeaseError::NotYetAvailable(record.id.clone()));
                }
            }
            LeadEventState::Leased => {
                let expired = record.lease_expires_at.is_some_and(|expiry| expiry <= now);
                if !expired {
                    return Err(LeaseError::LeaseHeld(
                        record.id.clone(),
                        record.leased_by.clone().unwrap_or_default(),
                    ));
                }
                // Previous holder went silent; its lease is forfeit.
                if record.attempt_count >= record.max_attempts {
                    record.state = LeadEventState::DeadLettered;
                    record.error_class = Some(ERROR_CLASS_LEASE_EXHAUSTED.to_string());
                    record.last_error = Some(format!(
                        "lease expired after {} of {} attempts",
                        record.attempt_count, record.max_attempts
                    ));
                    release(&mut record, now);
                    return Ok(ClaimOutcome::DeadLettered(record));
                }
            }
            LeadEventState::Completed | LeadEventState::DeadLettered => {
                return Err(LeaseError::InvalidTransition {
                    from: record.state.clone(),
                    to: LeadEventState::Leased,
                    reason: "event already in terminal state".to_string(),
                });
            }
        }

        record.state = LeadEventState::Leased;
        record.attempt_count += 1;
        record.leased_by = Some(worker_id);
        record.lease_expires_at = Some(offset(now, seconds(self.config.lease_seconds)));
        record.state_version += 1;
        record.updated_at = now;

        Ok(ClaimOutcome::Leased(record))
    }

    /// Leased -> Completed (ack).
    pub fn complete(
        &self,
        mut record: LeadEventRecord,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<LeadEventRecord, LeaseError> {
        self.validate_holder(&record, worker_id, &LeadEventState::Completed)?;

        record.state = LeadEventState::Completed;
        record.last_error = None;
        record.error_class = None;
        release(&mut record, now);

        Ok(record)
    }

    /// Leased -> RetryableFailed or DeadLettered.
    pub fn fail(
        &self,
        mut record: LeadEventRecord,
        worker_id: &str,
        error: impl Into<String>,
        error_class: impl Into<String>,
        policy: RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<LeadEventRecord, LeaseError> {
        self.validate_holder(&record, worker_id, &LeadEventState::RetryableFailed)?;

        let should_retry =
            matches!(policy, RetryPolicy::Retry) && record.attempt_count < record.max_attempts;

        if should_retry {
            record.state = LeadEventState::RetryableFailed;
            record.available_at = offset(now, self.backoff_for(record.attempt_count));
        } else {
            record.state = LeadEventState::DeadLettered;
        }
        record.last_error = Some(error.into());
        record.error_class = Some(error_class.into());
        release(&mut record, now);

        Ok(record)
    }

    /// DeadLettered -> Queued. Operator action only; resets the attempt budget.
    pub fn requeue(
        &self,
        mut record: LeadEventRecord,
        now: DateTime<Utc>,
    ) -> Result<LeadEventRecord, LeaseError> {
        if record.state != LeadEventState::DeadLettered {
            return Err(LeaseError::InvalidTransition {
                from: record.state.clone(),
                to: LeadEventState::Queued,
                reason: "only dead-lettered events can be requeued".to_string(),
            });
        }

        record.state = LeadEventState::Queued;
        record.attempt_count = 0;
        record.available_at = now;
        release(&mut record, now);

        Ok(record)
    }

    /// Delay before attempt `attempt_count + 1`, capped at
    /// `retry_max_delay_seconds`.
    pub fn backoff_for(&self, attempt_count: u32) -> Duration {
        let exponent = attempt_count.saturating_sub(1);
        let factor = i64::from(self.config.retry_backoff_multiplier.max(1))
            .checked_pow(exponent)
            .unwrap_or(i64::MAX);
        let delay = self.config.retry_base_delay_seconds.saturating_mul(factor);
        seconds(delay.clamp(0, self.config.retry_max_delay_seconds.max(0)))
    }

    fn validate_holder(
        &self,
        record: &LeadEventRecord,
        worker_id: &str,
        to_state: &LeadEventState,
    ) -> Result<(), LeaseError> {
        if record.state != LeadEventState::Leased {
            return Err(LeaseError::InvalidTransition {
                from: record.state.clone(),
                to: to_state.clone(),
                reason: format!("cannot transition from {:?} to {:?}", record.state, to_state),
            });
        }

        if record.leased_by.as_deref() != Some(worker_id) {
            return Err(LeaseError::NotLeaseHolder(record.id.clone(), worker_id.to_string()));
        }

        Ok(())
    }
}

fn seconds(value: i64) -> Duration {
    Duration::try_seconds(value).unwrap_or(Duration::MAX)
}

/// `now + delay`, saturating at the latest representable instant.
fn offset(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn release(record: &mut LeadEventRecord, now: DateTime<Utc>) {
    record.leased_by = None;
    record.lease_expires_at = None;
    record.state_version += 1;
    record.updated_at = now;
}

/// Hash payload for duplicate diagnostics
pub fn hash_payload(payload: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    format!("{:x}", hasher.finalize())
}
