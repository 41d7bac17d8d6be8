use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

use leadroute_core::domain::assignment::{
    Assignment, OutcomeEvent, RoutingOutcome, UnassignedEntry,
};
use leadroute_core::domain::capacity::{CapCounterKey, CapCounterSnapshot, CounterIncrement};
use leadroute_core::domain::lead::LeadId;
use leadroute_core::domain::queue::{LeadEventId, LeadEventRecord, LeadEventState};
use leadroute_core::domain::rule::{AssignmentRule, RuleId};
use leadroute_core::errors::DomainError;

pub mod assignment;
pub mod cap_counter;
pub mod lead_event_queue;
pub mod memory;
pub mod outbox;
pub mod rule;

pub use assignment::SqlAssignmentRepository;
pub use cap_counter::SqlCapCounterRepository;
pub use lead_event_queue::SqlLeadEventQueueRepository;
pub use memory::{
    InMemoryAssignmentRepository, InMemoryCapCounterRepository, InMemoryLeadEventQueueRepository,
    InMemoryOutboxRepository, InMemoryRuleRepository,
};
pub use outbox::SqlOutboxRepository;
pub use rule::SqlRuleRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("rejected write: {0}")]
    Invalid(#[from] DomainError),
    #[error("conflicting write: {0}")]
    Conflict(String),
}

/// Result of writing a lead's terminal routing record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted,
    /// Another delivery of the same lead got there first.
    AlreadyRecorded(Assignment),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboxEntry {
    pub id: i64,
    pub lead_id: LeadId,
    pub outcome: RoutingOutcome,
    pub payload_json: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait RuleRepository: Send + Sync {
    /// Active, non-deleted rules. Order is unspecified.
    async fn list_active(&self) -> Result<Vec<AssignmentRule>, RepositoryError>;
    async fn find_by_id(&self, id: &RuleId) -> Result<Option<AssignmentRule>, RepositoryError>;
    async fn save(&self, rule: AssignmentRule) -> Result<(), RepositoryError>;
    async fn soft_delete(&self, id: &RuleId, at: DateTime<Utc>) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait CapCounterRepository: Send + Sync {
    /// Missing counters are omitted; callers read them as zero.
    async fn read_counts(
        &self,
        keys: &[CapCounterKey],
    ) -> Result<Vec<CapCounterSnapshot>, RepositoryError>;

    /// Applies every increment or none. `Ok(false)` means at least one counter
    /// moved since it was read.
    async fn compare_and_increment(
        &self,
        increments: &[CounterIncrement],
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    async fn purge_ended_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError>;
}

#[async_trait]
pub trait AssignmentRepository: Send + Sync {
    async fn find_by_lead(&self, lead_id: &LeadId) -> Result<Option<Assignment>, RepositoryError>;

    /// Inserts the lead's terminal record, plus its sink entry when unassigned,
    /// unless one already exists.
    async fn record_terminal(
        &self,
        assignment: Assignment,
        unassigned: Option<UnassignedEntry>,
    ) -> Result<RecordOutcome, RepositoryError>;

    /// Takes the exclusive right to publish the lead's outcome until
    /// `claim_until`. False once published or while another delivery holds an
    /// unexpired claim.
    async fn claim_publication(
        &self,
        lead_id: &LeadId,
        now: DateTime<Utc>,
        claim_until: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    async fn release_publication(&self, lead_id: &LeadId) -> Result<(), RepositoryError>;

    /// Also clears any publication claim.
    async fn mark_published(
        &self,
        lead_id: &LeadId,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait UnassignedRepository: Send + Sync {
    async fn list(&self, limit: u32) -> Result<Vec<UnassignedEntry>, RepositoryError>;
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError>;
}

#[async_trait]
pub trait LeadEventQueueRepository: Send + Sync {
    async fn insert(&self, record: LeadEventRecord) -> Result<(), RepositoryError>;

    async fn find_by_id(
        &self,
        id: &LeadEventId,
    ) -> Result<Option<LeadEventRecord>, RepositoryError>;

    async fn find_claimable(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<LeadEventRecord>, RepositoryError>;

    /// Stores `record` only if the stored `state_version` still equals
    /// `expected_version`.
    async fn compare_and_swap(
        &self,
        record: &LeadEventRecord,
        expected_version: u32,
    ) -> Result<bool, RepositoryError>;

    async fn list_by_state(
        &self,
        state: LeadEventState,
        limit: u32,
    ) -> Result<Vec<LeadEventRecord>, RepositoryError>;

    async fn count_by_state(&self) -> Result<Vec<(LeadEventState, u64)>, RepositoryError>;
}

#[async_trait]
pub trait OutboxRepository: Send + Sync {
    async fn append(&self, event: &OutcomeEvent, at: DateTime<Utc>)
        -> Result<(), RepositoryError>;
    async fn list_for_lead(&self, lead_id: &LeadId) -> Result<Vec<OutboxEntry>, RepositoryError>;
}

/// Fixed-width UTC encoding so stored timestamps compare lexicographically.
pub(crate) fn encode_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{DateTime, Utc};

    use crate::{connect_with_settings, migrations, DbPool};

    pub async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    pub fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("timestamp").with_timezone(&Utc)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::{encode_timestamp, parse_timestamp, parse_u32, RepositoryError};

    #[test]
    fn encoded_timestamps_sort_chronologically() {
        let early = Utc.with_ymd_and_hms(2026, 1, 2, 9, 0, 0).unwrap();
        let later = early + Duration::milliseconds(1500);

        assert!(encode_timestamp(early) < encode_timestamp(later));
        assert_eq!(parse_timestamp("t", encode_timestamp(later)).unwrap(), later);
    }

    #[test]
    fn negative_counts_are_decode_errors() {
        assert!(matches!(parse_u32("count", -1), Err(RepositoryError::Decode(_))));
    }
}
