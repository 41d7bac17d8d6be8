use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use leadroute_core::domain::assignment::{OutcomeEvent, RoutingOutcome};
use leadroute_core::domain::lead::LeadId;

use super::{encode_timestamp, parse_timestamp, OutboxEntry, OutboxRepository, RepositoryError};
use crate::DbPool;

pub struct SqlOutboxRepository {
    pool: DbPool,
}

impl SqlOutboxRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl OutboxRepository for SqlOutboxRepository {
    async fn append(
        &self,
        event: &OutcomeEvent,
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let payload_json = serde_json::to_string(event)?;

        sqlx::query(
            "INSERT INTO outcome_outbox (lead_id, outcome, payload_json, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&event.lead_id)
        .bind(event.outcome.as_str())
        .bind(payload_json)
        .bind(encode_timestamp(at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_for_lead(&self, lead_id: &LeadId) -> Result<Vec<OutboxEntry>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, lead_id, outcome, payload_json, created_at
             FROM outcome_outbox
             WHERE lead_id = ?
             ORDER BY id ASC",
        )
        .bind(&lead_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(entry_from_row).collect()
    }
}

fn entry_from_row(row: SqliteRow) -> Result<OutboxEntry, RepositoryError> {
    let outcome_raw = row.try_get::<String, _>("outcome")?;
    let outcome = RoutingOutcome::parse(&outcome_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown outcome `{outcome_raw}`")))?;

    Ok(OutboxEntry {
        id: row.try_get("id")?,
        lead_id: LeadId(row.try_get("lead_id")?),
        outcome,
        payload_json: row.try_get("payload_json")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use leadroute_core::domain::assignment::{OutcomeEvent, RoutingOutcome, UnassignedReason};
    use leadroute_core::domain::lead::LeadId;

    use super::SqlOutboxRepository;
    use crate::repositories::test_support::{parse_ts, setup_pool};
    use crate::repositories::OutboxRepository;

    #[tokio::test]
    async fn appended_outcomes_are_listed_per_lead_as_camel_case_json() {
        let pool = setup_pool().await;
        let repo = SqlOutboxRepository::new(pool.clone());
        let event = OutcomeEvent {
            lead_id: "L-77".to_string(),
            funnel_id: "plumbing".to_string(),
            outcome: RoutingOutcome::Unassigned,
            org_id: None,
            user_id: None,
            rule_id: None,
            reason: Some(UnassignedReason::NoMatch),
        };

        repo.append(&event, parse_ts("2026-02-01T00:00:00Z")).await.expect("append");

        let entries = repo.list_for_lead(&LeadId("L-77".to_string())).await.expect("list");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, RoutingOutcome::Unassigned);

        let payload: serde_json::Value =
            serde_json::from_str(&entries[0].payload_json).expect("json");
        assert_eq!(payload["leadId"], "L-77");
        assert_eq!(payload["reason"], "no_match");
        assert!(payload.get("orgId").is_none());
        pool.close().await;
    }
}
