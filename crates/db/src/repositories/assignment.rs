use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use leadroute_core::domain::assignment::{
    Assignment, AssignmentId, RoutingOutcome, UnassignedEntry, UnassignedReason,
};
use leadroute_core::domain::lead::{FunnelId, LeadId};
use leadroute_core::domain::rule::{OrgId, RuleId, UserId};

use super::{
    encode_timestamp, parse_optional_timestamp, parse_timestamp, AssignmentRepository,
    RecordOutcome, RepositoryError, UnassignedRepository,
};
use crate::DbPool;

pub struct SqlAssignmentRepository {
    pool: DbPool,
}

impl SqlAssignmentRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const SELECT_ASSIGNMENT: &str = "SELECT
        lead_id,
        assignment_id,
        funnel_id,
        rule_id,
        org_id,
        user_id,
        outcome,
        reason,
        assigned_at,
        published_at
     FROM lead_assignment
     WHERE lead_id = ?";

#[async_trait::async_trait]
impl AssignmentRepository for SqlAssignmentRepository {
    async fn find_by_lead(&self, lead_id: &LeadId) -> Result<Option<Assignment>, RepositoryError> {
        let row = sqlx::query(SELECT_ASSIGNMENT)
            .bind(&lead_id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(assignment_from_row).transpose()
    }

    async fn record_terminal(
        &self,
        assignment: Assignment,
        unassigned: Option<UnassignedEntry>,
    ) -> Result<RecordOutcome, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO lead_assignment (
                lead_id,
                assignment_id,
                funnel_id,
                rule_id,
                org_id,
                user_id,
                outcome,
                reason,
                assigned_at,
                published_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(lead_id) DO NOTHING",
        )
        .bind(&assignment.lead_id.0)
        .bind(&assignment.id.0)
        .bind(&assignment.funnel_id.0)
        .bind(assignment.rule_id.as_ref().map(|id| id.0.as_str()))
        .bind(assignment.org_id.as_ref().map(|id| id.0.as_str()))
        .bind(assignment.user_id.as_ref().map(|id| id.0.as_str()))
        .bind(assignment.outcome.as_str())
        .bind(assignment.reason.as_ref().map(UnassignedReason::as_str))
        .bind(encode_timestamp(assignment.assigned_at))
        .bind(assignment.published_at.map(encode_timestamp))
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            let existing = sqlx::query(SELECT_ASSIGNMENT)
                .bind(&assignment.lead_id.0)
                .fetch_one(&mut *tx)
                .await?;
            tx.rollback().await?;
            return Ok(RecordOutcome::AlreadyRecorded(assignment_from_row(existing)?));
        }

        if let Some(entry) = unassigned {
            sqlx::query(
                "INSERT INTO unassigned_lead (
                    lead_id,
                    funnel_id,
                    zip_code,
                    reason,
                    recorded_at,
                    expires_at
                 ) VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(lead_id) DO NOTHING",
            )
            .bind(&entry.lead_id.0)
            .bind(&entry.funnel_id.0)
            .bind(entry.zip_code.as_deref())
            .bind(entry.reason.as_str())
            .bind(encode_timestamp(entry.recorded_at))
            .bind(encode_timestamp(entry.expires_at))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(RecordOutcome::Inserted)
    }

    async fn claim_publication(
        &self,
        lead_id: &LeadId,
        now: DateTime<Utc>,
        claim_until: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE lead_assignment
             SET publish_claimed_until = ?
             WHERE lead_id = ?
               AND published_at IS NULL
               AND (publish_claimed_until IS NULL OR publish_claimed_until <= ?)",
        )
        .bind(encode_timestamp(claim_until))
        .bind(&lead_id.0)
        .bind(encode_timestamp(now))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_publication(&self, lead_id: &LeadId) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE lead_assignment
             SET publish_claimed_until = NULL
             WHERE lead_id = ? AND published_at IS NULL",
        )
        .bind(&lead_id.0)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_published(
        &self,
        lead_id: &LeadId,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE lead_assignment
             SET published_at = ?, publish_claimed_until = NULL
             WHERE lead_id = ? AND published_at IS NULL",
        )
        .bind(encode_timestamp(at))
        .bind(&lead_id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait::async_trait]
impl UnassignedRepository for SqlAssignmentRepository {
    async fn list(&self, limit: u32) -> Result<Vec<UnassignedEntry>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT lead_id, funnel_id, zip_code, reason, recorded_at, expires_at
             FROM unassigned_lead
             ORDER BY recorded_at ASC, lead_id ASC
             LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(unassigned_from_row).collect()
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM unassigned_lead WHERE expires_at <= ?")
            .bind(encode_timestamp(now))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

fn assignment_from_row(row: SqliteRow) -> Result<Assignment, RepositoryError> {
    let outcome_raw = row.try_get::<String, _>("outcome")?;
    let outcome = RoutingOutcome::parse(&outcome_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown outcome `{outcome_raw}`")))?;

    let reason = row
        .try_get::<Option<String>, _>("reason")?
        .map(|value| {
            UnassignedReason::parse(&value)
                .ok_or_else(|| RepositoryError::Decode(format!("unknown reason `{value}`")))
        })
        .transpose()?;

    Ok(Assignment {
        id: AssignmentId(row.try_get("assignment_id")?),
        lead_id: LeadId(row.try_get("lead_id")?),
        funnel_id: FunnelId(row.try_get("funnel_id")?),
        rule_id: row.try_get::<Option<String>, _>("rule_id")?.map(RuleId),
        org_id: row.try_get::<Option<String>, _>("org_id")?.map(OrgId),
        user_id: row.try_get::<Option<String>, _>("user_id")?.map(UserId),
        outcome,
        reason,
        assigned_at: parse_timestamp("assigned_at", row.try_get("assigned_at")?)?,
        published_at: parse_optional_timestamp("published_at", row.try_get("published_at")?)?,
    })
}

fn unassigned_from_row(row: SqliteRow) -> Result<UnassignedEntry, RepositoryError> {
    let reason_raw = row.try_get::<String, _>("reason")?;
    let reason = UnassignedReason::parse(&reason_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown reason `{reason_raw}`")))?;

    Ok(UnassignedEntry {
        lead_id: LeadId(row.try_get("lead_id")?),
        funnel_id: FunnelId(row.try_get("funnel_id")?),
        zip_code: row.try_get("zip_code")?,
        reason,
        recorded_at: parse_timestamp("recorded_at", row.try_get("recorded_at")?)?,
        expires_at: parse_timestamp("expires_at", row.try_get("expires_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use leadroute_core::domain::assignment::{Assignment, UnassignedEntry, UnassignedReason};
    use leadroute_core::domain::lead::{FunnelId, Lead, LeadId};
    use leadroute_core::domain::rule::{AssignmentRule, FunnelScope, OrgId, RuleId};

    use super::SqlAssignmentRepository;
    use crate::repositories::test_support::{parse_ts, setup_pool};
    use crate::repositories::{AssignmentRepository, RecordOutcome, UnassignedRepository};

    fn lead(id: &str) -> Lead {
        Lead {
            id: LeadId(id.to_string()),
            funnel_id: FunnelId("roofing".to_string()),
            zip_code: Some("90210".to_string()),
            created_at: parse_ts("2026-05-01T09:00:00Z"),
        }
    }

    fn rule() -> AssignmentRule {
        AssignmentRule {
            id: RuleId("rule-b".to_string()),
            funnel: FunnelScope::Any,
            target_org_id: OrgId("org-b".to_string()),
            target_user_id: None,
            priority: 2,
            zip_patterns: Vec::new(),
            daily_cap: None,
            monthly_cap: None,
            is_active: true,
            description: String::new(),
            created_at: parse_ts("2026-01-01T00:00:00Z"),
        }
    }

    #[tokio::test]
    async fn second_terminal_record_for_same_lead_returns_existing() {
        let pool = setup_pool().await;
        let repo = SqlAssignmentRepository::new(pool.clone());
        let lead = lead("L-1");
        let at = parse_ts("2026-05-01T09:00:01Z");

        let first = Assignment::assigned(&lead, &rule(), at);
        assert_eq!(repo.record_terminal(first.clone(), None).await.unwrap(), RecordOutcome::Inserted);

        let second = Assignment::unassigned(&lead, UnassignedReason::NoMatch, at);
        let outcome = repo.record_terminal(second, None).await.unwrap();
        assert_eq!(outcome, RecordOutcome::AlreadyRecorded(first.clone()));
        assert_eq!(repo.find_by_lead(&lead.id).await.unwrap(), Some(first));
        pool.close().await;
    }

    #[tokio::test]
    async fn mark_published_only_flips_once() {
        let pool = setup_pool().await;
        let repo = SqlAssignmentRepository::new(pool.clone());
        let lead = lead("L-2");
        let at = parse_ts("2026-05-01T09:00:01Z");

        repo.record_terminal(Assignment::assigned(&lead, &rule(), at), None).await.unwrap();
        assert!(repo.mark_published(&lead.id, at).await.unwrap());
        assert!(!repo.mark_published(&lead.id, at).await.unwrap());

        let stored = repo.find_by_lead(&lead.id).await.unwrap().expect("stored");
        assert_eq!(stored.published_at, Some(at));
        pool.close().await;
    }

    #[tokio::test]
    async fn publication_claim_is_exclusive_until_expiry_or_release() {
        let pool = setup_pool().await;
        let repo = SqlAssignmentRepository::new(pool.clone());
        let lead = lead("L-4");
        let at = parse_ts("2026-05-01T09:00:01Z");
        let until = at + Duration::seconds(60);

        repo.record_terminal(Assignment::assigned(&lead, &rule(), at), None).await.unwrap();
        assert!(repo.claim_publication(&lead.id, at, until).await.unwrap());
        let contended = repo.claim_publication(&lead.id, at + Duration::seconds(1), until);
        assert!(!contended.await.unwrap());

        // an abandoned claim can be taken over once it lapses
        let later = until + Duration::seconds(1);
        assert!(repo.claim_publication(&lead.id, until, later).await.unwrap());

        repo.release_publication(&lead.id).await.unwrap();
        assert!(repo.claim_publication(&lead.id, until, later).await.unwrap());

        assert!(repo.mark_published(&lead.id, until).await.unwrap());
        assert!(!repo.claim_publication(&lead.id, later, later).await.unwrap());
        pool.close().await;
    }

    #[tokio::test]
    async fn unassigned_entries_expire_but_anchor_survives() {
        let pool = setup_pool().await;
        let repo = SqlAssignmentRepository::new(pool.clone());
        let lead = lead("L-3");
        let at = parse_ts("2026-05-01T09:00:01Z");
        let entry =
            UnassignedEntry::new(&lead, UnassignedReason::CapsExhausted, at, Duration::days(30));

        repo.record_terminal(
            Assignment::unassigned(&lead, UnassignedReason::CapsExhausted, at),
            Some(entry.clone()),
        )
        .await
        .unwrap();
        assert_eq!(repo.list(10).await.unwrap(), vec![entry]);

        assert_eq!(repo.purge_expired(at + Duration::days(29)).await.unwrap(), 0);
        assert_eq!(repo.purge_expired(at + Duration::days(30)).await.unwrap(), 1);
        assert!(repo.list(10).await.unwrap().is_empty());
        assert!(repo.find_by_lead(&lead.id).await.unwrap().is_some());
        pool.close().await;
    }
}
