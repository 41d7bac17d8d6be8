use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use leadroute_core::domain::rule::{AssignmentRule, FunnelScope, OrgId, RuleId, UserId, ZipPattern};

use super::{encode_timestamp, parse_timestamp, RepositoryError, RuleRepository};
use crate::DbPool;

pub struct SqlRuleRepository {
    pool: DbPool,
}

impl SqlRuleRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl RuleRepository for SqlRuleRepository {
    async fn list_active(&self) -> Result<Vec<AssignmentRule>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                id,
                funnel_id,
                target_org_id,
                target_user_id,
                priority,
                zip_patterns_json,
                daily_cap,
                monthly_cap,
                is_active,
                description,
                created_at
             FROM assignment_rule
             WHERE is_active = 1 AND deleted_at IS NULL
             ORDER BY priority ASC, created_at ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(rule_from_row).collect()
    }

    async fn find_by_id(&self, id: &RuleId) -> Result<Option<AssignmentRule>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                id,
                funnel_id,
                target_org_id,
                target_user_id,
                priority,
                zip_patterns_json,
                daily_cap,
                monthly_cap,
                is_active,
                description,
                created_at
             FROM assignment_rule
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(rule_from_row).transpose()
    }

    async fn save(&self, rule: AssignmentRule) -> Result<(), RepositoryError> {
        rule.validate()?;

        let patterns: Vec<&str> = rule.zip_patterns.iter().map(ZipPattern::as_str).collect();
        let zip_patterns_json = serde_json::to_string(&patterns)?;
        let now = encode_timestamp(Utc::now());

        sqlx::query(
            "INSERT INTO assignment_rule (
                id,
                funnel_id,
                target_org_id,
                target_user_id,
                priority,
                zip_patterns_json,
                daily_cap,
                monthly_cap,
                is_active,
                description,
                created_at,
                updated_at,
                deleted_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
             ON CONFLICT(id) DO UPDATE SET
                funnel_id = excluded.funnel_id,
                target_org_id = excluded.target_org_id,
                target_user_id = excluded.target_user_id,
                priority = excluded.priority,
                zip_patterns_json = excluded.zip_patterns_json,
                daily_cap = excluded.daily_cap,
                monthly_cap = excluded.monthly_cap,
                is_active = excluded.is_active,
                description = excluded.description,
                updated_at = excluded.updated_at,
                deleted_at = NULL",
        )
        .bind(&rule.id.0)
        .bind(rule.funnel.as_str())
        .bind(&rule.target_org_id.0)
        .bind(rule.target_user_id.as_ref().map(|id| id.0.as_str()))
        .bind(rule.priority)
        .bind(zip_patterns_json)
        .bind(rule.daily_cap.map(i64::from))
        .bind(rule.monthly_cap.map(i64::from))
        .bind(rule.is_active)
        .bind(&rule.description)
        .bind(encode_timestamp(rule.created_at))
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn soft_delete(&self, id: &RuleId, at: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE assignment_rule
             SET deleted_at = ?, updated_at = ?
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(encode_timestamp(at))
        .bind(encode_timestamp(at))
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

fn rule_from_row(row: SqliteRow) -> Result<AssignmentRule, RepositoryError> {
    let zip_patterns_json = row.try_get::<String, _>("zip_patterns_json")?;
    let patterns: Vec<String> = serde_json::from_str(&zip_patterns_json).map_err(|error| {
        RepositoryError::Decode(format!(
            "invalid zip_patterns_json `{zip_patterns_json}` ({error})"
        ))
    })?;

    Ok(AssignmentRule {
        id: RuleId(row.try_get("id")?),
        funnel: FunnelScope::parse(&row.try_get::<String, _>("funnel_id")?),
        target_org_id: OrgId(row.try_get("target_org_id")?),
        target_user_id: row.try_get::<Option<String>, _>("target_user_id")?.map(UserId),
        priority: row.try_get("priority")?,
        zip_patterns: patterns.into_iter().map(ZipPattern::new).collect(),
        daily_cap: parse_cap("daily_cap", row.try_get("daily_cap")?)?,
        monthly_cap: parse_cap("monthly_cap", row.try_get("monthly_cap")?)?,
        is_active: row.try_get("is_active")?,
        description: row.try_get("description")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

fn parse_cap(column: &str, value: Option<i64>) -> Result<Option<u32>, RepositoryError> {
    value.map(|cap| super::parse_u32(column, cap)).transpose()
}
