use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use leadroute_core::domain::lead::LeadId;
use leadroute_core::domain::queue::{LeadEventId, LeadEventRecord, LeadEventState};

use super::{
    encode_timestamp, parse_optional_timestamp, parse_timestamp, parse_u32,
    LeadEventQueueRepository, RepositoryError,
};
use crate::DbPool;

pub struct SqlLeadEventQueueRepository {
    pool: DbPool,
}

impl SqlLeadEventQueueRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const SELECT_COLUMNS: &str = "SELECT
        id,
        lead_id,
        payload_json,
        payload_hash,
        state,
        attempt_count,
        max_attempts,
        available_at,
        leased_by,
        lease_expires_at,
        last_error,
        error_class,
        state_version,
        created_at,
        updated_at
     FROM lead_event_queue";

#[async_trait::async_trait]
impl LeadEventQueueRepository for SqlLeadEventQueueRepository {
    async fn insert(&self, record: LeadEventRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO lead_event_queue (
                id,
                lead_id,
                payload_json,
                payload_hash,
                state,
                attempt_count,
                max_attempts,
                available_at,
                leased_by,
                lease_expires_at,
                last_error,
                error_class,
                state_version,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id.0)
        .bind(record.lead_id.as_ref().map(|id| id.0.as_str()))
        .bind(&record.payload_json)
        .bind(&record.payload_hash)
        .bind(record.state.as_str())
        .bind(i64::from(record.attempt_count))
        .bind(i64::from(record.max_attempts))
        .bind(encode_timestamp(record.available_at))
        .bind(record.leased_by.as_deref())
        .bind(record.lease_expires_at.map(encode_timestamp))
        .bind(record.last_error.as_deref())
        .bind(record.error_class.as_deref())
        .bind(i64::from(record.state_version))
        .bind(encode_timestamp(record.created_at))
        .bind(encode_timestamp(record.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_id(
        &self,
        id: &LeadEventId,
    ) -> Result<Option<LeadEventRecord>, RepositoryError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(record_from_row).transpose()
    }

    async fn find_claimable(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<LeadEventRecord>, RepositoryError> {
        let now = encode_timestamp(now);
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS}
             WHERE (state IN ('queued', 'retryable_failed') AND available_at <= ?)
                OR (state = 'leased' AND lease_expires_at <= ?)
             ORDER BY available_at ASC, created_at ASC
             LIMIT ?"
        ))
        .bind(&now)
        .bind(&now)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(record_from_row).collect()
    }

    async fn compare_and_swap(
        &self,
        record: &LeadEventRecord,
        expected_version: u32,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE lead_event_queue
             SET state = ?,
                 attempt_count = ?,
                 max_attempts = ?,
                 available_at = ?,
                 leased_by = ?,
                 lease_expires_at = ?,
                 last_error = ?,
                 error_class = ?,
                 state_version = ?,
                 updated_at = ?
             WHERE id = ? AND state_version = ?",
        )
        .bind(record.state.as_str())
        .bind(i64::from(record.attempt_count))
        .bind(i64::from(record.max_attempts))
        .bind(encode_timestamp(record.available_at))
        .bind(record.leased_by.as_deref())
        .bind(record.lease_expires_at.map(encode_timestamp))
        .bind(record.last_error.as_deref())
        .bind(record.error_class.as_deref())
        .bind(i64::from(record.state_version))
        .bind(encode_timestamp(record.updated_at))
        .bind(&record.id.0)
        .bind(i64::from(expected_version))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_by_state(
        &self,
        state: LeadEventState,
        limit: u32,
    ) -> Result<Vec<LeadEventRecord>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS}
             WHERE state = ?
             ORDER BY updated_at ASC, id ASC
             LIMIT ?"
        ))
        .bind(state.as_str())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(record_from_row).collect()
    }

    async fn count_by_state(&self) -> Result<Vec<(LeadEventState, u64)>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT state, COUNT(*) AS count FROM lead_event_queue GROUP BY state",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts: Vec<(LeadEventState, u64)> =
            LeadEventState::all().into_iter().map(|state| (state, 0)).collect();

        for row in rows {
            let state_raw = row.try_get::<String, _>("state")?;
            let state = LeadEventState::parse(&state_raw).ok_or_else(|| {
                RepositoryError::Decode(format!("unknown lead event state `{state_raw}`"))
            })?;
            let count = u64::try_from(row.try_get::<i64, _>("count")?).unwrap_or_default();
            if let Some(slot) = counts.iter_mut().find(|(known, _)| *known == state) {
                slot.1 = count;
            }
        }

        Ok(counts)
    }
}

fn record_from_row(row: SqliteRow) -> Result<LeadEventRecord, RepositoryError> {
    let state_raw = row.try_get::<String, _>("state")?;
    let state = LeadEventState::parse(&state_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown lead event state `{state_raw}`"))
    })?;

    Ok(LeadEventRecord {
        id: LeadEventId(row.try_get("id")?),
        lead_id: row.try_get::<Option<String>, _>("lead_id")?.map(LeadId),
        payload_json: row.try_get("payload_json")?,
        payload_hash: row.try_get("payload_hash")?,
        state,
        attempt_count: parse_u32("attempt_count", row.try_get("attempt_count")?)?,
        max_attempts: parse_u32("max_attempts", row.try_get("max_attempts")?)?,
        available_at: parse_timestamp("available_at", row.try_get("available_at")?)?,
        leased_by: row.try_get("leased_by")?,
        lease_expires_at: parse_optional_timestamp(
            "lease_expires_at",
            row.try_get("lease_expires_at")?,
        )?,
        last_error: row.try_get("last_error")?,
        error_class: row.try_get("error_class")?,
        state_version: parse_u32("state_version", row.try_get("state_version")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}
