use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use leadroute_core::domain::capacity::{
    CapCounterKey, CapCounterSnapshot, CounterIncrement, PeriodKey, PeriodKind,
};
use leadroute_core::domain::rule::RuleId;

use super::{encode_timestamp, parse_u32, CapCounterRepository, RepositoryError};
use crate::DbPool;

pub struct SqlCapCounterRepository {
    pool: DbPool,
}

impl SqlCapCounterRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl CapCounterRepository for SqlCapCounterRepository {
    async fn read_counts(
        &self,
        keys: &[CapCounterKey],
    ) -> Result<Vec<CapCounterSnapshot>, RepositoryError> {
        let mut snapshots = Vec::with_capacity(keys.len());

        for key in keys {
            let row = sqlx::query(
                "SELECT rule_id, period_kind, period_key, count
                 FROM cap_counter
                 WHERE rule_id = ? AND period_kind = ? AND period_key = ?",
            )
            .bind(&key.rule_id.0)
            .bind(key.period_kind.as_str())
            .bind(&key.period_key.0)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(row) = row {
                snapshots.push(snapshot_from_row(row)?);
            }
        }

        Ok(snapshots)
    }

    async fn compare_and_increment(
        &self,
        increments: &[CounterIncrement],
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let updated_at = encode_timestamp(now);

        for increment in increments {
            let result = if increment.expected == 0 {
                // An absent row reads as zero; whoever creates it first wins.
                sqlx::query(
                    "INSERT INTO cap_counter (
                        rule_id,
                        period_kind,
                        period_key,
                        count,
                        period_ends_at,
                        updated_at
                     ) VALUES (?, ?, ?, ?, ?, ?)
                     ON CONFLICT(rule_id, period_kind, period_key) DO NOTHING",
                )
                .bind(&increment.key.rule_id.0)
                .bind(increment.key.period_kind.as_str())
                .bind(&increment.key.period_key.0)
                .bind(i64::from(increment.next_count()))
                .bind(encode_timestamp(increment.period_ends_at))
                .bind(&updated_at)
                .execute(&mut *tx)
                .await?
            } else {
                sqlx::query(
                    "UPDATE cap_counter
                     SET count = ?, updated_at = ?
                     WHERE rule_id = ? AND period_kind = ? AND period_key = ? AND count = ?",
                )
                .bind(i64::from(increment.next_count()))
                .bind(&updated_at)
                .bind(&increment.key.rule_id.0)
                .bind(increment.key.period_kind.as_str())
                .bind(&increment.key.period_key.0)
                .bind(i64::from(increment.expected))
                .execute(&mut *tx)
                .await?
            };

            if result.rows_affected() != 1 {
                tx.rollback().await?;
                return Ok(false);
            }
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn purge_ended_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM cap_counter WHERE period_ends_at < ?")
            .bind(encode_timestamp(cutoff))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

fn snapshot_from_row(row: SqliteRow) -> Result<CapCounterSnapshot, RepositoryError> {
    let kind_raw = row.try_get::<String, _>("period_kind")?;
    let period_kind = PeriodKind::parse(&kind_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown period kind `{kind_raw}`")))?;

    Ok(CapCounterSnapshot {
        key: CapCounterKey {
            rule_id: RuleId(row.try_get("rule_id")?),
            period_kind,
            period_key: PeriodKey(row.try_get("period_key")?),
        },
        count: parse_u32("count", row.try_get("count")?)?,
    })
}
