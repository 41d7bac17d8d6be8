//! Optimistic cap accounting.
//!
//! Counters are never locked across a round trip. Each reservation reads the
//! current counts, plans the increments and writes them conditionally; a
//! conflicting writer forces a re-read until the retry budget runs out.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use leadroute_core::capacity::{limits_for, plan_reservation, ReservationPlan};
use leadroute_core::domain::rule::AssignmentRule;
use leadroute_db::repositories::{CapCounterRepository, RepositoryError};

pub const DEFAULT_RETRY_BUDGET: u32 = 16;

#[derive(Debug, Error)]
pub enum CapTrackerError {
    #[error("cap counters for rule `{rule_id}` still contended after {attempts} attempts")]
    Contention { rule_id: String, attempts: u32 },
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Clone)]
pub struct CapTracker {
    counters: Arc<dyn CapCounterRepository>,
    retry_budget: u32,
}

impl CapTracker {
    pub fn new(counters: Arc<dyn CapCounterRepository>) -> Self {
        Self { counters, retry_budget: DEFAULT_RETRY_BUDGET }
    }

    pub fn with_retry_budget(mut self, retry_budget: u32) -> Self {
        self.retry_budget = retry_budget.max(1);
        self
    }

    /// Admits one more lead under `rule`'s caps at `now`.
    ///
    /// `Ok(false)` leaves every counter untouched. A granted reservation is
    /// final; nothing hands capacity back.
    pub async fn try_reserve(
        &self,
        rule: &AssignmentRule,
        now: DateTime<Utc>,
    ) -> Result<bool, CapTrackerError> {
        let limits = limits_for(rule, now);
        if limits.is_empty() {
            return Ok(true);
        }
        let keys: Vec<_> = limits.iter().map(|limit| limit.key.clone()).collect();

        for attempt in 1..=self.retry_budget {
            let snapshots = self.counters.read_counts(&keys).await?;

            let increments = match plan_reservation(&limits, &snapshots) {
                ReservationPlan::Unlimited => return Ok(true),
                ReservationPlan::Exhausted { key, cap, count } => {
                    debug!(
                        event_name = "router.cap.exhausted",
                        rule_id = %rule.id.0,
                        period_kind = key.period_kind.as_str(),
                        period_key = %key.period_key.0,
                        cap,
                        count,
                        "rule is at capacity"
                    );
                    return Ok(false);
                }
                ReservationPlan::Admit(increments) => increments,
            };

            if self.counters.compare_and_increment(&increments, now).await? {
                return Ok(true);
            }

            debug!(
                event_name = "router.cap.conflict",
                rule_id = %rule.id.0,
                attempt,
                "cap counter moved since read; retrying"
            );
            tokio::task::yield_now().await;
        }

        Err(CapTrackerError::Contention {
            rule_id: rule.id.0.clone(),
            attempts: self.retry_budget,
        })
    }
}
