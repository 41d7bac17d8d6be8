use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use leadroute_core::domain::assignment::{Assignment, OutcomeEvent, UnassignedEntry};
use leadroute_core::domain::capacity::{CapCounterKey, CapCounterSnapshot, CounterIncrement};
use leadroute_core::domain::lead::LeadId;
use leadroute_core::domain::queue::{LeadEventId, LeadEventRecord, LeadEventState};
use leadroute_core::domain::rule::{AssignmentRule, RuleId};

use super::{
    AssignmentRepository, CapCounterRepository, LeadEventQueueRepository, OutboxEntry,
    OutboxRepository, RecordOutcome, RepositoryError, RuleRepository, UnassignedRepository,
};

struct StoredRule {
    rule: AssignmentRule,
    deleted_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct InMemoryRuleRepository {
    rules: RwLock<HashMap<String, StoredRule>>,
}

impl InMemoryRuleRepository {
    pub fn with_rules(rules: impl IntoIterator<Item = AssignmentRule>) -> Self {
        let rules = rules
            .into_iter()
            .map(|rule| (rule.id.0.clone(), StoredRule { rule, deleted_at: None }))
            .collect();
        Self { rules: RwLock::new(rules) }
    }
}

#[async_trait::async_trait]
impl RuleRepository for InMemoryRuleRepository {
    async fn list_active(&self) -> Result<Vec<AssignmentRule>, RepositoryError> {
        let rules = self.rules.read().await;
        Ok(rules
            .values()
            .filter(|stored| stored.deleted_at.is_none() && stored.rule.is_active)
            .map(|stored| stored.rule.clone())
            .collect())
    }

    async fn find_by_id(&self, id: &RuleId) -> Result<Option<AssignmentRule>, RepositoryError> {
        let rules = self.rules.read().await;
        Ok(rules
            .get(&id.0)
            .filter(|stored| stored.deleted_at.is_none())
            .map(|stored| stored.rule.clone()))
    }

    async fn save(&self, rule: AssignmentRule) -> Result<(), RepositoryError> {
        rule.validate()?;
        let mut rules = self.rules.write().await;
        rules.insert(rule.id.0.clone(), StoredRule { rule, deleted_at: None });
        Ok(())
    }

    async fn soft_delete(&self, id: &RuleId, at: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let mut rules = self.rules.write().await;
        match rules.get_mut(&id.0) {
            Some(stored) if stored.deleted_at.is_none() => {
                stored.deleted_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

struct StoredCounter {
    count: u32,
    period_ends_at: DateTime<Utc>,
}

/// Counter store whose write lock is held only for the compare step of a
/// conditional increment, like a row lock in the SQL store.
#[derive(Default)]
pub struct InMemoryCapCounterRepository {
    counters: RwLock<HashMap<CapCounterKey, StoredCounter>>,
}

impl InMemoryCapCounterRepository {
    pub async fn count(&self, key: &CapCounterKey) -> u32 {
        self.counters.read().await.get(key).map(|stored| stored.count).unwrap_or(0)
    }

    pub async fn set_count(&self, key: CapCounterKey, count: u32, period_ends_at: DateTime<Utc>) {
        self.counters.write().await.insert(key, StoredCounter { count, period_ends_at });
    }
}

#[async_trait::async_trait]
impl CapCounterRepository for InMemoryCapCounterRepository {
    async fn read_counts(
        &self,
        keys: &[CapCounterKey],
    ) -> Result<Vec<CapCounterSnapshot>, RepositoryError> {
        let counters = self.counters.read().await;
        Ok(keys
            .iter()
            .filter_map(|key| {
                counters
                    .get(key)
                    .map(|stored| CapCounterSnapshot { key: key.clone(), count: stored.count })
            })
            .collect())
    }

    async fn compare_and_increment(
        &self,
        increments: &[CounterIncrement],
        _now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut counters = self.counters.write().await;

        let unchanged = increments.iter().all(|increment| {
            let current = counters.get(&increment.key).map(|stored| stored.count).unwrap_or(0);
            current == increment.expected
        });
        if !unchanged {
            return Ok(false);
        }

        for increment in increments {
            counters.insert(
                increment.key.clone(),
                StoredCounter {
                    count: increment.next_count(),
                    period_ends_at: increment.period_ends_at,
                },
            );
        }

        Ok(true)
    }

    async fn purge_ended_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let mut counters = self.counters.write().await;
        let before = counters.len();
        counters.retain(|_, stored| stored.period_ends_at >= cutoff);
        Ok((before - counters.len()) as u64)
    }
}

#[derive(Default)]
struct AssignmentTables {
    assignments: HashMap<String, Assignment>,
    unassigned: HashMap<String, UnassignedEntry>,
    publish_claims: HashMap<String, DateTime<Utc>>,
}

#[derive(Default)]
pub struct InMemoryAssignmentRepository {
    tables: RwLock<AssignmentTables>,
}

#[async_trait::async_trait]
impl AssignmentRepository for InMemoryAssignmentRepository {
    async fn find_by_lead(&self, lead_id: &LeadId) -> Result<Option<Assignment>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables.assignments.get(&lead_id.0).cloned())
    }

    async fn record_terminal(
        &self,
        assignment: Assignment,
        unassigned: Option<UnassignedEntry>,
    ) -> Result<RecordOutcome, RepositoryError> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables.assignments.get(&assignment.lead_id.0) {
            return Ok(RecordOutcome::AlreadyRecorded(existing.clone()));
        }

        if let Some(entry) = unassigned {
            tables.unassigned.insert(entry.lead_id.0.clone(), entry);
        }
        tables.assignments.insert(assignment.lead_id.0.clone(), assignment);
        Ok(RecordOutcome::Inserted)
    }

    async fn claim_publication(
        &self,
        lead_id: &LeadId,
        now: DateTime<Utc>,
        claim_until: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut tables = self.tables.write().await;
        let unpublished = tables
            .assignments
            .get(&lead_id.0)
            .is_some_and(|assignment| assignment.published_at.is_none());
        let held = tables.publish_claims.get(&lead_id.0).is_some_and(|until| *until > now);
        if !unpublished || held {
            return Ok(false);
        }

        tables.publish_claims.insert(lead_id.0.clone(), claim_until);
        Ok(true)
    }

    async fn release_publication(&self, lead_id: &LeadId) -> Result<(), RepositoryError> {
        self.tables.write().await.publish_claims.remove(&lead_id.0);
        Ok(())
    }

    async fn mark_published(
        &self,
        lead_id: &LeadId,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut tables = self.tables.write().await;
        tables.publish_claims.remove(&lead_id.0);
        match tables.assignments.get_mut(&lead_id.0) {
            Some(assignment) if assignment.published_at.is_none() => {
                assignment.published_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait::async_trait]
impl UnassignedRepository for InMemoryAssignmentRepository {
    async fn list(&self, limit: u32) -> Result<Vec<UnassignedEntry>, RepositoryError> {
        let tables = self.tables.read().await;
        let mut entries: Vec<UnassignedEntry> = tables.unassigned.values().cloned().collect();
        entries.sort_by(|left, right| {
            left.recorded_at
                .cmp(&right.recorded_at)
                .then_with(|| left.lead_id.0.cmp(&right.lead_id.0))
        });
        entries.truncate(limit as usize);
        Ok(entries)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let mut tables = self.tables.write().await;
        let before = tables.unassigned.len();
        tables.unassigned.retain(|_, entry| !entry.is_expired(now));
        Ok((before - tables.unassigned.len()) as u64)
    }
}

#[derive(Default)]
pub struct InMemoryLeadEventQueueRepository {
    records: RwLock<HashMap<String, LeadEventRecord>>,
}

#[async_trait::async_trait]
impl LeadEventQueueRepository for InMemoryLeadEventQueueRepository {
    async fn insert(&self, record: LeadEventRecord) -> Result<(), RepositoryError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.id.0) {
            return Err(RepositoryError::Conflict(format!(
                "lead event `{}` already exists",
                record.id.0
            )));
        }
        records.insert(record.id.0.clone(), record);
        Ok(())
    }

    async fn find_by_id(
        &self,
        id: &LeadEventId,
    ) -> Result<Option<LeadEventRecord>, RepositoryError> {
        let records = self.records.read().await;
        Ok(records.get(&id.0).cloned())
    }

    async fn find_claimable(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<LeadEventRecord>, RepositoryError> {
        let records = self.records.read().await;
        let mut claimable: Vec<LeadEventRecord> =
            records.values().filter(|record| record.is_claimable(now)).cloned().collect();
        claimable.sort_by(|left, right| {
            left.available_at
                .cmp(&right.available_at)
                .then_with(|| left.created_at.cmp(&right.created_at))
        });
        claimable.truncate(limit as usize);
        Ok(claimable)
    }

    async fn compare_and_swap(
        &self,
        record: &LeadEventRecord,
        expected_version: u32,
    ) -> Result<bool, RepositoryError> {
        let mut records = self.records.write().await;
        match records.get_mut(&record.id.0) {
            Some(stored) if stored.state_version == expected_version => {
                *stored = record.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_by_state(
        &self,
        state: LeadEventState,
        limit: u32,
    ) -> Result<Vec<LeadEventRecord>, RepositoryError> {
        let records = self.records.read().await;
        let mut matching: Vec<LeadEventRecord> =
            records.values().filter(|record| record.state == state).cloned().collect();
        matching.sort_by(|left, right| {
            left.updated_at.cmp(&right.updated_at).then_with(|| left.id.0.cmp(&right.id.0))
        });
        matching.truncate(limit as usize);
        Ok(matching)
    }

    async fn count_by_state(&self) -> Result<Vec<(LeadEventState, u64)>, RepositoryError> {
        let records = self.records.read().await;
        Ok(LeadEventState::all()
            .into_iter()
            .map(|state| {
                let count = records.values().filter(|record| record.state == state).count();
                (state, count as u64)
            })
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryOutboxRepository {
    entries: RwLock<Vec<OutboxEntry>>,
}

impl InMemoryOutboxRepository {
    pub async fn entry_count(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait::async_trait]
impl OutboxRepository for InMemoryOutboxRepository {
    async fn append(
        &self,
        event: &OutcomeEvent,
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let payload_json = serde_json::to_string(event)?;
        let mut entries = self.entries.write().await;
        let id = entries.len() as i64 + 1;
        entries.push(OutboxEntry {
            id,
            lead_id: LeadId(event.lead_id.clone()),
            outcome: event.outcome,
            payload_json,
            created_at: at,
        });
        Ok(())
    }

    async fn list_for_lead(&self, lead_id: &LeadId) -> Result<Vec<OutboxEntry>, RepositoryError> {
        let entries = self.entries.read().await;
        Ok(entries.iter().filter(|entry| entry.lead_id == *lead_id).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use leadroute_core::domain::capacity::{CapCounterKey, CounterIncrement, PeriodKind};
    use leadroute_core::domain::rule::{AssignmentRule, FunnelScope, OrgId, RuleId, ZipPattern};

    use crate::repositories::{
        CapCounterRepository, InMemoryCapCounterRepository, InMemoryRuleRepository,
        RepositoryError, RuleRepository,
    };

    fn rule(id: &str) -> AssignmentRule {
        AssignmentRule {
            id: RuleId(id.to_string()),
            funnel: FunnelScope::Any,
            target_org_id: OrgId("org-1".to_string()),
            target_user_id: None,
            priority: 1,
            zip_patterns: Vec::new(),
            daily_cap: None,
            monthly_cap: None,
            is_active: true,
            description: String::new(),
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn in_memory_rule_repo_round_trip_and_soft_delete() {
        let repo = InMemoryRuleRepository::default();
        let rule = rule("rule-1");

        repo.save(rule.clone()).await.expect("save rule");
        assert_eq!(repo.find_by_id(&rule.id).await.expect("find"), Some(rule.clone()));

        assert!(repo.soft_delete(&rule.id, Utc::now()).await.expect("delete"));
        assert!(repo.list_active().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn in_memory_rule_repo_validates_on_save() {
        let repo = InMemoryRuleRepository::default();
        let mut invalid = rule("rule-2");
        invalid.zip_patterns = vec![ZipPattern::new("")];

        assert!(matches!(repo.save(invalid).await, Err(RepositoryError::Invalid(_))));
    }

    #[tokio::test]
    async fn in_memory_counter_rejects_stale_expectation() {
        let repo = InMemoryCapCounterRepository::default();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let key = CapCounterKey::for_instant(&RuleId("rule-1".to_string()), PeriodKind::Day, now);
        let increment = |expected| CounterIncrement {
            key: key.clone(),
            expected,
            period_ends_at: now + Duration::hours(12),
        };

        assert!(repo.compare_and_increment(&[increment(0)], now).await.unwrap());
        assert!(!repo.compare_and_increment(&[increment(0)], now).await.unwrap());
        assert_eq!(repo.count(&key).await, 1);
    }
}
