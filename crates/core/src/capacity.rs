//! Cap admission planning.
//!
//! Decides, from a counter read, whether one more lead fits under a rule's
//! caps and which conditional increments would confirm it. Storage and retry
//! live with the caller.

use chrono::{DateTime, Utc};

use crate::domain::capacity::{CapCounterKey, CapCounterSnapshot, CounterIncrement, PeriodKind};
use crate::domain::rule::AssignmentRule;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CounterLimit {
    pub key: CapCounterKey,
    pub cap: u32,
    pub period_ends_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReservationPlan {
    /// No cap configured; nothing to count.
    Unlimited,
    /// Apply every increment atomically to confirm the reservation.
    Admit(Vec<CounterIncrement>),
    /// The first dimension found at its cap.
    Exhausted { key: CapCounterKey, cap: u32, count: u32 },
}

/// Counters a reservation against `rule` at `now` must move, daily first.
pub fn limits_for(rule: &AssignmentRule, now: DateTime<Utc>) -> Vec<CounterLimit> {
    [(PeriodKind::Day, rule.daily_cap), (PeriodKind::Month, rule.monthly_cap)]
        .into_iter()
        .filter_map(|(kind, cap)| {
            cap.map(|cap| CounterLimit {
                key: CapCounterKey::for_instant(&rule.id, kind, now),
                cap,
                period_ends_at: kind.window_end(now),
            })
        })
        .collect()
}

pub fn plan_reservation(
    limits: &[CounterLimit],
    snapshots: &[CapCounterSnapshot],
) -> ReservationPlan {
    if limits.is_empty() {
        return ReservationPlan::Unlimited;
    }

    let mut increments = Vec::with_capacity(limits.len());
    for limit in limits {
        let count = snapshots
            .iter()
            .find(|snapshot| snapshot.key == limit.key)
            .map(|snapshot| snapshot.count)
            .unwrap_or(0);

        if count >= limit.cap {
            return ReservationPlan::Exhausted { key: limit.key.clone(), cap: limit.cap, count };
        }

        increments.push(CounterIncrement {
            key: limit.key.clone(),
            expected: count,
            period_ends_at: limit.period_ends_at,
        });
    }

    ReservationPlan::Admit(increments)
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};

    use super::{limits_for, plan_reservation, ReservationPlan};
    use crate::domain::capacity::{CapCounterKey, CapCounterSnapshot, PeriodKind};
    use crate::domain::rule::{AssignmentRule, FunnelScope, OrgId, RuleId};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 15, 14, 0, 0).unwrap()
    }

    fn rule(daily_cap: Option<u32>, monthly_cap: Option<u32>) -> AssignmentRule {
        AssignmentRule {
            id: RuleId("rule-cap".to_string()),
            funnel: FunnelScope::Any,
            target_org_id: OrgId("org-1".to_string()),
            target_user_id: None,
            priority: 1,
            zip_patterns: Vec::new(),
            daily_cap,
            monthly_cap,
            is_active: true,
            description: String::new(),
            created_at: now(),
        }
    }

    fn snapshot(kind: PeriodKind, count: u32) -> CapCounterSnapshot {
        CapCounterSnapshot {
            key: CapCounterKey::for_instant(&RuleId("rule-cap".to_string()), kind, now()),
            count,
        }
    }

    #[test]
    fn uncapped_rule_needs_no_counters() {
        let limits = limits_for(&rule(None, None), now());
        assert!(limits.is_empty());
        assert_eq!(plan_reservation(&limits, &[]), ReservationPlan::Unlimited);
    }

    #[test]
    fn only_configured_dimensions_are_counted() {
        let limits = limits_for(&rule(None, Some(100)), now());
        assert_eq!(limits.len(), 1);
        assert_eq!(limits[0].key.period_kind, PeriodKind::Month);
        assert_eq!(limits[0].key.period_key.0, "2026-06");
    }

    #[test]
    fn admits_with_expected_counts_from_snapshot() {
        let limits = limits_for(&rule(Some(5), Some(50)), now());
        let plan = plan_reservation(
            &limits,
            &[snapshot(PeriodKind::Day, 2), snapshot(PeriodKind::Month, 30)],
        );

        let ReservationPlan::Admit(increments) = plan else {
            panic!("expected admission, got {plan:?}");
        };
        assert_eq!(increments.len(), 2);
        assert_eq!(increments[0].expected, 2);
        assert_eq!(increments[0].next_count(), 3);
        assert_eq!(increments[1].expected, 30);
    }

    #[test]
    fn missing_snapshot_reads_as_zero() {
        let limits = limits_for(&rule(Some(1), None), now());
        let ReservationPlan::Admit(increments) = plan_reservation(&limits, &[]) else {
            panic!("expected admission");
        };
        assert_eq!(increments[0].expected, 0);
    }

    #[test]
    fn monthly_exhaustion_blocks_even_with_daily_headroom() {
        let limits = limits_for(&rule(Some(10), Some(40)), now());
        let plan = plan_reservation(
            &limits,
            &[snapshot(PeriodKind::Day, 1), snapshot(PeriodKind::Month, 40)],
        );

        assert!(matches!(
            plan,
            ReservationPlan::Exhausted { ref key, cap: 40, count: 40 }
                if key.period_kind == PeriodKind::Month
        ));
    }

    #[test]
    fn zero_cap_never_admits() {
        let limits = limits_for(&rule(Some(0), None), now());
        assert!(matches!(plan_reservation(&limits, &[]), ReservationPlan::Exhausted { .. }));
    }
}
