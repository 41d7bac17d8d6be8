//! Rule selection for a single lead.
//!
//! Pure over a rule store snapshot: the same snapshot and lead always yield the
//! same candidate order.

use std::cmp::Ordering;

use crate::domain::lead::Lead;
use crate::domain::rule::AssignmentRule;

#[derive(Clone, Debug, Default)]
pub struct RuleMatcher;

impl RuleMatcher {
    pub fn new() -> Self {
        Self
    }

    /// Active rules eligible for `lead`, in evaluation order.
    pub fn candidates<'a>(
        &self,
        rules: &'a [AssignmentRule],
        lead: &Lead,
    ) -> Vec<&'a AssignmentRule> {
        let mut candidates: Vec<&AssignmentRule> =
            rules.iter().filter(|rule| rule.is_candidate_for(lead)).collect();
        candidates.sort_by(|left, right| evaluation_order(left, right));
        candidates
    }
}

/// Lower priority first, then earliest created, then rule id so the order is
/// total even when timestamps collide.
pub fn evaluation_order(left: &AssignmentRule, right: &AssignmentRule) -> Ordering {
    left.priority
        .cmp(&right.priority)
        .then_with(|| left.created_at.cmp(&right.created_at))
        .then_with(|| left.id.cmp(&right.id))
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use super::RuleMatcher;
    use crate::domain::lead::{FunnelId, Lead, LeadId};
    use crate::domain::rule::{AssignmentRule, FunnelScope, OrgId, RuleId, ZipPattern};

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 10, 12, 0, 0).unwrap()
    }

    fn rule(id: &str, funnel: &str, priority: i64, patterns: &[&str]) -> AssignmentRule {
        AssignmentRule {
            id: RuleId(id.to_string()),
            funnel: FunnelScope::parse(funnel),
            target_org_id: OrgId(format!("org-{id}")),
            target_user_id: None,
            priority,
            zip_patterns: patterns.iter().map(|pattern| ZipPattern::new(*pattern)).collect(),
            daily_cap: None,
            monthly_cap: None,
            is_active: true,
            description: String::new(),
            created_at: base_time(),
        }
    }

    fn lead(funnel: &str, zip: &str) -> Lead {
        Lead {
            id: LeadId("L-1".to_string()),
            funnel_id: FunnelId(funnel.to_string()),
            zip_code: Some(zip.to_string()),
            created_at: base_time(),
        }
    }

    fn ids(candidates: &[&AssignmentRule]) -> Vec<String> {
        candidates.iter().map(|rule| rule.id.0.clone()).collect()
    }

    #[test]
    fn orders_candidates_by_ascending_priority() {
        let rules = vec![
            rule("catch-all", "*", 9, &[]),
            rule("roofing-west", "roofing", 1, &["90*"]),
            rule("roofing-any", "roofing", 4, &[]),
        ];

        let candidates = RuleMatcher::new().candidates(&rules, &lead("roofing", "90210"));
        assert_eq!(ids(&candidates), vec!["roofing-west", "roofing-any", "catch-all"]);
    }

    #[test]
    fn equal_priority_resolves_to_earliest_created_rule() {
        let mut later = rule("later", "*", 5, &[]);
        later.created_at = base_time() + Duration::minutes(5);
        let earlier = rule("earlier", "*", 5, &[]);
        let rules = vec![later, earlier];

        for _ in 0..10 {
            let candidates = RuleMatcher::new().candidates(&rules, &lead("roofing", "90210"));
            assert_eq!(ids(&candidates), vec!["earlier", "later"]);
        }
    }

    #[test]
    fn identical_priority_and_timestamp_fall_back_to_rule_id() {
        let rules = vec![rule("b", "*", 5, &[]), rule("a", "*", 5, &[])];
        let candidates = RuleMatcher::new().candidates(&rules, &lead("roofing", "90210"));
        assert_eq!(ids(&candidates), vec!["a", "b"]);
    }

    #[test]
    fn excludes_inactive_wrong_funnel_and_wrong_zip_rules() {
        let mut inactive = rule("inactive", "*", 0, &[]);
        inactive.is_active = false;
        let rules = vec![
            inactive,
            rule("plumbing", "plumbing", 1, &[]),
            rule("east-coast", "roofing", 1, &["10*"]),
            rule("exact", "roofing", 2, &["90210"]),
        ];

        let candidates = RuleMatcher::new().candidates(&rules, &lead("roofing", "90210"));
        assert_eq!(ids(&candidates), vec!["exact"]);
    }

    #[test]
    fn returns_no_candidates_when_nothing_applies() {
        let rules = vec![rule("roofing", "roofing", 1, &[])];
        let candidates = RuleMatcher::new().candidates(&rules, &lead("plumbing", "10001"));
        assert!(candidates.is_empty());
    }

    #[test]
    fn snapshot_order_does_not_change_result() {
        let forward = vec![
            rule("r1", "*", 3, &[]),
            rule("r2", "roofing", 1, &[]),
            rule("r3", "roofing", 2, &["9*"]),
        ];
        let mut reversed = forward.clone();
        reversed.reverse();

        let matcher = RuleMatcher::new();
        let target = lead("roofing", "90210");
        assert_eq!(
            ids(&matcher.candidates(&forward, &target)),
            ids(&matcher.candidates(&reversed, &target))
        );
    }
}
