use chrono::{DateTime, Duration, Utc};

use leadroute_core::domain::rule::{AssignmentRule, FunnelScope, OrgId, RuleId, UserId, ZipPattern};

use crate::repositories::{RepositoryError, RuleRepository};

struct DemoRuleContract {
    id: &'static str,
    funnel: &'static str,
    target_org_id: &'static str,
    target_user_id: Option<&'static str>,
    priority: i64,
    zip_patterns: &'static [&'static str],
    daily_cap: Option<u32>,
    monthly_cap: Option<u32>,
    /// Offset from the seed instant; orders equal-priority rules.
    created_offset_minutes: i64,
    description: &'static str,
}

const DEMO_RULES: &[DemoRuleContract] = &[
    DemoRuleContract {
        id: "rule-roofing-west",
        funnel: "roofing",
        target_org_id: "org-summit-roofing",
        target_user_id: Some("user-dana"),
        priority: 1,
        zip_patterns: &["90*"],
        daily_cap: Some(1),
        monthly_cap: None,
        created_offset_minutes: 0,
        description: "Los Angeles roofing partner, one lead per day",
    },
    DemoRuleContract {
        id: "rule-any-fallback",
        funnel: "*",
        target_org_id: "org-central-intake",
        target_user_id: None,
        priority: 2,
        zip_patterns: &[],
        daily_cap: None,
        monthly_cap: None,
        created_offset_minutes: 1,
        description: "Catch-all intake desk",
    },
    DemoRuleContract {
        id: "rule-plumbing-nyc",
        funnel: "plumbing",
        target_org_id: "org-hudson-plumbing",
        target_user_id: None,
        priority: 1,
        zip_patterns: &["100*", "112*"],
        daily_cap: Some(25),
        monthly_cap: Some(400),
        created_offset_minutes: 2,
        description: "NYC plumbing partner",
    },
    DemoRuleContract {
        id: "rule-solar-tier1",
        funnel: "solar",
        target_org_id: "org-sunrise-solar",
        target_user_id: None,
        priority: 5,
        zip_patterns: &["9*"],
        daily_cap: None,
        monthly_cap: Some(200),
        created_offset_minutes: 3,
        description: "Western solar installer, first in line",
    },
    DemoRuleContract {
        id: "rule-solar-tier2",
        funnel: "solar",
        target_org_id: "org-brightpath-solar",
        target_user_id: None,
        priority: 5,
        zip_patterns: &["9*"],
        daily_cap: None,
        monthly_cap: None,
        created_offset_minutes: 4,
        description: "Western solar installer, same priority, created later",
    },
];

/// Deterministic demo rule set used by `seed` and by contract tests.
///
/// Covers the capped-primary/uncapped-fallback roofing pair, a funnel-scoped
/// rule with both caps, and an equal-priority pair ordered by creation time.
pub struct DemoRuleSet;

impl DemoRuleSet {
    pub fn rules(seeded_at: DateTime<Utc>) -> Vec<AssignmentRule> {
        DEMO_RULES
            .iter()
            .map(|contract| AssignmentRule {
                id: RuleId(contract.id.to_string()),
                funnel: FunnelScope::parse(contract.funnel),
                target_org_id: OrgId(contract.target_org_id.to_string()),
                target_user_id: contract.target_user_id.map(|id| UserId(id.to_string())),
                priority: contract.priority,
                zip_patterns: contract.zip_patterns.iter().map(|p| ZipPattern::new(*p)).collect(),
                daily_cap: contract.daily_cap,
                monthly_cap: contract.monthly_cap,
                is_active: true,
                description: contract.description.to_string(),
                created_at: seeded_at + Duration::minutes(contract.created_offset_minutes),
            })
            .collect()
    }

    /// Upserts every demo rule. Re-running keeps the set identical.
    pub async fn load(
        repo: &dyn RuleRepository,
        seeded_at: DateTime<Utc>,
    ) -> Result<SeedResult, RepositoryError> {
        let mut rules_seeded = Vec::with_capacity(DEMO_RULES.len());
        for rule in Self::rules(seeded_at) {
            let existing = repo.find_by_id(&rule.id).await?;
            // Keep the original creation time so tie-break order survives reseeding.
            let rule = match existing {
                Some(existing) => AssignmentRule { created_at: existing.created_at, ..rule },
                None => rule,
            };
            rules_seeded.push(rule.id.0.clone());
            repo.save(rule).await?;
        }

        Ok(SeedResult { rules_seeded })
    }

    pub async fn verify(repo: &dyn RuleRepository) -> Result<VerificationResult, RepositoryError> {
        let mut checks = Vec::with_capacity(DEMO_RULES.len());
        for contract in DEMO_RULES {
            let found = repo.find_by_id(&RuleId(contract.id.to_string())).await?;
            let passed = found.is_some_and(|rule| {
                rule.is_active
                    && rule.priority == contract.priority
                    && rule.funnel.as_str() == contract.funnel
                    && rule.daily_cap == contract.daily_cap
                    && rule.monthly_cap == contract.monthly_cap
                    && rule.zip_patterns.len() == contract.zip_patterns.len()
            });
            checks.push(VerificationCheck { rule_id: contract.id.to_string(), passed });
        }

        let all_passed = checks.iter().all(|check| check.passed);
        Ok(VerificationResult { checks, all_passed })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeedResult {
    pub rules_seeded: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerificationCheck {
    pub rule_id: String,
    pub passed: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerificationResult {
    pub checks: Vec<VerificationCheck>,
    pub all_passed: bool,
}
