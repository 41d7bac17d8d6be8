use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::lead::Lead;
use crate::errors::DomainError;

/// Funnel identifier a rule uses to accept leads from every funnel.
pub const ANY_FUNNEL: &str = "*";

const WILDCARD: char = '*';

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrgId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which funnels a rule accepts leads from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FunnelScope {
    Any,
    Funnel(String),
}

impl FunnelScope {
    pub fn parse(value: &str) -> Self {
        let trimmed = value.trim();
        if trimmed == ANY_FUNNEL {
            Self::Any
        } else {
            Self::Funnel(trimmed.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Any => ANY_FUNNEL,
            Self::Funnel(funnel) => funnel,
        }
    }

    pub fn accepts(&self, funnel_id: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Funnel(funnel) => funnel == funnel_id,
        }
    }
}

impl From<String> for FunnelScope {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<FunnelScope> for String {
    fn from(value: FunnelScope) -> Self {
        value.as_str().to_string()
    }
}

/// A zip code filter. A trailing `*` turns the pattern into a prefix match;
/// anything else must match the lead's zip code exactly.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ZipPattern(String);

impl ZipPattern {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, zip_code: &str) -> bool {
        let zip_code = zip_code.trim();
        match self.0.strip_suffix(WILDCARD) {
            Some(prefix) => zip_code.starts_with(prefix),
            None => zip_code == self.0,
        }
    }

    fn validate(&self) -> Result<(), String> {
        if self.0.is_empty() {
            return Err("zip pattern must not be empty".to_string());
        }

        let body = self.0.strip_suffix(WILDCARD).unwrap_or(&self.0);
        if body.contains(WILDCARD) {
            return Err(format!(
                "zip pattern `{}` may only use `*` as its final character",
                self.0
            ));
        }

        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentRule {
    pub id: RuleId,
    pub funnel: FunnelScope,
    pub target_org_id: OrgId,
    pub target_user_id: Option<UserId>,
    pub priority: i64,
    pub zip_patterns: Vec<ZipPattern>,
    pub daily_cap: Option<u32>,
    pub monthly_cap: Option<u32>,
    pub is_active: bool,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl AssignmentRule {
    /// Location filter only; an empty pattern set accepts every lead.
    pub fn matches_zip(&self, zip_code: Option<&str>) -> bool {
        if self.zip_patterns.is_empty() {
            return true;
        }

        match zip_code {
            Some(zip_code) => self.zip_patterns.iter().any(|pattern| pattern.matches(zip_code)),
            None => false,
        }
    }

    pub fn is_candidate_for(&self, lead: &Lead) -> bool {
        self.is_active
            && self.funnel.accepts(&lead.funnel_id.0)
            && self.matches_zip(lead.zip_code.as_deref())
    }

    /// Checks the definition at the rule store write boundary.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.id.0.trim().is_empty() {
            return Err(DomainError::InvalidRule("rule id must not be empty".to_string()));
        }

        if self.funnel.as_str().is_empty() {
            return Err(DomainError::InvalidRule(format!(
                "rule `{}` must name a funnel or `{ANY_FUNNEL}`",
                self.id
            )));
        }

        if self.target_org_id.0.trim().is_empty() {
            return Err(DomainError::InvalidRule(format!(
                "rule `{}` must target an organization",
                self.id
            )));
        }

        if let Some(user_id) = &self.target_user_id {
            if user_id.0.trim().is_empty() {
                return Err(DomainError::InvalidRule(format!(
                    "rule `{}` has a blank target user",
                    self.id
                )));
            }
        }

        for pattern in &self.zip_patterns {
            pattern
                .validate()
                .map_err(|message| DomainError::InvalidRule(format!("rule `{}`: {message}", self.id)))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{AssignmentRule, FunnelScope, OrgId, RuleId, UserId, ZipPattern};
    use crate::domain::lead::{FunnelId, Lead, LeadId};
    use crate::errors::DomainError;

    fn rule(funnel: &str, patterns: &[&str]) -> AssignmentRule {
        AssignmentRule {
            id: RuleId("rule-1".to_string()),
            funnel: FunnelScope::parse(funnel),
            target_org_id: OrgId("org-west".to_string()),
            target_user_id: None,
            priority: 1,
            zip_patterns: patterns.iter().map(|pattern| ZipPattern::new(*pattern)).collect(),
            daily_cap: None,
            monthly_cap: None,
            is_active: true,
            description: "west coast roofing".to_string(),
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn lead(funnel: &str, zip: Option<&str>) -> Lead {
        Lead {
            id: LeadId("lead-1".to_string()),
            funnel_id: FunnelId(funnel.to_string()),
            zip_code: zip.map(str::to_string),
            created_at: Utc.with_ymd_and_hms(2026, 3, 4, 10, 0, 0).unwrap(),
        }
    }

    #[test]
    fn prefix_pattern_matches_only_zip_codes_with_that_prefix() {
        let pattern = ZipPattern::new("90*");
        assert!(pattern.matches("90210"));
        assert!(!pattern.matches("80210"));
    }

    #[test]
    fn literal_pattern_requires_exact_zip_code() {
        let pattern = ZipPattern::new("90210");
        assert!(pattern.matches("90210"));
        assert!(pattern.matches(" 90210 "));
        assert!(!pattern.matches("902101"));
        assert!(!pattern.matches("9021"));
    }

    #[test]
    fn bare_wildcard_matches_any_present_zip_code() {
        let candidate = rule("roofing", &["*"]);
        assert!(candidate.matches_zip(Some("10001")));
        assert!(!candidate.matches_zip(None));
    }

    #[test]
    fn rule_without_patterns_accepts_any_location() {
        let candidate = rule("roofing", &[]);
        assert!(candidate.is_candidate_for(&lead("roofing", None)));
        assert!(candidate.is_candidate_for(&lead("roofing", Some("33101"))));
    }

    #[test]
    fn wildcard_funnel_accepts_every_funnel() {
        let candidate = rule("*", &[]);
        assert!(candidate.is_candidate_for(&lead("plumbing", Some("10001"))));
        assert!(!rule("roofing", &[]).is_candidate_for(&lead("plumbing", Some("10001"))));
    }

    #[test]
    fn inactive_rule_is_never_a_candidate() {
        let mut candidate = rule("*", &[]);
        candidate.is_active = false;
        assert!(!candidate.is_candidate_for(&lead("roofing", Some("90210"))));
    }

    #[test]
    fn validate_rejects_interior_wildcards() {
        let error = rule("roofing", &["9*0"]).validate().expect_err("interior wildcard");
        assert!(matches!(error, DomainError::InvalidRule(ref message) if message.contains("9*0")));
    }

    #[test]
    fn validate_rejects_blank_target_user() {
        let mut candidate = rule("roofing", &["90*"]);
        candidate.target_user_id = Some(UserId("  ".to_string()));
        assert!(candidate.validate().is_err());
    }

    #[test]
    fn funnel_scope_serializes_as_plain_string() {
        let encoded = serde_json::to_string(&FunnelScope::Any).expect("serialize");
        assert_eq!(encoded, "\"*\"");
        let decoded: FunnelScope = serde_json::from_str("\"roofing\"").expect("deserialize");
        assert_eq!(decoded, FunnelScope::Funnel("roofing".to_string()));
    }
}
