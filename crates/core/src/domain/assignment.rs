use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::lead::{FunnelId, Lead, LeadId};
use crate::domain::rule::{AssignmentRule, OrgId, RuleId, UserId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssignmentId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingOutcome {
    Assigned,
    Unassigned,
}

impl RoutingOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assigned => "assigned",
            Self::Unassigned => "unassigned",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "assigned" => Some(Self::Assigned),
            "unassigned" => Some(Self::Unassigned),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnassignedReason {
    NoMatch,
    CapsExhausted,
}

impl UnassignedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoMatch => "no_match",
            Self::CapsExhausted => "caps_exhausted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "no_match" => Some(Self::NoMatch),
            "caps_exhausted" => Some(Self::CapsExhausted),
            _ => None,
        }
    }
}

/// The terminal routing record for a lead. `lead_id` is unique across the
/// store and is the idempotency anchor for every redelivery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: AssignmentId,
    pub lead_id: LeadId,
    pub funnel_id: FunnelId,
    pub rule_id: Option<RuleId>,
    pub org_id: Option<OrgId>,
    pub user_id: Option<UserId>,
    pub outcome: RoutingOutcome,
    pub reason: Option<UnassignedReason>,
    pub assigned_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

impl Assignment {
    pub fn assigned(lead: &Lead, rule: &AssignmentRule, at: DateTime<Utc>) -> Self {
        Self {
            id: AssignmentId(Uuid::new_v4().to_string()),
            lead_id: lead.id.clone(),
            funnel_id: lead.funnel_id.clone(),
            rule_id: Some(rule.id.clone()),
            org_id: Some(rule.target_org_id.clone()),
            user_id: rule.target_user_id.clone(),
            outcome: RoutingOutcome::Assigned,
            reason: None,
            assigned_at: at,
            published_at: None,
        }
    }

    pub fn unassigned(lead: &Lead, reason: UnassignedReason, at: DateTime<Utc>) -> Self {
        Self {
            id: AssignmentId(Uuid::new_v4().to_string()),
            lead_id: lead.id.clone(),
            funnel_id: lead.funnel_id.clone(),
            rule_id: None,
            org_id: None,
            user_id: None,
            outcome: RoutingOutcome::Unassigned,
            reason: Some(reason),
            assigned_at: at,
            published_at: None,
        }
    }

    pub fn is_published(&self) -> bool {
        self.published_at.is_some()
    }

    pub fn outcome_event(&self) -> OutcomeEvent {
        OutcomeEvent {
            lead_id: self.lead_id.0.clone(),
            funnel_id: self.funnel_id.0.clone(),
            outcome: self.outcome,
            org_id: self.org_id.as_ref().map(|org| org.0.clone()),
            user_id: self.user_id.as_ref().map(|user| user.0.clone()),
            rule_id: self.rule_id.as_ref().map(|rule| rule.0.clone()),
            reason: self.reason,
        }
    }
}

/// Holding-area entry for a lead no rule could claim. Entries expire; they are
/// never re-driven automatically.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnassignedEntry {
    pub lead_id: LeadId,
    pub funnel_id: FunnelId,
    pub zip_code: Option<String>,
    pub reason: UnassignedReason,
    pub recorded_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl UnassignedEntry {
    pub fn new(
        lead: &Lead,
        reason: UnassignedReason,
        recorded_at: DateTime<Utc>,
        retention: Duration,
    ) -> Self {
        Self {
            lead_id: lead.id.clone(),
            funnel_id: lead.funnel_id.clone(),
            zip_code: lead.zip_code.clone(),
            reason,
            recorded_at,
            expires_at: recorded_at + retention,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Outbound message for the notification pipeline. Carries `leadId` so
/// consumers can discard re-publications.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeEvent {
    pub lead_id: String,
    pub funnel_id: String,
    pub outcome: RoutingOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<UnassignedReason>,
}
