use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeadId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunnelId(pub String);

impl fmt::Display for LeadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable routing input.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lead {
    pub id: LeadId,
    pub funnel_id: FunnelId,
    pub zip_code: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Wire shape of the inbound "lead created" event. Every field is optional at
/// decode time so validation can report all missing fields at once.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadCreatedEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lead_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub funnel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zip_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldIssue {
    pub field: String,
    pub message: String,
}

impl FieldIssue {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self { field: field.to_string(), message: message.into() }
    }
}

/// A lead event that can never be routed, no matter how often it is retried.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("malformed lead event: {}", summarize(.issues))]
pub struct MalformedEvent {
    pub code: String,
    pub issues: Vec<FieldIssue>,
}

impl MalformedEvent {
    pub const CODE: &'static str = "VALIDATION_ERROR";

    pub fn new(issues: Vec<FieldIssue>) -> Self {
        Self { code: Self::CODE.to_string(), issues }
    }

    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::new(vec![FieldIssue::new("payload", message)])
    }
}

fn summarize(issues: &[FieldIssue]) -> String {
    issues
        .iter()
        .map(|issue| format!("{}: {}", issue.field, issue.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl LeadCreatedEvent {
    pub fn from_json(payload: &str) -> Result<Self, MalformedEvent> {
        serde_json::from_str(payload)
            .map_err(|error| MalformedEvent::invalid_payload(format!("not a valid event: {error}")))
    }

    pub fn lead_id(&self) -> Option<LeadId> {
        non_blank(self.lead_id.as_deref()).map(LeadId)
    }

    /// Validates the event into a routable lead. `received_at` stands in for a
    /// missing `createdAt`.
    pub fn into_lead(self, received_at: DateTime<Utc>) -> Result<Lead, MalformedEvent> {
        let mut issues = Vec::new();

        let lead_id = non_blank(self.lead_id.as_deref());
        if lead_id.is_none() {
            issues.push(FieldIssue::new("leadId", "is required"));
        }

        let funnel_id = non_blank(self.funnel_id.as_deref());
        if funnel_id.is_none() {
            issues.push(FieldIssue::new("funnelId", "is required"));
        }

        let created_at = match non_blank(self.created_at.as_deref()) {
            Some(raw) => match DateTime::parse_from_rfc3339(&raw) {
                Ok(timestamp) => Some(timestamp.with_timezone(&Utc)),
                Err(error) => {
                    issues.push(FieldIssue::new(
                        "createdAt",
                        format!("must be an ISO8601 timestamp ({error})"),
                    ));
                    None
                }
            },
            None => Some(received_at),
        };

        match (lead_id, funnel_id, created_at) {
            (Some(lead_id), Some(funnel_id), Some(created_at)) if issues.is_empty() => Ok(Lead {
                id: LeadId(lead_id),
                funnel_id: FunnelId(funnel_id),
                zip_code: non_blank(self.zip_code.as_deref()),
                created_at,
            }),
            _ => Err(MalformedEvent::new(issues)),
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|value| !value.is_empty()).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{LeadCreatedEvent, MalformedEvent};

    #[test]
    fn decodes_camel_case_event_into_lead() {
        let event = LeadCreatedEvent::from_json(
            r#"{"leadId":"L-1","funnelId":"roofing","zipCode":" 90210 ","createdAt":"2026-03-04T10:00:00Z"}"#,
        )
        .expect("decode");

        let lead = event.into_lead(Utc::now()).expect("valid lead");
        assert_eq!(lead.id.0, "L-1");
        assert_eq!(lead.funnel_id.0, "roofing");
        assert_eq!(lead.zip_code.as_deref(), Some("90210"));
        assert_eq!(lead.created_at, Utc.with_ymd_and_hms(2026, 3, 4, 10, 0, 0).unwrap());
    }

    #[test]
    fn missing_identifiers_are_reported_together() {
        let error = LeadCreatedEvent { zip_code: Some("90210".to_string()), ..Default::default() }
            .into_lead(Utc::now())
            .expect_err("missing ids");

        assert_eq!(error.code, MalformedEvent::CODE);
        let fields: Vec<_> = error.issues.iter().map(|issue| issue.field.as_str()).collect();
        assert_eq!(fields, vec!["leadId", "funnelId"]);
    }

    #[test]
    fn blank_zip_code_is_treated_as_absent() {
        let lead = LeadCreatedEvent {
            lead_id: Some("L-2".to_string()),
            funnel_id: Some("plumbing".to_string()),
            zip_code: Some("   ".to_string()),
            created_at: None,
        }
        .into_lead(Utc::now())
        .expect("valid lead");

        assert_eq!(lead.zip_code, None);
    }

    #[test]
    fn missing_created_at_defaults_to_receipt_time() {
        let received_at = Utc.with_ymd_and_hms(2026, 5, 1, 8, 30, 0).unwrap();
        let lead = LeadCreatedEvent {
            lead_id: Some("L-3".to_string()),
            funnel_id: Some("roofing".to_string()),
            ..Default::default()
        }
        .into_lead(received_at)
        .expect("valid lead");

        assert_eq!(lead.created_at, received_at);
    }

    #[test]
    fn unparseable_created_at_is_malformed() {
        let error = LeadCreatedEvent {
            lead_id: Some("L-4".to_string()),
            funnel_id: Some("roofing".to_string()),
            created_at: Some("yesterday".to_string()),
            ..Default::default()
        }
        .into_lead(Utc::now())
        .expect_err("bad timestamp");

        assert_eq!(error.issues[0].field, "createdAt");
    }

    #[test]
    fn non_json_payload_is_malformed() {
        let error = LeadCreatedEvent::from_json("not-json").expect_err("invalid json");
        assert_eq!(error.issues[0].field, "payload");
        assert!(error.to_string().starts_with("malformed lead event: payload"));
    }
}
