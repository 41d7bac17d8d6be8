use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::lead::LeadId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeadEventId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadEventState {
    Queued,
    Leased,
    RetryableFailed,
    DeadLettered,
    Completed,
}

impl LeadEventState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Leased => "leased",
            Self::RetryableFailed => "retryable_failed",
            Self::DeadLettered => "dead_lettered",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "queued" => Some(Self::Queued),
            "leased" => Some(Self::Leased),
            "retryable_failed" => Some(Self::RetryableFailed),
            "dead_lettered" => Some(Self::DeadLettered),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::DeadLettered | Self::Completed)
    }

    pub fn all() -> [Self; 5] {
        [Self::Queued, Self::Leased, Self::RetryableFailed, Self::DeadLettered, Self::Completed]
    }
}

/// One delivery unit on the lead event queue. `state_version` guards every
/// transition with a compare-and-swap.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadEventRecord {
    pub id: LeadEventId,
    pub lead_id: Option<LeadId>,
    pub payload_json: String,
    pub payload_hash: String,
    pub state: LeadEventState,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub available_at: DateTime<Utc>,
    pub leased_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub error_class: Option<String>,
    pub state_version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LeadEventRecord {
    /// Claimable now: waiting, backed off and due, or leased past its expiry.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            LeadEventState::Queued | LeadEventState::RetryableFailed => self.available_at <= now,
            LeadEventState::Leased => self.lease_expires_at.is_some_and(|expiry| expiry <= now),
            LeadEventState::DeadLettered | LeadEventState::Completed => false,
        }
    }
}
