use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::rule::RuleId;

/// Calendar window a cap applies to. Windows are UTC.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodKind {
    Day,
    Month,
}

impl PeriodKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Month => "month",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "day" => Some(Self::Day),
            "month" => Some(Self::Month),
            _ => None,
        }
    }

    /// `2026-10-17` for days, `2026-10` for months.
    pub fn key_for(&self, at: DateTime<Utc>) -> PeriodKey {
        match self {
            Self::Day => PeriodKey(at.format("%Y-%m-%d").to_string()),
            Self::Month => PeriodKey(at.format("%Y-%m").to_string()),
        }
    }

    /// First instant after the window containing `at`.
    pub fn window_end(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let date = at.date_naive();
        let next_start = match self {
            Self::Day => date.succ_opt(),
            Self::Month => {
                let (year, month) = if date.month() == 12 {
                    (date.year() + 1, 1)
                } else {
                    (date.year(), date.month() + 1)
                };
                NaiveDate::from_ymd_opt(year, month, 1)
            }
        };

        next_start
            .map(|start| start.and_time(NaiveTime::MIN).and_utc())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeriodKey(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CapCounterKey {
    pub rule_id: RuleId,
    pub period_kind: PeriodKind,
    pub period_key: PeriodKey,
}

impl CapCounterKey {
    pub fn for_instant(rule_id: &RuleId, period_kind: PeriodKind, at: DateTime<Utc>) -> Self {
        Self { rule_id: rule_id.clone(), period_kind, period_key: period_kind.key_for(at) }
    }
}

impl fmt::Display for CapCounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.rule_id, self.period_kind.as_str(), self.period_key.0)
    }
}

/// Point-in-time read of a counter. Counters that were never written read as
/// zero; `count` only grows within a period, so it doubles as the version used
/// by conditional writes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapCounterSnapshot {
    pub key: CapCounterKey,
    pub count: u32,
}

/// Conditional write: succeed only if the stored count still equals
/// `expected`, then store `expected + 1`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterIncrement {
    pub key: CapCounterKey,
    pub expected: u32,
    pub period_ends_at: DateTime<Utc>,
}

impl CounterIncrement {
    pub fn next_count(&self) -> u32 {
        self.expected.saturating_add(1)
    }
}
