pub mod audit;
pub mod capacity;
pub mod config;
pub mod domain;
pub mod errors;
pub mod lease;
pub mod matcher;
pub mod routing;

pub use audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink, InMemoryAuditSink};
pub use capacity::{limits_for, plan_reservation, CounterLimit, ReservationPlan};
pub use domain::assignment::{
    Assignment, AssignmentId, OutcomeEvent, RoutingOutcome, UnassignedEntry, UnassignedReason,
};
pub use domain::capacity::{CapCounterKey, CapCounterSnapshot, CounterIncrement, PeriodKind};
pub use domain::lead::{FunnelId, Lead, LeadCreatedEvent, LeadId, MalformedEvent};
pub use domain::queue::{LeadEventId, LeadEventRecord, LeadEventState};
pub use domain::rule::{AssignmentRule, FunnelScope, OrgId, RuleId, UserId, ZipPattern};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use lease::{ClaimOutcome, LeaseEngine, LeaseEngineConfig, LeaseError, RetryPolicy};
pub use matcher::RuleMatcher;
pub use routing::{RoutingStage, RoutingTrail};
