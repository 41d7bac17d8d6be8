//! Per-lead routing: guard, match, reserve, persist, publish.
//!
//! The terminal record keyed by lead id is the only idempotency anchor. Every
//! delivery of the same lead converges on it, so redelivery after a crash or a
//! lease timeout is always safe. Publishing additionally takes a timed claim
//! on that record, so two live deliveries never publish the same lead.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{info, warn};

use leadroute_core::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
use leadroute_core::domain::assignment::{Assignment, UnassignedEntry, UnassignedReason};
use leadroute_core::domain::lead::{Lead, LeadCreatedEvent, LeadId, MalformedEvent};
use leadroute_core::domain::rule::AssignmentRule;
use leadroute_core::errors::DomainError;
use leadroute_core::matcher::RuleMatcher;
use leadroute_core::routing::{RoutingStage, RoutingTrail};
use leadroute_db::repositories::{AssignmentRepository, RecordOutcome, RuleRepository};

use crate::cap_tracker::{CapTracker, CapTrackerError};
use crate::publisher::OutcomePublisher;

pub const ERROR_CLASS_MALFORMED: &str = "malformed_event";

const ACTOR: &str = "assignment-dispatcher";
const DEFAULT_UNASSIGNED_RETENTION_DAYS: i64 = 30;
const DEFAULT_PUBLISH_CLAIM_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Malformed(#[from] MalformedEvent),
    #[error("transient failure while {}: {message}", .stage.as_str())]
    Transient { stage: RoutingStage, message: String },
    #[error("lead `{lead_id}` is being published by another delivery")]
    PublicationInFlight { lead_id: String },
    #[error(transparent)]
    Invariant(#[from] DomainError),
}

impl DispatchError {
    fn transient(stage: RoutingStage, error: impl std::fmt::Display) -> Self {
        Self::Transient { stage, message: error.to_string() }
    }

    /// Only infrastructure failures can succeed on redelivery.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::PublicationInFlight { .. })
    }

    pub fn error_class(&self) -> &'static str {
        match self {
            Self::Malformed(_) => ERROR_CLASS_MALFORMED,
            Self::Transient { stage: RoutingStage::Received, .. } => "assignment_lookup_failed",
            Self::Transient { stage: RoutingStage::Matching, .. } => "matching_failed",
            Self::Transient { stage: RoutingStage::Assigned | RoutingStage::Unassigned, .. } => {
                "assignment_write_failed"
            }
            Self::Transient { .. } => "publish_failed",
            Self::PublicationInFlight { .. } => "publication_in_flight",
            Self::Invariant(_) => "routing_invariant_violated",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// First delivery: outcome decided, persisted and published.
    Routed,
    /// Record already existed but its publication never completed.
    Republished,
    /// Record already existed and was published; nothing to do.
    Duplicate,
    /// A concurrent delivery persisted first; that worker publishes.
    LostRace,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Routed => "routed",
            Self::Republished => "republished",
            Self::Duplicate => "duplicate",
            Self::LostRace => "lost_race",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchReport {
    pub assignment: Assignment,
    pub disposition: Disposition,
    pub trail: RoutingTrail,
}

pub struct AssignmentDispatcher {
    rules: Arc<dyn RuleRepository>,
    assignments: Arc<dyn AssignmentRepository>,
    cap_tracker: CapTracker,
    publisher: Arc<dyn OutcomePublisher>,
    audit: Arc<dyn AuditSink>,
    matcher: RuleMatcher,
    unassigned_retention: Duration,
    publish_claim: Duration,
}

impl AssignmentDispatcher {
    pub fn new(
        rules: Arc<dyn RuleRepository>,
        assignments: Arc<dyn AssignmentRepository>,
        cap_tracker: CapTracker,
        publisher: Arc<dyn OutcomePublisher>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            rules,
            assignments,
            cap_tracker,
            publisher,
            audit,
            matcher: RuleMatcher::new(),
            unassigned_retention: Duration::days(DEFAULT_UNASSIGNED_RETENTION_DAYS),
            publish_claim: Duration::seconds(DEFAULT_PUBLISH_CLAIM_SECS),
        }
    }

    pub fn with_unassigned_retention(mut self, retention: Duration) -> Self {
        self.unassigned_retention = retention;
        self
    }

    /// How long a delivery may hold a lead's publication before another
    /// delivery can take it over. Should cover a queue lease.
    pub fn with_publish_claim(mut self, claim: Duration) -> Self {
        self.publish_claim = claim;
        self
    }

    /// Decodes and validates a raw event, then routes it.
    pub async fn dispatch_payload(
        &self,
        payload: &str,
        correlation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<DispatchReport, DispatchError> {
        let decoded = LeadCreatedEvent::from_json(payload).and_then(|event| event.into_lead(now));

        match decoded {
            Ok(lead) => self.dispatch(&lead, correlation_id, now).await,
            Err(malformed) => {
                let lead_id = event_lead_id(payload);
                warn!(
                    event_name = "router.dispatch.malformed",
                    correlation_id,
                    lead_id = lead_id.as_ref().map(|id| id.0.as_str()).unwrap_or("unknown"),
                    error = %malformed,
                    "lead event rejected without routing"
                );
                self.audit.emit(
                    AuditEvent::new(
                        lead_id,
                        correlation_id,
                        "lead.rejected",
                        AuditCategory::Ingress,
                        ACTOR,
                        AuditOutcome::Rejected,
                    )
                    .with_metadata("error", malformed.to_string()),
                );
                Err(DispatchError::Malformed(malformed))
            }
        }
    }

    pub async fn dispatch(
        &self,
        lead: &Lead,
        correlation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<DispatchReport, DispatchError> {
        let mut trail = RoutingTrail::new();

        let existing = self
            .assignments
            .find_by_lead(&lead.id)
            .await
            .map_err(|error| DispatchError::transient(RoutingStage::Received, error))?;
        if let Some(existing) = existing {
            return self.resolve_existing(existing, trail, correlation_id, now).await;
        }

        trail.advance(RoutingStage::Matching)?;
        let rules = self
            .rules
            .list_active()
            .await
            .map_err(|error| DispatchError::transient(RoutingStage::Matching, error))?;
        let candidates = self.matcher.candidates(&rules, lead);

        let (assignment, unassigned) = if candidates.is_empty() {
            self.unassigned(lead, UnassignedReason::NoMatch, now)
        } else {
            match self.reserve_first(&candidates, lead, correlation_id, now).await? {
                Some(rule) => (Assignment::assigned(lead, rule, now), None),
                None => self.unassigned(lead, UnassignedReason::CapsExhausted, now),
            }
        };

        let decided = match assignment.reason {
            None => RoutingStage::Assigned,
            Some(_) => RoutingStage::Unassigned,
        };
        trail.advance(decided)?;

        let recorded = self
            .assignments
            .record_terminal(assignment.clone(), unassigned)
            .await
            .map_err(|error| DispatchError::transient(decided, error))?;

        if let RecordOutcome::AlreadyRecorded(winner) = recorded {
            trail.advance(RoutingStage::Done)?;
            info!(
                event_name = "router.dispatch.lost_race",
                correlation_id,
                lead_id = %lead.id.0,
                "another delivery recorded this lead first"
            );
            return Ok(DispatchReport {
                assignment: winner,
                disposition: Disposition::LostRace,
                trail,
            });
        }

        self.log_decision(&assignment, candidates.len(), correlation_id);

        let published = self.publish(assignment, &mut trail, correlation_id, now).await?;
        trail.advance(RoutingStage::Done)?;

        Ok(DispatchReport { assignment: published, disposition: Disposition::Routed, trail })
    }

    async fn resolve_existing(
        &self,
        existing: Assignment,
        mut trail: RoutingTrail,
        correlation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<DispatchReport, DispatchError> {
        if existing.is_published() {
            trail.advance(RoutingStage::Done)?;
            info!(
                event_name = "router.dispatch.duplicate",
                correlation_id,
                lead_id = %existing.lead_id.0,
                "lead already routed and published; ignoring redelivery"
            );
            self.audit.emit(AuditEvent::new(
                Some(existing.lead_id.clone()),
                correlation_id,
                "lead.duplicate_ignored",
                AuditCategory::Ingress,
                ACTOR,
                AuditOutcome::Success,
            ));
            return Ok(DispatchReport {
                assignment: existing,
                disposition: Disposition::Duplicate,
                trail,
            });
        }

        info!(
            event_name = "router.dispatch.republishing",
            correlation_id,
            lead_id = %existing.lead_id.0,
            "lead recorded but not published; publishing again"
        );
        let published = self.publish(existing, &mut trail, correlation_id, now).await?;
        trail.advance(RoutingStage::Done)?;

        Ok(DispatchReport { assignment: published, disposition: Disposition::Republished, trail })
    }

    /// Walks candidates in order and keeps the first one with capacity.
    async fn reserve_first<'a>(
        &self,
        candidates: &[&'a AssignmentRule],
        lead: &Lead,
        correlation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<&'a AssignmentRule>, DispatchError> {
        for rule in candidates {
            let admitted = self.cap_tracker.try_reserve(rule, now).await.map_err(|error| {
                if let CapTrackerError::Contention { rule_id, attempts } = &error {
                    warn!(
                        event_name = "router.cap.contention",
                        correlation_id,
                        lead_id = %lead.id.0,
                        rule_id = %rule_id,
                        attempts,
                        "cap reservation retry budget exhausted"
                    );
                }
                DispatchError::transient(RoutingStage::Matching, error)
            })?;

            if admitted {
                return Ok(Some(*rule));
            }

            self.audit.emit(
                AuditEvent::new(
                    Some(lead.id.clone()),
                    correlation_id,
                    "capacity.rule_skipped",
                    AuditCategory::Capacity,
                    ACTOR,
                    AuditOutcome::Rejected,
                )
                .with_metadata("rule_id", rule.id.0.clone()),
            );
        }

        Ok(None)
    }

    fn unassigned(
        &self,
        lead: &Lead,
        reason: UnassignedReason,
        now: DateTime<Utc>,
    ) -> (Assignment, Option<UnassignedEntry>) {
        (
            Assignment::unassigned(lead, reason, now),
            Some(UnassignedEntry::new(lead, reason, now, self.unassigned_retention)),
        )
    }

    /// Publishes the outcome under the lead's publication claim, then marks the
    /// record so later deliveries skip it.
    async fn publish(
        &self,
        mut assignment: Assignment,
        trail: &mut RoutingTrail,
        correlation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Assignment, DispatchError> {
        let claim_until =
            now.checked_add_signed(self.publish_claim).unwrap_or(DateTime::<Utc>::MAX_UTC);
        let claimed = self
            .assignments
            .claim_publication(&assignment.lead_id, now, claim_until)
            .await
            .map_err(|error| DispatchError::transient(RoutingStage::Published, error))?;
        if !claimed {
            info!(
                event_name = "router.publish.in_flight",
                correlation_id,
                lead_id = %assignment.lead_id.0,
                "another delivery holds the publication claim; deferring"
            );
            return Err(DispatchError::PublicationInFlight {
                lead_id: assignment.lead_id.0.clone(),
            });
        }

        let event = assignment.outcome_event();
        if let Err(error) = self.publisher.publish(&event, now).await {
            if let Err(release_error) =
                self.assignments.release_publication(&assignment.lead_id).await
            {
                warn!(
                    event_name = "router.publish.release_failed",
                    correlation_id,
                    lead_id = %assignment.lead_id.0,
                    error = %release_error,
                    "publication claim left to expire"
                );
            }
            warn!(
                event_name = "router.publish.failed",
                correlation_id,
                lead_id = %assignment.lead_id.0,
                sink = self.publisher.sink_name(),
                error = %error,
                "outcome publication failed; delivery will be retried"
            );
            self.audit.emit(
                AuditEvent::new(
                    Some(assignment.lead_id.clone()),
                    correlation_id,
                    "outcome.publish_failed",
                    AuditCategory::Publication,
                    ACTOR,
                    AuditOutcome::Failed,
                )
                .with_metadata("error", error.to_string()),
            );
            return Err(DispatchError::transient(RoutingStage::Published, error));
        }

        self.assignments
            .mark_published(&assignment.lead_id, now)
            .await
            .map_err(|error| DispatchError::transient(RoutingStage::Published, error))?;
        assignment.published_at = Some(now);
        trail.advance(RoutingStage::Published)?;

        self.audit.emit(
            AuditEvent::new(
                Some(assignment.lead_id.clone()),
                correlation_id,
                "outcome.published",
                AuditCategory::Publication,
                ACTOR,
                AuditOutcome::Success,
            )
            .with_metadata("outcome", event.outcome.as_str())
            .with_metadata("sink", self.publisher.sink_name()),
        );

        Ok(assignment)
    }

    fn log_decision(&self, assignment: &Assignment, candidate_count: usize, correlation_id: &str) {
        let rule_id = assignment.rule_id.as_ref().map(|id| id.0.as_str()).unwrap_or("");
        let org_id = assignment.org_id.as_ref().map(|id| id.0.as_str()).unwrap_or("");

        let audit = match assignment.reason {
            None => {
                info!(
                    event_name = "router.dispatch.assigned",
                    correlation_id,
                    lead_id = %assignment.lead_id.0,
                    rule_id,
                    org_id,
                    candidate_count,
                    "lead assigned"
                );
                AuditEvent::new(
                    Some(assignment.lead_id.clone()),
                    correlation_id,
                    "lead.assigned",
                    AuditCategory::Assignment,
                    ACTOR,
                    AuditOutcome::Success,
                )
                .with_metadata("rule_id", rule_id)
                .with_metadata("org_id", org_id)
            }
            Some(reason) => {
                info!(
                    event_name = "router.dispatch.unassigned",
                    correlation_id,
                    lead_id = %assignment.lead_id.0,
                    reason = reason.as_str(),
                    candidate_count,
                    "lead left unassigned"
                );
                AuditEvent::new(
                    Some(assignment.lead_id.clone()),
                    correlation_id,
                    "lead.unassigned",
                    AuditCategory::Assignment,
                    ACTOR,
                    AuditOutcome::Success,
                )
                .with_metadata("reason", reason.as_str())
            }
        };

        self.audit.emit(audit.with_metadata("candidate_count", candidate_count.to_string()));
    }
}

/// Best-effort lead id for diagnostics on events that failed validation.
fn event_lead_id(payload: &str) -> Option<LeadId> {
    LeadCreatedEvent::from_json(payload).ok().and_then(|event| event.lead_id())
}
