pub mod cap_tracker;
pub mod consumer;
pub mod dispatcher;
pub mod ingress;
pub mod maintenance;
pub mod publisher;
pub mod runtime;

pub use cap_tracker::{CapTracker, CapTrackerError};
pub use consumer::{ConsumerError, DrainSummary, LeadEventConsumer, ProcessOutcome, WorkerPool};
pub use dispatcher::{AssignmentDispatcher, DispatchError, DispatchReport, Disposition};
pub use ingress::{LeadEventIngress, RequeueError};
pub use maintenance::{RetentionSweeper, SweepReport};
pub use publisher::{
    publisher_for, InMemoryOutcomePublisher, OutboxOutcomePublisher, OutcomePublisher,
    PublishError, TracingOutcomePublisher,
};
pub use runtime::RoutingServices;
