use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;

use leadroute_core::audit::AuditSink;
use leadroute_core::config::AppConfig;
use leadroute_core::lease::LeaseEngine;
use leadroute_db::repositories::{
    CapCounterRepository, LeadEventQueueRepository, SqlAssignmentRepository,
    SqlCapCounterRepository, SqlLeadEventQueueRepository, SqlOutboxRepository, SqlRuleRepository,
    UnassignedRepository,
};
use leadroute_db::DbPool;

use crate::cap_tracker::CapTracker;
use crate::consumer::{LeadEventConsumer, WorkerPool};
use crate::dispatcher::AssignmentDispatcher;
use crate::ingress::LeadEventIngress;
use crate::maintenance::RetentionSweeper;
use crate::publisher::publisher_for;

/// The routing pipeline wired against one SQLite pool.
pub struct RoutingServices {
    pub dispatcher: Arc<AssignmentDispatcher>,
    pub consumer: Arc<LeadEventConsumer>,
    pub ingress: LeadEventIngress,
    pub queue: Arc<dyn LeadEventQueueRepository>,
    counters: Arc<dyn CapCounterRepository>,
    unassigned: Arc<dyn UnassignedRepository>,
    config: AppConfig,
}

impl RoutingServices {
    pub fn sqlite(pool: DbPool, config: &AppConfig, audit: Arc<dyn AuditSink>) -> Self {
        let assignments = Arc::new(SqlAssignmentRepository::new(pool.clone()));
        let counters: Arc<dyn CapCounterRepository> =
            Arc::new(SqlCapCounterRepository::new(pool.clone()));
        let queue: Arc<dyn LeadEventQueueRepository> =
            Arc::new(SqlLeadEventQueueRepository::new(pool.clone()));
        let publisher = publisher_for(
            config.publisher.sink,
            Arc::new(SqlOutboxRepository::new(pool.clone())),
        );

        let cap_tracker = CapTracker::new(Arc::clone(&counters))
            .with_retry_budget(config.routing.cap_retry_budget);
        let dispatcher = Arc::new(
            AssignmentDispatcher::new(
                Arc::new(SqlRuleRepository::new(pool)),
                assignments.clone(),
                cap_tracker,
                publisher,
                audit,
            )
            .with_unassigned_retention(Duration::days(i64::from(
                config.routing.unassigned_retention_days,
            )))
            .with_publish_claim(config.queue.lease_duration()),
        );

        let engine = LeaseEngine::with_config(config.queue.lease_engine_config());
        let consumer = Arc::new(LeadEventConsumer::new(
            Arc::clone(&queue),
            Arc::clone(&dispatcher),
            engine.clone(),
        ));

        Self {
            dispatcher,
            consumer,
            ingress: LeadEventIngress::new(Arc::clone(&queue), engine),
            queue,
            counters,
            unassigned: assignments,
            config: config.clone(),
        }
    }

    pub fn worker_pool(&self) -> WorkerPool {
        WorkerPool::new(
            Arc::clone(&self.consumer),
            self.config.queue.worker_count,
            StdDuration::from_millis(self.config.queue.poll_interval_ms),
        )
    }

    pub fn sweeper(&self) -> RetentionSweeper {
        RetentionSweeper::new(Arc::clone(&self.counters), Arc::clone(&self.unassigned))
            .with_counter_grace(Duration::days(i64::from(self.config.routing.counter_grace_days)))
    }
}
