use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use leadroute_core::audit::InMemoryAuditSink;
use leadroute_core::config::AppConfig;
use leadroute_core::domain::lead::LeadId;
use leadroute_core::domain::queue::LeadEventState;
use leadroute_core::domain::rule::{AssignmentRule, RuleId};
use leadroute_core::lease::{ClaimOutcome, LeaseEngine, LeaseEngineConfig};
use leadroute_db::repositories::{
    AssignmentRepository, LeadEventQueueRepository, OutboxRepository, RepositoryError,
    RuleRepository, SqlAssignmentRepository, SqlCapCounterRepository,
    SqlLeadEventQueueRepository, SqlOutboxRepository, SqlRuleRepository,
};
use leadroute_db::{connect_with_settings, migrations, DbPool, DemoRuleSet};
use leadroute_router::{
    AssignmentDispatcher, CapTracker, InMemoryOutcomePublisher, LeadEventConsumer,
    ProcessOutcome, RoutingServices,
};

async fn seeded_pool() -> DbPool {
    let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
    migrations::run_pending(&pool).await.expect("migrate");
    let seeded_at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    DemoRuleSet::load(&SqlRuleRepository::new(pool.clone()), seeded_at).await.expect("seed");
    pool
}

fn services(pool: &DbPool) -> RoutingServices {
    let mut config = AppConfig::default();
    config.queue.poll_interval_ms = 10;
    config.queue.worker_count = 3;
    RoutingServices::sqlite(pool.clone(), &config, Arc::new(InMemoryAuditSink::default()))
}

async fn state_count(queue: &dyn LeadEventQueueRepository, state: LeadEventState) -> u64 {
    queue
        .count_by_state()
        .await
        .expect("counts")
        .into_iter()
        .find(|(known, _)| *known == state)
        .map(|(_, count)| count)
        .unwrap_or(0)
}

#[tokio::test]
async fn drain_routes_valid_events_and_dead_letters_malformed_ones() {
    let pool = seeded_pool().await;
    let services = services(&pool);
    let now = Utc::now();
    let payload = r#"{"leadId":"L-q1","funnelId":"plumbing","zipCode":"10001"}"#;

    services.ingress.enqueue(payload, now).await.unwrap();
    services.ingress.enqueue(payload, now).await.unwrap();
    let malformed = services.ingress.enqueue(r#"{"funnelId":"plumbing"}"#, now).await.unwrap();

    let summary = services.consumer.drain("worker-test").await.expect("drain");
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.dead_lettered, 1);
    assert_eq!(summary.retrying, 0);

    let outbox = SqlOutboxRepository::new(pool.clone());
    let published = outbox.list_for_lead(&LeadId("L-q1".to_string())).await.unwrap();
    assert_eq!(published.len(), 1);
    assert!(published[0].payload_json.contains("rule-plumbing-nyc"));

    let dead = services.ingress.dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, malformed.id);
    assert_eq!(dead[0].error_class.as_deref(), Some("malformed_event"));
    assert_eq!(dead[0].attempt_count, 1);

    assert_eq!(state_count(services.queue.as_ref(), LeadEventState::Completed).await, 2);
    pool.close().await;
}

#[tokio::test]
async fn abandoned_lease_is_redelivered_after_expiry() {
    let pool = seeded_pool().await;
    let services = services(&pool);
    let now = Utc::now();

    let record = services
        .ingress
        .enqueue(r#"{"leadId":"L-q2","funnelId":"roofing","zipCode":"90210"}"#, now)
        .await
        .unwrap();

    // first worker takes the lease and dies without acknowledging
    let engine = LeaseEngine::new();
    let ClaimOutcome::Leased(leased) = engine.claim(record.clone(), "worker-dead", now).unwrap()
    else {
        panic!("expected lease");
    };
    assert!(services.queue.compare_and_swap(&leased, record.state_version).await.unwrap());

    let early = services.consumer.process_next_at("worker-live", now + Duration::seconds(30));
    assert_eq!(early.await.unwrap(), ProcessOutcome::Idle);

    let outcome = services
        .consumer
        .process_next_at("worker-live", now + Duration::seconds(61))
        .await
        .unwrap();
    let report = match outcome {
        ProcessOutcome::Completed { report, .. } => report,
        other => panic!("expected completion, got {other:?}"),
    };
    assert_eq!(report.assignment.rule_id, Some(RuleId("rule-roofing-west".to_string())));

    let stored = services.queue.find_by_id(&record.id).await.unwrap().expect("stored");
    assert_eq!(stored.state, LeadEventState::Completed);
    assert_eq!(stored.attempt_count, 2);
    pool.close().await;
}

struct UnavailableRules;

#[async_trait]
impl RuleRepository for UnavailableRules {
    async fn list_active(&self) -> Result<Vec<AssignmentRule>, RepositoryError> {
        Err(RepositoryError::Decode("rule store connection reset".to_string()))
    }

    async fn find_by_id(&self, _id: &RuleId) -> Result<Option<AssignmentRule>, RepositoryError> {
        Ok(None)
    }

    async fn save(&self, _rule: AssignmentRule) -> Result<(), RepositoryError> {
        Ok(())
    }

    async fn soft_delete(&self, _id: &RuleId, _at: DateTime<Utc>) -> Result<bool, RepositoryError> {
        Ok(false)
    }
}

#[tokio::test]
async fn transient_failures_back_off_then_dead_letter_at_max_attempts() {
    let pool = seeded_pool().await;
    let queue = Arc::new(SqlLeadEventQueueRepository::new(pool.clone()));
    let dispatcher = AssignmentDispatcher::new(
        Arc::new(UnavailableRules),
        Arc::new(SqlAssignmentRepository::new(pool.clone())),
        CapTracker::new(Arc::new(SqlCapCounterRepository::new(pool.clone()))),
        Arc::new(InMemoryOutcomePublisher::default()),
        Arc::new(InMemoryAuditSink::default()),
    );
    let engine = LeaseEngine::with_config(LeaseEngineConfig {
        max_attempts: 2,
        ..LeaseEngineConfig::default()
    });
    let consumer = LeadEventConsumer::new(queue.clone(), Arc::new(dispatcher), engine.clone());

    let now = Utc.with_ymd_and_hms(2026, 5, 5, 10, 0, 0).unwrap();
    let record = engine.enqueue(r#"{"leadId":"L-q3","funnelId":"solar"}"#, now);
    queue.insert(record.clone()).await.unwrap();

    let first = consumer.process_next_at("worker-1", now).await.unwrap();
    let (error_class, available_at) = match first {
        ProcessOutcome::Retrying { error_class, available_at, .. } => (error_class, available_at),
        other => panic!("expected retry, got {other:?}"),
    };
    assert_eq!(error_class, "matching_failed");
    assert_eq!(available_at, now + Duration::seconds(2));

    assert_eq!(consumer.process_next_at("worker-1", now).await.unwrap(), ProcessOutcome::Idle);

    let second = consumer.process_next_at("worker-1", available_at).await.unwrap();
    assert!(matches!(second, ProcessOutcome::DeadLettered { .. }));

    let stored = queue.find_by_id(&record.id).await.unwrap().expect("stored");
    assert_eq!(stored.state, LeadEventState::DeadLettered);
    assert_eq!(stored.attempt_count, 2);
    assert!(SqlAssignmentRepository::new(pool.clone())
        .find_by_lead(&LeadId("L-q3".to_string()))
        .await
        .unwrap()
        .is_none());
    pool.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worker_pool_drains_queue_until_cancelled() {
    let pool = seeded_pool().await;
    let services = services(&pool);
    let now = Utc::now();
    for index in 0..6 {
        let payload =
            format!(r#"{{"leadId":"L-pool-{index}","funnelId":"solar","zipCode":"94016"}}"#);
        services.ingress.enqueue(&payload, now).await.unwrap();
    }

    let cancel = CancellationToken::new();
    let workers = tokio::spawn(services.worker_pool().run(cancel.clone()));

    let mut completed = 0;
    for _ in 0..500 {
        completed = state_count(services.queue.as_ref(), LeadEventState::Completed).await;
        if completed == 6 {
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }

    cancel.cancel();
    workers.await.expect("workers stop");
    assert_eq!(completed, 6);
    pool.close().await;
}

