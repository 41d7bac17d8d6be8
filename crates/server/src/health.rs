use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use leadroute_db::repositories::LeadEventQueueRepository;
use leadroute_db::{ping, DbPool};

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
    queue: Arc<dyn LeadEventQueueRepository>,
}

impl HealthState {
    pub fn new(db_pool: DbPool, queue: Arc<dyn LeadEventQueueRepository>) -> Self {
        Self { db_pool, queue }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QueueBacklog {
    pub status: &'static str,
    pub counts: BTreeMap<String, u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub database: HealthCheck,
    pub queue: QueueBacklog,
    pub checked_at: String,
}

pub fn router(state: HealthState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

pub async fn spawn(
    bind_address: &str,
    port: u16,
    state: HealthState,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let address = format!("{bind_address}:{port}");
    let listener = tokio::net::TcpListener::bind(&address).await?;

    info!(
        event_name = "system.health.start",
        correlation_id = "bootstrap",
        bind_address = %address,
        "health endpoint started"
    );

    tokio::spawn(async move {
        let served = axum::serve(listener, router(state))
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await;
        if let Err(error) = served {
            error!(
                event_name = "system.health.error",
                correlation_id = "bootstrap",
                error = %error,
                "health endpoint server terminated unexpectedly"
            );
        }
    });

    Ok(())
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let ready = database.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: "leadroute-server runtime initialized".to_string(),
        },
        database,
        queue: queue_backlog(state.queue.as_ref()).await,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match ping(pool).await {
        Ok(()) => HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}

async fn queue_backlog(queue: &dyn LeadEventQueueRepository) -> QueueBacklog {
    match queue.count_by_state().await {
        Ok(counts) => QueueBacklog {
            status: "ready",
            counts: counts
                .into_iter()
                .map(|(state, count)| (state.as_str().to_string(), count))
                .collect(),
        },
        Err(_) => QueueBacklog { status: "unknown", counts: BTreeMap::new() },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        extract::State,
        http::{Request, StatusCode},
        Json,
    };
    use chrono::Utc;
    use tower::ServiceExt;

    use leadroute_core::lease::LeaseEngine;
    use leadroute_db::repositories::{LeadEventQueueRepository, SqlLeadEventQueueRepository};
    use leadroute_db::{connect_with_settings, migrations, DbPool};

    use crate::health::{health, router, HealthState};

    async fn migrated_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    fn state(pool: &DbPool) -> HealthState {
        HealthState::new(pool.clone(), Arc::new(SqlLeadEventQueueRepository::new(pool.clone())))
    }

    #[tokio::test]
    async fn health_returns_ready_with_queue_backlog() {
        let pool = migrated_pool().await;
        let queue = SqlLeadEventQueueRepository::new(pool.clone());
        queue.insert(LeaseEngine::new().enqueue("{}", Utc::now())).await.expect("enqueue");

        let (status, Json(payload)) = health(State(state(&pool))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.status, "ready");
        assert_eq!(payload.database.status, "ready");
        assert_eq!(payload.queue.counts.get("queued"), Some(&1));
        assert_eq!(payload.queue.counts.get("dead_lettered"), Some(&0));

        pool.close().await;
    }

    #[tokio::test]
    async fn health_returns_service_unavailable_when_database_is_unavailable() {
        let pool = migrated_pool().await;
        let state = state(&pool);
        pool.close().await;

        let (status, Json(payload)) = health(State(state)).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(payload.status, "degraded");
        assert_eq!(payload.database.status, "degraded");
        assert_eq!(payload.service.status, "ready");
        assert_eq!(payload.queue.status, "unknown");
    }

    #[tokio::test]
    async fn health_route_serves_json() {
        let pool = migrated_pool().await;

        let response = router(state(&pool))
            .oneshot(Request::builder().uri("/health").body(Body::empty()).expect("request"))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), 64 * 1024).await.expect("body");
        let json: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(json["database"]["status"], "ready");
        assert!(json["queue"]["counts"].is_object());

        pool.close().await;
    }
}
