use std::sync::Arc;

use leadroute_core::audit::TracingAuditSink;
use leadroute_core::config::{AppConfig, ConfigError, LoadOptions};
use leadroute_db::{connect_with_config, migrations, DbPool};
use leadroute_router::RoutingServices;
use thiserror::Error;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub services: RoutingServices,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    let db_pool =
        connect_with_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        max_connections = config.database.max_connections,
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let services = RoutingServices::sqlite(db_pool.clone(), &config, Arc::new(TracingAuditSink));
    info!(
        event_name = "system.bootstrap.routing_ready",
        correlation_id = "bootstrap",
        publisher_sink = config.publisher.sink.as_str(),
        worker_count = config.queue.worker_count,
        cap_retry_budget = config.routing.cap_retry_budget,
        "routing services assembled"
    );

    Ok(Application { config, db_pool, services })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tempfile::TempDir;

    use leadroute_core::config::{ConfigOverrides, LoadOptions};
    use leadroute_db::repositories::{RuleRepository, SqlRuleRepository};
    use leadroute_db::DemoRuleSet;

    use crate::bootstrap::bootstrap;

    fn options(database_url: &str) -> LoadOptions {
        LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some(database_url.to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_fails_fast_on_non_sqlite_database_url() {
        let result = bootstrap(options("postgres://localhost/leadroute")).await;

        let message = result.err().expect("error").to_string();
        assert!(message.contains("database.url"));
    }

    #[tokio::test]
    async fn bootstrap_migrates_and_routes_enqueued_lead() {
        let dir = TempDir::new().expect("tempdir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("bootstrap.db").display());
        let app = bootstrap(options(&url)).await.expect("bootstrap should succeed");

        let rules = SqlRuleRepository::new(app.db_pool.clone());
        DemoRuleSet::load(&rules, Utc::now()).await.expect("seed");
        assert_eq!(rules.list_active().await.expect("rules").len(), 5);

        app.services
            .ingress
            .enqueue(r#"{"leadId":"L-boot","funnelId":"roofing","zipCode":"90001"}"#, Utc::now())
            .await
            .expect("enqueue");
        let summary = app.services.consumer.drain("bootstrap-test").await.expect("drain");
        assert_eq!(summary.completed, 1);

        app.db_pool.close().await;
    }
}
