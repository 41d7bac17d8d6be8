mod bootstrap;
mod health;

use std::time::Duration;

use anyhow::Result;
use leadroute_core::config::{AppConfig, LoadOptions};
use tokio_util::sync::CancellationToken;

fn init_logging(config: &AppConfig) {
    use leadroute_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Config first so logging honours the configured level and format.
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;
    let cancel = CancellationToken::new();

    health::spawn(
        &app.config.server.bind_address,
        app.config.server.health_check_port,
        health::HealthState::new(app.db_pool.clone(), app.services.queue.clone()),
        cancel.clone(),
    )
    .await?;

    let workers = tokio::spawn(app.services.worker_pool().run(cancel.clone()));
    let sweeper = tokio::spawn(
        app.services
            .sweeper()
            .run(Duration::from_secs(app.config.server.sweep_interval_secs), cancel.clone()),
    );

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        worker_count = app.config.queue.worker_count,
        publisher_sink = app.config.publisher.sink.as_str(),
        "leadroute-server started"
    );
    wait_for_shutdown().await?;
    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        grace_secs = app.config.server.graceful_shutdown_secs,
        "leadroute-server stopping"
    );

    cancel.cancel();
    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    let drained = tokio::time::timeout(grace, async {
        let _ = workers.await;
        let _ = sweeper.await;
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            event_name = "system.server.shutdown_timeout",
            correlation_id = "shutdown",
            "workers did not stop within the grace period; open leases will be redelivered"
        );
    }

    app.db_pool.close().await;
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
