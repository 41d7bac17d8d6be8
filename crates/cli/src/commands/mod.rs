pub mod config;
pub mod dead_letters;
pub mod doctor;
pub mod drain;
pub mod enqueue;
pub mod migrate;
pub mod requeue;
pub mod seed;
pub mod sweep;

use std::future::Future;

use leadroute_core::config::{AppConfig, LoadOptions};
use leadroute_db::{connect_with_config, migrations, DbPool};
use serde::Serialize;

pub const EXIT_CONFIG: u8 = 2;
pub const EXIT_RUNTIME_INIT: u8 = 3;
pub const EXIT_DB_CONNECTIVITY: u8 = 4;
pub const EXIT_OPERATION: u8 = 5;

/// Error class, operator message, exit code.
pub(crate) type Failure = (&'static str, String, u8);

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
        };
        Self { exit_code: 0, output: serialize_payload(payload) }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
        };
        Self { exit_code, output: serialize_payload(payload) }
    }
}

/// Loads config, opens a migrated pool, and runs `operation` on a
/// current-thread runtime. Every database-backed command goes through here so
/// they share one exit-code contract.
pub(crate) fn execute<F, Fut>(command: &'static str, operation: F) -> CommandResult
where
    F: FnOnce(AppConfig, DbPool) -> Fut,
    Fut: Future<Output = Result<String, Failure>>,
{
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                command,
                "config_validation",
                format!("configuration issue: {error}"),
                EXIT_CONFIG,
            );
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                command,
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                EXIT_RUNTIME_INIT,
            );
        }
    };

    let result = runtime.block_on(async move {
        let pool = connect_with_config(&config.database)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), EXIT_DB_CONNECTIVITY))?;

        let outcome = match migrations::run_pending(&pool).await {
            Ok(()) => operation(config, pool.clone()).await,
            Err(error) => Err(("migration", error.to_string(), EXIT_OPERATION)),
        };
        pool.close().await;
        outcome
    });

    match result {
        Ok(message) => CommandResult::success(command, message),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure(command, error_class, message, exit_code)
        }
    }
}

/// Routing commands log to stderr so stdout stays a single JSON document.
pub(crate) fn init_logging(config: &AppConfig) {
    use leadroute_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(log_level)
        .with_writer(std::io::stderr);

    // A subscriber may already be installed when commands run in-process.
    let _ = match config.logging.format {
        Compact => builder.compact().try_init(),
        Pretty => builder.pretty().try_init(),
        Json => builder.json().try_init(),
    };
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}
