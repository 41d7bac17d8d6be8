use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lease::LeaseEngineConfig;

const MAX_LEASE_SECS: u64 = 86_400;
const MAX_ATTEMPTS: u32 = 100;
const MAX_RETRY_BASE_DELAY_SECS: u64 = 3_600;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub routing: RoutingConfig,
    pub queue: QueueConfig,
    pub publisher: PublisherConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct RoutingConfig {
    /// Conditional-write attempts per reservation before reporting contention.
    pub cap_retry_budget: u32,
    pub unassigned_retention_days: u32,
    pub counter_grace_days: u32,
}

#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub lease_secs: u64,
    pub max_attempts: u32,
    pub retry_base_delay_secs: u64,
    pub retry_backoff_multiplier: u32,
    pub poll_interval_ms: u64,
    pub worker_count: usize,
}

#[derive(Clone, Debug)]
pub struct PublisherConfig {
    pub sink: PublisherSink,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub health_check_port: u16,
    pub graceful_shutdown_secs: u64,
    pub sweep_interval_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublisherSink {
    Outbox,
    Log,
}

impl PublisherSink {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Outbox => "outbox",
            Self::Log => "log",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compact => "compact",
            Self::Pretty => "pretty",
            Self::Json => "json",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub worker_count: Option<usize>,
    pub publisher_sink: Option<PublisherSink>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://leadroute.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            routing: RoutingConfig {
                cap_retry_budget: 16,
                unassigned_retention_days: 30,
                counter_grace_days: 7,
            },
            queue: QueueConfig {
                lease_secs: 60,
                max_attempts: 5,
                retry_base_delay_secs: 2,
                retry_backoff_multiplier: 2,
                poll_interval_ms: 500,
                worker_count: 4,
            },
            publisher: PublisherConfig { sink: PublisherSink::Outbox },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                health_check_port: 8080,
                graceful_shutdown_secs: 15,
                sweep_interval_secs: 300,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl std::str::FromStr for PublisherSink {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "outbox" => Ok(Self::Outbox),
            "log" => Ok(Self::Log),
            other => Err(ConfigError::Validation(format!(
                "unsupported publisher sink `{other}` (expected outbox|log)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl QueueConfig {
    pub fn lease_engine_config(&self) -> LeaseEngineConfig {
        LeaseEngineConfig {
            lease_seconds: i64::try_from(self.lease_secs).unwrap_or(i64::MAX),
            max_attempts: self.max_attempts,
            retry_base_delay_seconds: i64::try_from(self.retry_base_delay_secs)
                .unwrap_or(i64::MAX),
            retry_backoff_multiplier: self.retry_backoff_multiplier,
            ..LeaseEngineConfig::default()
        }
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::try_seconds(i64::try_from(self.lease_secs).unwrap_or(i64::MAX))
            .unwrap_or(Duration::MAX)
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("leadroute.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(routing) = patch.routing {
            if let Some(cap_retry_budget) = routing.cap_retry_budget {
                self.routing.cap_retry_budget = cap_retry_budget;
            }
            if let Some(days) = routing.unassigned_retention_days {
                self.routing.unassigned_retention_days = days;
            }
            if let Some(days) = routing.counter_grace_days {
                self.routing.counter_grace_days = days;
            }
        }

        if let Some(queue) = patch.queue {
            if let Some(lease_secs) = queue.lease_secs {
                self.queue.lease_secs = lease_secs;
            }
            if let Some(max_attempts) = queue.max_attempts {
                self.queue.max_attempts = max_attempts;
            }
            if let Some(delay) = queue.retry_base_delay_secs {
                self.queue.retry_base_delay_secs = delay;
            }
            if let Some(multiplier) = queue.retry_backoff_multiplier {
                self.queue.retry_backoff_multiplier = multiplier;
            }
            if let Some(poll_interval_ms) = queue.poll_interval_ms {
                self.queue.poll_interval_ms = poll_interval_ms;
            }
            if let Some(worker_count) = queue.worker_count {
                self.queue.worker_count = worker_count;
            }
        }

        if let Some(publisher) = patch.publisher {
            if let Some(sink) = publisher.sink {
                self.publisher.sink = sink;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(health_check_port) = server.health_check_port {
                self.server.health_check_port = health_check_port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
            if let Some(sweep_interval_secs) = server.sweep_interval_secs {
                self.server.sweep_interval_secs = sweep_interval_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("LEADROUTE_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("LEADROUTE_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("LEADROUTE_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("LEADROUTE_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("LEADROUTE_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("LEADROUTE_ROUTING_CAP_RETRY_BUDGET") {
            self.routing.cap_retry_budget =
                parse_u32("LEADROUTE_ROUTING_CAP_RETRY_BUDGET", &value)?;
        }
        if let Some(value) = read_env("LEADROUTE_ROUTING_UNASSIGNED_RETENTION_DAYS") {
            self.routing.unassigned_retention_days =
                parse_u32("LEADROUTE_ROUTING_UNASSIGNED_RETENTION_DAYS", &value)?;
        }
        if let Some(value) = read_env("LEADROUTE_ROUTING_COUNTER_GRACE_DAYS") {
            self.routing.counter_grace_days =
                parse_u32("LEADROUTE_ROUTING_COUNTER_GRACE_DAYS", &value)?;
        }

        if let Some(value) = read_env("LEADROUTE_QUEUE_LEASE_SECS") {
            self.queue.lease_secs = parse_u64("LEADROUTE_QUEUE_LEASE_SECS", &value)?;
        }
        if let Some(value) = read_env("LEADROUTE_QUEUE_MAX_ATTEMPTS") {
            self.queue.max_attempts = parse_u32("LEADROUTE_QUEUE_MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("LEADROUTE_QUEUE_RETRY_BASE_DELAY_SECS") {
            self.queue.retry_base_delay_secs =
                parse_u64("LEADROUTE_QUEUE_RETRY_BASE_DELAY_SECS", &value)?;
        }
        if let Some(value) = read_env("LEADROUTE_QUEUE_RETRY_BACKOFF_MULTIPLIER") {
            self.queue.retry_backoff_multiplier =
                parse_u32("LEADROUTE_QUEUE_RETRY_BACKOFF_MULTIPLIER", &value)?;
        }
        if let Some(value) = read_env("LEADROUTE_QUEUE_POLL_INTERVAL_MS") {
            self.queue.poll_interval_ms = parse_u64("LEADROUTE_QUEUE_POLL_INTERVAL_MS", &value)?;
        }
        if let Some(value) = read_env("LEADROUTE_QUEUE_WORKER_COUNT") {
            self.queue.worker_count = parse_usize("LEADROUTE_QUEUE_WORKER_COUNT", &value)?;
        }

        if let Some(value) = read_env("LEADROUTE_PUBLISHER_SINK") {
            self.publisher.sink = value.parse()?;
        }

        if let Some(value) = read_env("LEADROUTE_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("LEADROUTE_SERVER_HEALTH_CHECK_PORT") {
            self.server.health_check_port =
                parse_u16("LEADROUTE_SERVER_HEALTH_CHECK_PORT", &value)?;
        }
        if let Some(value) = read_env("LEADROUTE_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("LEADROUTE_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }
        if let Some(value) = read_env("LEADROUTE_SERVER_SWEEP_INTERVAL_SECS") {
            self.server.sweep_interval_secs =
                parse_u64("LEADROUTE_SERVER_SWEEP_INTERVAL_SECS", &value)?;
        }

        let log_level =
            read_env("LEADROUTE_LOGGING_LEVEL").or_else(|| read_env("LEADROUTE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("LEADROUTE_LOGGING_FORMAT").or_else(|| read_env("LEADROUTE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(worker_count) = overrides.worker_count {
            self.queue.worker_count = worker_count;
        }
        if let Some(sink) = overrides.publisher_sink {
            self.publisher.sink = sink;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_routing(&self.routing)?;
        validate_queue(&self.queue)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("leadroute.toml"), PathBuf::from("config/leadroute.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_routing(routing: &RoutingConfig) -> Result<(), ConfigError> {
    if routing.cap_retry_budget == 0 || routing.cap_retry_budget > 1000 {
        return Err(ConfigError::Validation(
            "routing.cap_retry_budget must be in range 1..=1000".to_string(),
        ));
    }

    if routing.unassigned_retention_days == 0 {
        return Err(ConfigError::Validation(
            "routing.unassigned_retention_days must be at least 1".to_string(),
        ));
    }

    Ok(())
}

fn validate_queue(queue: &QueueConfig) -> Result<(), ConfigError> {
    if queue.lease_secs == 0 || queue.lease_secs > MAX_LEASE_SECS {
        return Err(ConfigError::Validation(format!(
            "queue.lease_secs must be in range 1..={MAX_LEASE_SECS}"
        )));
    }

    if queue.max_attempts == 0 || queue.max_attempts > MAX_ATTEMPTS {
        return Err(ConfigError::Validation(format!(
            "queue.max_attempts must be in range 1..={MAX_ATTEMPTS}"
        )));
    }

    if queue.retry_base_delay_secs > MAX_RETRY_BASE_DELAY_SECS {
        return Err(ConfigError::Validation(format!(
            "queue.retry_base_delay_secs must be at most {MAX_RETRY_BASE_DELAY_SECS}"
        )));
    }

    if queue.retry_backoff_multiplier == 0 {
        return Err(ConfigError::Validation(
            "queue.retry_backoff_multiplier must be greater than zero".to_string(),
        ));
    }

    if queue.poll_interval_ms == 0 {
        return Err(ConfigError::Validation(
            "queue.poll_interval_ms must be greater than zero".to_string(),
        ));
    }

    if queue.worker_count == 0 || queue.worker_count > 64 {
        return Err(ConfigError::Validation(
            "queue.worker_count must be in range 1..=64".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.health_check_port == 0 {
        return Err(ConfigError::Validation(
            "server.health_check_port must be greater than zero".to_string(),
        ));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    if server.sweep_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "server.sweep_interval_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    routing: Option<RoutingPatch>,
    queue: Option<QueuePatch>,
    publisher: Option<PublisherPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RoutingPatch {
    cap_retry_budget: Option<u32>,
    unassigned_retention_days: Option<u32>,
    counter_grace_days: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct QueuePatch {
    lease_secs: Option<u64>,
    max_attempts: Option<u32>,
    retry_base_delay_secs: Option<u64>,
    retry_backoff_multiplier: Option<u32>,
    poll_interval_ms: Option<u64>,
    worker_count: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct PublisherPatch {
    sink: Option<PublisherSink>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    health_check_port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
    sweep_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
