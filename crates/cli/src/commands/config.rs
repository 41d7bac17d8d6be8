use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use leadroute_core::config::{AppConfig, LoadOptions};
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for (key_path, value) in effective_values(&config) {
        let env_key = env_key_for(key_path);
        lines.push(render_line(
            key_path,
            &value,
            field_source(
                key_path,
                Some(&env_key),
                config_file_doc.as_ref(),
                config_file_path.as_deref(),
            ),
        ));
    }

    lines.join("\n")
}

fn effective_values(config: &AppConfig) -> Vec<(&'static str, String)> {
    vec![
        ("database.url", config.database.url.clone()),
        ("database.max_connections", config.database.max_connections.to_string()),
        ("database.timeout_secs", config.database.timeout_secs.to_string()),
        ("routing.cap_retry_budget", config.routing.cap_retry_budget.to_string()),
        (
            "routing.unassigned_retention_days",
            config.routing.unassigned_retention_days.to_string(),
        ),
        ("routing.counter_grace_days", config.routing.counter_grace_days.to_string()),
        ("queue.lease_secs", config.queue.lease_secs.to_string()),
        ("queue.max_attempts", config.queue.max_attempts.to_string()),
        ("queue.retry_base_delay_secs", config.queue.retry_base_delay_secs.to_string()),
        ("queue.retry_backoff_multiplier", config.queue.retry_backoff_multiplier.to_string()),
        ("queue.poll_interval_ms", config.queue.poll_interval_ms.to_string()),
        ("queue.worker_count", config.queue.worker_count.to_string()),
        ("publisher.sink", config.publisher.sink.as_str().to_string()),
        ("server.bind_address", config.server.bind_address.clone()),
        ("server.health_check_port", config.server.health_check_port.to_string()),
        ("server.graceful_shutdown_secs", config.server.graceful_shutdown_secs.to_string()),
        ("server.sweep_interval_secs", config.server.sweep_interval_secs.to_string()),
        ("logging.level", config.logging.level.clone()),
        ("logging.format", config.logging.format.as_str().to_string()),
    ]
}

/// `queue.worker_count` -> `LEADROUTE_QUEUE_WORKER_COUNT`
fn env_key_for(key_path: &str) -> String {
    format!("LEADROUTE_{}", key_path.replace('.', "_").to_ascii_uppercase())
}

fn detect_config_path() -> Option<PathBuf> {
    let root = PathBuf::from("leadroute.toml");
    if root.exists() {
        return Some(root);
    }

    let nested = PathBuf::from("config/leadroute.toml");
    if nested.exists() {
        return Some(nested);
    }

    None
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: Option<&str>,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_key {
        if env::var_os(env_key).is_some() {
            return format!("env ({env_key})");
        }
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use toml::Value;

    use super::{contains_path, env_key_for, field_source};

    #[test]
    fn env_keys_follow_section_and_field() {
        assert_eq!(env_key_for("routing.cap_retry_budget"), "LEADROUTE_ROUTING_CAP_RETRY_BUDGET");
        assert_eq!(env_key_for("logging.format"), "LEADROUTE_LOGGING_FORMAT");
    }

    #[test]
    fn file_attribution_requires_the_full_key_path() {
        let doc: Value = "[queue]\nworker_count = 8\n".parse().expect("toml");

        assert!(contains_path(&doc, "queue.worker_count"));
        assert!(!contains_path(&doc, "queue.lease_secs"));
        assert_eq!(
            field_source(
                "queue.worker_count",
                Some("LEADROUTE_TEST_UNSET_WORKER_COUNT"),
                Some(&doc),
                Some(Path::new("leadroute.toml")),
            ),
            "file (leadroute.toml)"
        );
        assert_eq!(
            field_source("queue.lease_secs", None, Some(&doc), Some(Path::new("leadroute.toml"))),
            "default"
        );
    }
}
