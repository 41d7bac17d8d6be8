use leadroute_core::config::{AppConfig, LoadOptions};
use leadroute_core::domain::queue::LeadEventState;
use leadroute_db::repositories::{LeadEventQueueRepository, SqlLeadEventQueueRepository};
use leadroute_db::{connect_with_config, ping};
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> String {
    let report = build_report();

    if json_output {
        return serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
    }

    render_human(&report)
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: format!(
                    "configuration loaded and validated (publisher sink `{}`, {} workers)",
                    config.publisher.sink.as_str(),
                    config.queue.worker_count
                ),
            });
            checks.extend(check_database(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            for name in ["database_connectivity", "queue_backlog"] {
                checks.push(DoctorCheck {
                    name,
                    status: CheckStatus::Skipped,
                    details: "skipped because configuration did not load".to_string(),
                });
            }
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

/// Connectivity, then queue backlog. The backlog check doubles as a schema
/// probe: it fails until `leadroute migrate` has run.
fn check_database(config: &AppConfig) -> Vec<DoctorCheck> {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return vec![DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Fail,
                details: format!("failed to initialize async runtime: {error}"),
            }];
        }
    };

    runtime.block_on(async {
        let pool = match connect_with_config(&config.database).await {
            Ok(pool) => pool,
            Err(error) => {
                return vec![
                    DoctorCheck {
                        name: "database_connectivity",
                        status: CheckStatus::Fail,
                        details: format!("failed to connect to database: {error}"),
                    },
                    DoctorCheck {
                        name: "queue_backlog",
                        status: CheckStatus::Skipped,
                        details: "skipped because the database is unreachable".to_string(),
                    },
                ];
            }
        };

        let connectivity = match ping(&pool).await {
            Ok(()) => DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Pass,
                details: format!("connected using `{}`", config.database.url),
            },
            Err(error) => DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Fail,
                details: format!("database query failed: {error}"),
            },
        };

        let backlog = match SqlLeadEventQueueRepository::new(pool.clone()).count_by_state().await {
            Ok(counts) => DoctorCheck {
                name: "queue_backlog",
                status: CheckStatus::Pass,
                details: describe_backlog(&counts),
            },
            Err(error) => DoctorCheck {
                name: "queue_backlog",
                status: CheckStatus::Fail,
                details: format!("queue table unreadable (run `leadroute migrate`): {error}"),
            },
        };

        pool.close().await;
        vec![connectivity, backlog]
    })
}

fn describe_backlog(counts: &[(LeadEventState, u64)]) -> String {
    counts
        .iter()
        .map(|(state, count)| format!("{}={count}", state.as_str()))
        .collect::<Vec<_>>()
        .join(" ")
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use leadroute_core::domain::queue::LeadEventState;

    use super::{describe_backlog, render_human, CheckStatus, DoctorCheck, DoctorReport};

    #[test]
    fn backlog_lists_every_state() {
        let counts = vec![(LeadEventState::Queued, 3), (LeadEventState::DeadLettered, 1)];
        assert_eq!(describe_backlog(&counts), "queued=3 dead_lettered=1");
    }

    #[test]
    fn human_output_marks_skipped_checks() {
        let report = DoctorReport {
            overall_status: CheckStatus::Fail,
            summary: "doctor: one or more readiness checks failed".to_string(),
            checks: vec![
                DoctorCheck {
                    name: "config_validation",
                    status: CheckStatus::Fail,
                    details: "bad url".to_string(),
                },
                DoctorCheck {
                    name: "queue_backlog",
                    status: CheckStatus::Skipped,
                    details: "skipped".to_string(),
                },
            ],
        };

        let rendered = render_human(&report);
        assert!(rendered.contains("- [fail] config_validation: bad url"));
        assert!(rendered.contains("- [skip] queue_backlog: skipped"));
    }
}
