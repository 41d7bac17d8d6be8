use leadroute_core::domain::queue::{LeadEventRecord, LeadEventState};
use leadroute_db::repositories::{LeadEventQueueRepository, SqlLeadEventQueueRepository};

use crate::commands::{execute, CommandResult, EXIT_OPERATION};

pub fn run(limit: u32) -> CommandResult {
    execute("dead-letters", |_config, pool| async move {
        let queue = SqlLeadEventQueueRepository::new(pool);
        let records = queue
            .list_by_state(LeadEventState::DeadLettered, limit)
            .await
            .map_err(|error| ("dead_letters", error.to_string(), EXIT_OPERATION))?;

        Ok(render(&records))
    })
}

fn render(records: &[LeadEventRecord]) -> String {
    if records.is_empty() {
        return "no dead-lettered lead events".to_string();
    }

    let mut lines = vec![format!("{} dead-lettered lead events:", records.len())];
    for record in records {
        lines.push(format!(
            "  - {} lead={} attempts={}/{} error_class={} last_error={}",
            record.id.0,
            record.lead_id.as_ref().map(|id| id.0.as_str()).unwrap_or("unknown"),
            record.attempt_count,
            record.max_attempts,
            record.error_class.as_deref().unwrap_or("unknown"),
            record.last_error.as_deref().unwrap_or("-"),
        ));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use leadroute_core::domain::queue::LeadEventState;
    use leadroute_core::lease::LeaseEngine;

    use super::render;

    #[test]
    fn empty_listing_says_so() {
        assert_eq!(render(&[]), "no dead-lettered lead events");
    }

    #[test]
    fn listing_names_error_class_and_attempts() {
        let now = Utc.with_ymd_and_hms(2026, 2, 2, 9, 0, 0).unwrap();
        let mut record = LeaseEngine::new().enqueue(r#"{"funnelId":"solar"}"#, now);
        record.state = LeadEventState::DeadLettered;
        record.attempt_count = 1;
        record.error_class = Some("malformed_event".to_string());
        record.last_error = Some("leadId: is required".to_string());

        let rendered = render(&[record.clone()]);

        assert!(rendered.starts_with("1 dead-lettered lead events:"));
        assert!(rendered.contains(&record.id.0));
        assert!(rendered.contains("lead=unknown attempts=1/5 error_class=malformed_event"));
    }
}
