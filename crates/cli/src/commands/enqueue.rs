use std::sync::Arc;

use chrono::Utc;
use leadroute_core::lease::LeaseEngine;
use leadroute_db::repositories::SqlLeadEventQueueRepository;
use leadroute_router::LeadEventIngress;

use crate::commands::{execute, CommandResult, EXIT_OPERATION};

/// Stores the payload verbatim; malformed events surface later as dead letters.
pub fn run(payload_json: &str) -> CommandResult {
    let payload_json = payload_json.to_string();
    execute("enqueue", |config, pool| async move {
        let ingress = LeadEventIngress::new(
            Arc::new(SqlLeadEventQueueRepository::new(pool)),
            LeaseEngine::with_config(config.queue.lease_engine_config()),
        );

        let record = ingress
            .enqueue(&payload_json, Utc::now())
            .await
            .map_err(|error| ("enqueue", error.to_string(), EXIT_OPERATION))?;

        let lead = record.lead_id.as_ref().map(|id| id.0.as_str()).unwrap_or("unknown");
        Ok(format!("enqueued lead event {} (lead {lead})", record.id.0))
    })
}
