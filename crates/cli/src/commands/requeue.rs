use std::sync::Arc;

use chrono::Utc;
use leadroute_core::domain::queue::LeadEventId;
use leadroute_core::lease::LeaseEngine;
use leadroute_db::repositories::SqlLeadEventQueueRepository;
use leadroute_router::{LeadEventIngress, RequeueError};

use crate::commands::{execute, CommandResult, EXIT_OPERATION};

pub fn run(event_id: &str) -> CommandResult {
    let event_id = LeadEventId(event_id.trim().to_string());
    execute("requeue", |config, pool| async move {
        let ingress = LeadEventIngress::new(
            Arc::new(SqlLeadEventQueueRepository::new(pool)),
            LeaseEngine::with_config(config.queue.lease_engine_config()),
        );

        match ingress.requeue(&event_id, Utc::now()).await {
            Ok(record) => Ok(format!(
                "requeued lead event {} with a fresh budget of {} attempts",
                record.id.0, record.max_attempts
            )),
            Err(error @ RequeueError::NotFound(_)) => {
                Err(("not_found", error.to_string(), EXIT_OPERATION))
            }
            Err(error @ RequeueError::Lease(_)) => {
                Err(("invalid_state", error.to_string(), EXIT_OPERATION))
            }
            Err(error) => Err(("requeue", error.to_string(), EXIT_OPERATION)),
        }
    })
}
