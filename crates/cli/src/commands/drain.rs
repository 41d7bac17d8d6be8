use std::sync::Arc;

use leadroute_core::audit::TracingAuditSink;
use leadroute_router::RoutingServices;

use crate::commands::{execute, init_logging, CommandResult, EXIT_OPERATION};

pub fn run() -> CommandResult {
    execute("drain", |config, pool| async move {
        init_logging(&config);

        let services = RoutingServices::sqlite(pool, &config, Arc::new(TracingAuditSink));
        let worker_id = format!("cli-{}", std::process::id());
        let summary = services
            .consumer
            .drain(&worker_id)
            .await
            .map_err(|error| ("drain", error.to_string(), EXIT_OPERATION))?;

        Ok(format!(
            "drained queue: {} completed, {} retrying, {} dead-lettered",
            summary.completed, summary.retrying, summary.dead_lettered
        ))
    })
}
