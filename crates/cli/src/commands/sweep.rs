use std::sync::Arc;

use chrono::Utc;
use leadroute_core::audit::TracingAuditSink;
use leadroute_router::RoutingServices;

use crate::commands::{execute, CommandResult, EXIT_OPERATION};

/// One retention pass, the same one the server runs on its sweep interval.
pub fn run() -> CommandResult {
    execute("sweep", |config, pool| async move {
        let services = RoutingServices::sqlite(pool, &config, Arc::new(TracingAuditSink));
        let report = services
            .sweeper()
            .sweep(Utc::now())
            .await
            .map_err(|error| ("sweep", error.to_string(), EXIT_OPERATION))?;

        Ok(format!(
            "purged {} cap counters and {} unassigned entries",
            report.counters_purged, report.unassigned_purged
        ))
    })
}
