use std::sync::Arc;

use tracing::info;

use crate::metrics::{MetricsSnapshot, RelayMetrics};
use crate::scheduler::Scheduler;

/// Register the telemetry heartbeat, which logs relay counters on `cron_expr`
pub async fn register_heartbeat(
    scheduler: &mut Scheduler,
    cron_expr: &str,
    metrics: Arc<RelayMetrics>,
) -> anyhow::Result<()> {
    scheduler
        .add_cron_job(cron_expr, "heartbeat", move || {
            let metrics = metrics.clone();
            async move {
                let snapshot = metrics.snapshot();
                info!(
                    received = snapshot.received,
                    forwarded = snapshot.forwarded,
                    dropped = snapshot.dropped,
                    processing_errors = snapshot.processing_errors,
                    reconnects = snapshot.reconnects,
                    "Heartbeat: {}",
                    summary(&snapshot, metrics.uptime())
                );
            }
        })
        .await
}

fn summary(snapshot: &MetricsSnapshot, uptime: chrono::Duration) -> String {
    format!(
        "up {}h{:02}m, {} received, {} forwarded, {} dropped, {} errors",
        uptime.num_hours(),
        uptime.num_minutes() % 60,
        snapshot.received,
        snapshot.forwarded,
        snapshot.dropped,
        snapshot.processing_errors
    )
}
