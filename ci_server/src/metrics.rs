//! Prometheus metrics for signaler observability.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder; the handle renders `/metrics`.
pub fn init_metrics() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!("Failed to install Prometheus recorder: {}", e);
            None
        }
    }
}

/// Record a webhook received event.
pub fn webhook_received(vcs: &str, event_type: &str) {
    counter!(
        "ci_webhooks_received_total",
        "vcs" => vcs.to_string(),
        "event" => event_type.to_string()
    )
    .increment(1);
}

/// Record how a trigger ended: `queued`, `no_build_file`, `not_built`, `error`.
pub fn trigger_outcome(signaled_by: &str, outcome: &str) {
    counter!(
        "ci_triggers_total",
        "signaled_by" => signaled_by.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a worker-reported build result.
pub fn build_finished(status: &str) {
    counter!("ci_builds_finished_total", "status" => status.to_string()).increment(1);
}

/// Record time from trigger receipt to dispatch.
pub fn dispatch_duration(duration_ms: u64) {
    histogram!("ci_dispatch_duration_ms").record(duration_ms as f64);
}
