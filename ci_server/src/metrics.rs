//! Prometheus metrics. Names carry the `birthnon_ci_` prefix.

use metrics::{counter, gauge, histogram};

/// Start the Prometheus scrape endpoint (`:9000/metrics`).
pub fn init_metrics() {
    match metrics_exporter_prometheus::PrometheusBuilder::new().install() {
        Ok(()) => tracing::info!("Prometheus exporter listening on :9000"),
        Err(e) => tracing::warn!("Prometheus exporter not installed: {e}"),
    }
}

pub fn webhook_received(event_type: &str) {
    counter!("birthnon_ci_webhooks_total", "event" => event_type.to_string()).increment(1);
}

pub fn build_status_changed(status: &str) {
    counter!("birthnon_ci_build_transitions_total", "status" => status.to_string()).increment(1);
}

/// Wall time of a finished build, labelled with its final status.
pub fn build_duration(status: &str, duration_ms: u64) {
    histogram!("birthnon_ci_build_duration_ms", "status" => status.to_string())
        .record(duration_ms as f64);
}

pub fn step_duration(job: &str, step: &str, duration_ms: u64) {
    histogram!(
        "birthnon_ci_step_duration_ms",
        "job" => job.to_string(),
        "step" => step.to_string()
    )
    .record(duration_ms as f64);
}

pub fn queue_depth(count: usize) {
    gauge!("birthnon_ci_queue_depth").set(count as f64);
}

/// `hit`, `partial` (restore-key match) or `miss`.
pub fn cache_lookup(outcome: &str) {
    counter!("birthnon_ci_cache_lookups_total", "outcome" => outcome.to_string()).increment(1);
}

pub fn error_recorded(category: &str) {
    counter!("birthnon_ci_errors_total", "category" => category.to_string()).increment(1);
}
