use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Register descriptions for the render job metrics.
pub fn describe_metrics() {
    metrics::describe_counter!("render_jobs_submitted_total", "Total render jobs submitted");
    metrics::describe_counter!("render_jobs_completed_total", "Total render jobs completed");
    metrics::describe_counter!("render_jobs_failed_total", "Total render jobs that failed");
    metrics::describe_counter!(
        "render_jobs_orphans_removed_total",
        "Completed jobs discarded because their output file was gone"
    );
    metrics::describe_histogram!(
        "render_job_duration_seconds",
        "Wall time of the external render command"
    );
    metrics::describe_gauge!(
        "render_queue_depth",
        "Current number of render tasks waiting for a worker"
    );
}

/// Prometheus metrics scrape endpoint.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}
