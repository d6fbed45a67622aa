use anyhow::{Context, Result};
use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Metric name prefix for all boardkeeper metrics
const PREFIX: &str = "boardkeeper";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Background Job Metrics
    pub static ref BACKGROUND_JOB_EXECUTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            format!("{PREFIX}_background_job_executions_total"),
            "Total background job executions by job and final status"
        ),
        &["job_id", "status"]
    ).expect("Failed to create background_job_executions_total metric");

    pub static ref BACKGROUND_JOB_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_background_job_duration_seconds"),
            "Background job execution time in seconds"
        )
        .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0]),
        &["job_id"]
    ).expect("Failed to create background_job_duration_seconds metric");

    pub static ref BACKGROUND_JOB_RUNNING: GaugeVec = GaugeVec::new(
        Opts::new(
            format!("{PREFIX}_background_job_running"),
            "Whether a background job is currently running (1) or idle (0)"
        ),
        &["job_id"]
    ).expect("Failed to create background_job_running metric");

    // Maintenance Metrics
    pub static ref POSTS_SCANNED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            format!("{PREFIX}_posts_scanned_total"),
            "Posts classified by the expiry scanner"
        ),
        &["outcome"]
    ).expect("Failed to create posts_scanned_total metric");

    pub static ref RECORDS_DELETED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            format!("{PREFIX}_records_deleted_total"),
            "Canonical records deleted by maintenance"
        ),
        &["kind"]
    ).expect("Failed to create records_deleted_total metric");

    pub static ref CASCADE_FAILURES_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_cascade_failures_total"),
        "Failed steps while cascading a post deletion"
    ).expect("Failed to create cascade_failures_total metric");

    pub static ref RECONCILED_APPLICATIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            format!("{PREFIX}_reconciled_applications_total"),
            "Applications processed by the index reconciler, by outcome"
        ),
        &["outcome"]
    ).expect("Failed to create reconciled_applications_total metric");

    pub static ref INDEX_ENTRIES_WRITTEN_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_index_entries_written_total"),
        "Index entries written by the reconciler"
    ).expect("Failed to create index_entries_written_total metric");
}

/// Initialize all metrics and register them with the Prometheus registry
pub fn init_metrics() {
    // Ignore errors if already registered (tests call this repeatedly)
    let _ = REGISTRY.register(Box::new(BACKGROUND_JOB_EXECUTIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(BACKGROUND_JOB_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(BACKGROUND_JOB_RUNNING.clone()));
    let _ = REGISTRY.register(Box::new(POSTS_SCANNED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(RECORDS_DELETED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(CASCADE_FAILURES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(RECONCILED_APPLICATIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(INDEX_ENTRIES_WRITTEN_TOTAL.clone()));

    tracing::info!("Metrics system initialized successfully");
}

/// Record a finished background job run
pub fn record_background_job_execution(job_id: &str, status: &str, duration: Duration) {
    BACKGROUND_JOB_EXECUTIONS_TOTAL
        .with_label_values(&[job_id, status])
        .inc();
    BACKGROUND_JOB_DURATION_SECONDS
        .with_label_values(&[job_id])
        .observe(duration.as_secs_f64());
}

pub fn set_background_job_running(job_id: &str, running: bool) {
    BACKGROUND_JOB_RUNNING
        .with_label_values(&[job_id])
        .set(if running { 1.0 } else { 0.0 });
}

/// Record one post classification (`live`, `expired` or `unclassifiable`)
pub fn record_post_scanned(outcome: &str) {
    POSTS_SCANNED_TOTAL.with_label_values(&[outcome]).inc();
}

/// Record deleted records of one kind (`post` or `application`)
pub fn record_records_deleted(kind: &str, count: usize) {
    if count > 0 {
        RECORDS_DELETED_TOTAL
            .with_label_values(&[kind])
            .inc_by(count as f64);
    }
}

pub fn record_cascade_failure() {
    CASCADE_FAILURES_TOTAL.inc();
}

pub fn record_reconciled_application(outcome: &str) {
    RECONCILED_APPLICATIONS_TOTAL
        .with_label_values(&[outcome])
        .inc();
}

pub fn record_index_entries_written(count: usize) {
    INDEX_ENTRIES_WRITTEN_TOTAL.inc_by(count as f64);
}

/// Handler for /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_else(|_| String::from(""));
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

pub fn metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

/// Serve `/metrics` until `shutdown` is cancelled.
pub async fn run_metrics_server(port: u16, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .with_context(|| format!("Failed to bind metrics port {}", port))?;
    info!("Metrics available at port {}", port);

    axum::serve(listener, metrics_router())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Metrics server failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    #[test]
    fn job_metrics_are_labelled_by_job() {
        init_metrics();
        record_background_job_execution("metrics_test_job", "completed", Duration::from_millis(5));
        set_background_job_running("metrics_test_job", true);

        assert_eq!(
            BACKGROUND_JOB_EXECUTIONS_TOTAL
                .with_label_values(&["metrics_test_job", "completed"])
                .get(),
            1.0
        );
        assert_eq!(
            BACKGROUND_JOB_RUNNING
                .with_label_values(&["metrics_test_job"])
                .get(),
            1.0
        );
    }

    #[tokio::test]
    async fn metrics_endpoint_exposes_registry() {
        init_metrics();
        record_cascade_failure();

        let response = metrics_router()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("boardkeeper_cascade_failures_total"));
    }
}
