use axum::{http::StatusCode, response::IntoResponse};
use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, IntCounter, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

/// Metric name prefix for all orchestrator metrics
const PREFIX: &str = "orchestrator";

lazy_static! {
    // Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Request Metrics
    pub static ref HTTP_REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_http_requests_total"), "Total number of HTTP requests"),
        &["method", "path", "status"]
    ).expect("Failed to create http_requests_total metric");

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_http_request_duration_seconds"),
            "HTTP request duration in seconds"
        )
        .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0]),
        &["method", "path"]
    ).expect("Failed to create http_request_duration_seconds metric");

    // Job Metrics
    pub static ref JOBS_ENQUEUED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_jobs_enqueued_total"), "Job requests put on the queue"),
        &["job", "trigger", "outcome"]
    ).expect("Failed to create jobs_enqueued_total metric");

    pub static ref JOB_RUNS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_job_runs_total"), "Finished job runs by status"),
        &["job", "status"]
    ).expect("Failed to create job_runs_total metric");

    pub static ref JOB_RUN_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_job_run_duration_seconds"),
            "Job run duration in seconds"
        )
        .buckets(vec![0.1, 1.0, 5.0, 30.0, 60.0, 300.0, 900.0, 3600.0]),
        &["job"]
    ).expect("Failed to create job_run_duration_seconds metric");

    pub static ref JOB_RUNNING: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_job_running"), "1 while the job is executing"),
        &["job"]
    ).expect("Failed to create job_running metric");

    pub static ref QUEUE_PENDING: Gauge = Gauge::new(
        format!("{PREFIX}_queue_pending"),
        "Requests waiting in the job queue"
    ).expect("Failed to create queue_pending metric");

    // Scheduler Metrics
    pub static ref SCHEDULER_TICKS_TOTAL: IntCounter = IntCounter::new(
        format!("{PREFIX}_scheduler_ticks_total"),
        "Completed scheduler ticks"
    ).expect("Failed to create scheduler_ticks_total metric");
}

/// Initialize all metrics and register them with the Prometheus registry
pub fn init_metrics() {
    // Register all metrics - ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(HTTP_REQUESTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(HTTP_REQUEST_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_ENQUEUED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOB_RUNS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOB_RUN_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(JOB_RUNNING.clone()));
    let _ = REGISTRY.register(Box::new(QUEUE_PENDING.clone()));
    let _ = REGISTRY.register(Box::new(SCHEDULER_TICKS_TOTAL.clone()));

    tracing::info!("Metrics system initialized successfully");
}

/// Record an HTTP request
pub fn record_http_request(method: &str, path: &str, status: u16, duration: Duration) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status.to_string()])
        .inc();

    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path])
        .observe(duration.as_secs_f64());
}

pub fn record_job_enqueued(job: &str, trigger: &str, outcome: &str) {
    JOBS_ENQUEUED_TOTAL
        .with_label_values(&[job, trigger, outcome])
        .inc();
}

/// Record a finished job run
pub fn record_job_run(job: &str, status: &str, duration: Duration) {
    JOB_RUNS_TOTAL.with_label_values(&[job, status]).inc();
    JOB_RUN_DURATION_SECONDS
        .with_label_values(&[job])
        .observe(duration.as_secs_f64());
}

pub fn set_job_running(job: &str, running: bool) {
    JOB_RUNNING
        .with_label_values(&[job])
        .set(if running { 1.0 } else { 0.0 });
}

pub fn set_queue_pending(count: usize) {
    QUEUE_PENDING.set(count as f64);
}

pub fn record_scheduler_tick() {
    SCHEDULER_TICKS_TOTAL.inc();
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_default();
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
