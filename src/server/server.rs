use anyhow::Result;
use std::future::IntoFuture;
use std::time::Duration;

use tracing::{error, info};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use super::{log_requests, metrics::metrics_handler, state::ServerState, ServerConfig};
use crate::background_jobs::{JobParams, JobsHandle, OrchestratorError, Trigger};

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 1000;

#[derive(Serialize)]
struct ServerStats {
    pub uptime: String,
}

fn format_uptime(duration: Duration) -> String {
    let total_seconds = duration.as_secs();

    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    format!("{}d {:02}:{:02}:{:02}", days, hours, minutes, seconds)
}

#[derive(Deserialize, Debug, Default)]
struct RunJobBody {
    #[serde(default)]
    pub params: JobParams,
}

#[derive(Serialize)]
struct RunJobResponse {
    request_id: String,
    status: &'static str,
}

#[derive(Deserialize, Debug)]
struct HistoryQuery {
    pub limit: Option<usize>,
}

impl HistoryQuery {
    fn limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .min(MAX_HISTORY_LIMIT)
    }
}

fn error_response(err: OrchestratorError) -> Response {
    match err {
        OrchestratorError::UnknownJob(_) => {
            (StatusCode::NOT_FOUND, err.to_string()).into_response()
        }
        other => {
            error!("Job API error: {}", other);
            (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()).into_response()
        }
    }
}

async fn home(State(state): State<ServerState>) -> impl IntoResponse {
    let stats = ServerStats {
        uptime: format_uptime(state.start_time.elapsed()),
    };
    Json(stats)
}

async fn list_jobs(State(jobs): State<JobsHandle>) -> Response {
    match jobs.list_jobs() {
        Ok(list) => Json(list).into_response(),
        Err(err) => error_response(err.into()),
    }
}

async fn get_queue(State(jobs): State<JobsHandle>) -> Response {
    Json(jobs.queue_info()).into_response()
}

async fn run_job(
    State(jobs): State<JobsHandle>,
    Path(name): Path<String>,
    body: Bytes,
) -> Response {
    let body: RunJobBody = if body.is_empty() {
        RunJobBody::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(body) => body,
            Err(err) => {
                return (StatusCode::BAD_REQUEST, format!("Invalid body: {}", err))
                    .into_response()
            }
        }
    };

    match jobs.enqueue(&name, body.params, Trigger::Manual) {
        Ok(ack) => (
            StatusCode::ACCEPTED,
            Json(RunJobResponse {
                request_id: ack.request_id.to_string(),
                status: ack.outcome.as_str(),
            }),
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}

async fn get_job_status(State(jobs): State<JobsHandle>, Path(name): Path<String>) -> Response {
    match jobs.get_job(&name) {
        Ok(info) => Json(info).into_response(),
        Err(err) => error_response(err),
    }
}

async fn get_job_history(
    State(jobs): State<JobsHandle>,
    Path(name): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    match jobs.get_job_history(&name, query.limit()) {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => error_response(err),
    }
}

async fn get_recent_history(
    State(jobs): State<JobsHandle>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    match jobs.get_recent_history(query.limit()) {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => error_response(err.into()),
    }
}

pub fn make_app(config: ServerConfig, jobs: JobsHandle) -> Router {
    let state = ServerState::new(config, jobs);

    let job_routes: Router = Router::new()
        .route("/", get(list_jobs))
        .route("/history", get(get_recent_history))
        .route("/{name}/run", post(run_job))
        .route("/{name}/status", get(get_job_status))
        .route("/{name}/history", get(get_job_history))
        .with_state(state.clone());

    let home_router: Router = Router::new()
        .route("/", get(home))
        .route("/v1/queue", get(get_queue))
        .with_state(state.clone());

    let mut app: Router = home_router.nest("/v1/jobs", job_routes);
    app = app.layer(middleware::from_fn_with_state(state.clone(), log_requests));

    app
}

pub fn make_metrics_app() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

/// Serves the job API on `config.port` and Prometheus metrics on
/// `config.metrics_port` until either listener fails.
pub async fn run_server(config: ServerConfig, jobs: JobsHandle) -> Result<()> {
    let port = config.port;
    let metrics_port = config.metrics_port;
    let app = make_app(config, jobs);

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    let metrics_listener =
        tokio::net::TcpListener::bind(format!("127.0.0.1:{}", metrics_port)).await?;
    info!("Job API listening on port {}", port);
    info!("Metrics listening on port {}", metrics_port);

    tokio::try_join!(
        axum::serve(listener, app).into_future(),
        axum::serve(metrics_listener, make_metrics_app()).into_future(),
    )?;
    Ok(())
}
