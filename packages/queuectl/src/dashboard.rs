//! Read-only HTTP dashboard.
//!
//! A thin axum view over [`Queue`] inspection operations. No writes: the
//! dashboard consumes `stats`, `metrics` and `list` only.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{QueueError, Result};
use crate::job::{Job, JobState};
use crate::queue::Queue;

/// Build the dashboard router.
pub fn router(queue: Arc<Queue>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/jobs", get(jobs_handler))
        .fallback(not_found_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(queue)
}

/// Serve the dashboard until `shutdown` is cancelled.
pub async fn serve(queue: Arc<Queue>, port: u16, shutdown: CancellationToken) -> Result<()> {
    let app = router(queue);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;

    info!(port, "dashboard listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

// =============================================================================
// Handlers
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    pending: i64,
    processing: i64,
    completed: i64,
    failed: i64,
    dead: i64,
    total_completed: i64,
    avg_execution_time: f64,
    success_rate: i64,
}

#[derive(Debug, Deserialize)]
struct JobsQuery {
    state: Option<String>,
    limit: Option<i64>,
}

async fn stats_handler(
    State(queue): State<Arc<Queue>>,
) -> std::result::Result<Json<StatsResponse>, ApiError> {
    let stats = queue.stats().await?;
    let metrics = queue.metrics().await?;

    Ok(Json(StatsResponse {
        pending: stats.pending,
        processing: stats.processing,
        completed: stats.completed,
        failed: stats.failed,
        dead: stats.dead,
        total_completed: metrics.total_completed,
        avg_execution_time: metrics.avg_execution_time_ms,
        success_rate: metrics.success_rate,
    }))
}

async fn jobs_handler(
    State(queue): State<Arc<Queue>>,
    Query(query): Query<JobsQuery>,
) -> std::result::Result<Json<Vec<Job>>, ApiError> {
    let state = match query.state.as_deref() {
        Some(s) if !s.is_empty() => Some(s.parse::<JobState>()?),
        _ => None,
    };

    let jobs = queue.list(state, query.limit.unwrap_or(50)).await?;
    Ok(Json(jobs))
}

async fn not_found_handler() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "not found")
}

async fn index_handler() -> Html<&'static str> {
    Html(DASHBOARD_HTML)
}

/// Internal errors become a 500 with a plain-text body.
struct ApiError(QueueError);

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, self.0.to_string()).into_response()
    }
}

const DASHBOARD_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>QueueCtl Dashboard</title>
    <style>
        body { font-family: system-ui, sans-serif; margin: 2rem; background: #1a1a2e; color: #eee; }
        h1 { color: #7c3aed; }
        .cards { display: flex; gap: 1rem; flex-wrap: wrap; }
        .card { background: #16213e; padding: 1rem 1.5rem; border-radius: 8px; min-width: 7rem; }
        .card .label { font-size: 0.75rem; color: #888; text-transform: uppercase; }
        .card .value { font-size: 1.75rem; font-weight: 600; }
        table { width: 100%; border-collapse: collapse; margin-top: 1.5rem; font-size: 0.875rem; }
        th, td { text-align: left; padding: 0.5rem; border-bottom: 1px solid #2a2a4e; }
        th { color: #888; font-weight: 500; }
        .state-pending { color: #facc15; }
        .state-processing { color: #60a5fa; }
        .state-completed { color: #4ade80; }
        .state-failed, .state-dead { color: #f87171; }
        .stats { font-size: 0.875rem; color: #888; margin-top: 1rem; }
    </style>
</head>
<body>
    <h1>QueueCtl</h1>
    <div class="cards" id="cards"></div>
    <div class="stats" id="derived"></div>
    <table>
        <thead>
            <tr><th>ID</th><th>Command</th><th>State</th><th>Attempts</th><th>Created</th></tr>
        </thead>
        <tbody id="jobs"></tbody>
    </table>

    <script>
        const STATES = ['pending', 'processing', 'completed', 'failed', 'dead'];

        async function refresh() {
            const stats = await (await fetch('/api/stats')).json();
            document.getElementById('cards').innerHTML = STATES.map(s =>
                `<div class="card"><div class="label">${s}</div>` +
                `<div class="value state-${s}">${stats[s]}</div></div>`
            ).join('');
            document.getElementById('derived').textContent =
                `success rate ${stats.successRate}% · ` +
                `avg execution ${Math.round(stats.avgExecutionTime)} ms · ` +
                `${stats.totalCompleted} completed`;

            const jobs = await (await fetch('/api/jobs?limit=25')).json();
            document.getElementById('jobs').innerHTML = jobs.map(j =>
                `<tr><td>${j.id.slice(0, 8)}</td><td>${j.command}</td>` +
                `<td class="state-${j.state}">${j.state}</td>` +
                `<td>${j.attempts}/${j.max_retries}</td><td>${j.created_at}</td></tr>`
            ).join('');
        }

        refresh();
        setInterval(refresh, 2000);
    </script>
</body>
</html>
"#;
