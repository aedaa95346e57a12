use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::engine::{ListQuery, ScanEngine};
use crate::error::ScanError;
use crate::governor::GovernorSnapshot;
use crate::job::{JobCreated, JobStatus, JobStatusView, ScanRequest};
use crate::schedule::{Schedule, ScheduleDraft, ScheduleStats, ScheduleUpdate};
use crate::scheduler::Scheduler;
use crate::types::ScanResult;

#[derive(Clone)]
pub struct AppState {
    pub engine: ScanEngine,
    pub scheduler: Arc<Scheduler>,
}

/// Maps engine errors onto status codes with a `{"error": ...}` body.
#[derive(Debug)]
pub struct ApiError(ScanError);

impl From<ScanError> for ApiError {
    fn from(err: ScanError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ScanError::InvalidTarget { .. } | ScanError::Configuration(_) => StatusCode::BAD_REQUEST,
            ScanError::NotFound { .. } => StatusCode::NOT_FOUND,
            ScanError::AlreadyTerminal { .. } => StatusCode::CONFLICT,
            ScanError::GovernorExhausted { .. } => StatusCode::TOO_MANY_REQUESTS,
            ScanError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Default, Deserialize)]
struct CreateQuery {
    /// Refuse with 429 instead of queueing behind running scans.
    #[serde(default)]
    immediate: bool,
}

#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default = "default_page_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

fn default_page_limit() -> usize {
    100
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    scan_id: Uuid,
    status: JobStatus,
}

#[derive(Debug, Serialize)]
struct GovernorView {
    #[serde(flatten)]
    snapshot: GovernorSnapshot,
    queued_jobs: usize,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/scans", post(create_scan).get(list_scans))
        .route("/scans/{id}", delete(cancel_scan))
        .route("/scans/{id}/status", get(scan_status))
        .route("/scans/{id}/results", get(scan_results))
        .route("/schedules", get(list_schedules).post(create_schedule))
        .route("/schedules/stats", get(schedule_stats))
        .route(
            "/schedules/{id}",
            get(get_schedule).put(update_schedule).delete(delete_schedule),
        )
        .route("/schedules/{id}/enable", post(enable_schedule))
        .route("/schedules/{id}/disable", post(disable_schedule))
        .route("/schedules/{id}/run", post(run_schedule))
        .route("/governor", get(governor))
        .with_state(state);

    Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
}

/// Serve the API until `shutdown` fires.
pub async fn serve(bind: SocketAddr, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind HTTP API on {bind}"))?;
    info!(%bind, "HTTP API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server error")?;
    Ok(())
}

async fn create_scan(
    State(app): State<AppState>,
    Query(query): Query<CreateQuery>,
    Json(req): Json<ScanRequest>,
) -> ApiResult<(StatusCode, Json<JobCreated>)> {
    let created = if query.immediate {
        app.engine.try_create_job(req)?
    } else {
        app.engine.create_job(req)?
    };
    Ok((StatusCode::ACCEPTED, Json(created)))
}

async fn list_scans(
    State(app): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<Vec<JobStatusView>> {
    Json(app.engine.list(&query))
}

async fn scan_status(State(app): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<JobStatusView>> {
    Ok(Json(app.engine.status(id)?))
}

async fn scan_results(
    State(app): State<AppState>,
    Path(id): Path<Uuid>,
    Query(page): Query<Page>,
) -> ApiResult<Json<Vec<ScanResult>>> {
    Ok(Json(app.engine.results(id, page.limit, page.offset)?))
}

async fn cancel_scan(State(app): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<CancelResponse>> {
    let status = app.engine.cancel(id)?;
    Ok(Json(CancelResponse { scan_id: id, status }))
}

async fn list_schedules(State(app): State<AppState>) -> Json<Vec<Schedule>> {
    Json(app.scheduler.list())
}

async fn create_schedule(
    State(app): State<AppState>,
    Json(draft): Json<ScheduleDraft>,
) -> ApiResult<(StatusCode, Json<Schedule>)> {
    Ok((StatusCode::CREATED, Json(app.scheduler.create(draft)?)))
}

async fn get_schedule(State(app): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Schedule>> {
    Ok(Json(app.scheduler.get(id)?))
}

async fn update_schedule(
    State(app): State<AppState>,
    Path(id): Path<Uuid>,
    Json(update): Json<ScheduleUpdate>,
) -> ApiResult<Json<Schedule>> {
    Ok(Json(app.scheduler.update(id, update)?))
}

async fn delete_schedule(State(app): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<StatusCode> {
    app.scheduler.delete(id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn enable_schedule(State(app): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Schedule>> {
    Ok(Json(app.scheduler.enable(id)?))
}

async fn disable_schedule(State(app): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Schedule>> {
    Ok(Json(app.scheduler.disable(id)?))
}

async fn run_schedule(
    State(app): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<JobCreated>)> {
    Ok((StatusCode::ACCEPTED, Json(app.scheduler.run_now(id)?)))
}

async fn schedule_stats(State(app): State<AppState>) -> Json<ScheduleStats> {
    Json(app.scheduler.stats())
}

async fn governor(State(app): State<AppState>) -> Json<GovernorView> {
    Json(GovernorView {
        snapshot: app.engine.governor(),
        queued_jobs: app.engine.queued_jobs(),
    })
}
