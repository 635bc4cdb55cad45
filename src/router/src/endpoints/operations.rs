use crate::{ApiError, RouterState};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use jobs::{JobId, JobPayload, JobSpec};
use serde::Deserialize;
use serde_json::json;

/// Finished jobs included in the operations snapshot
const RECENT_JOBS: usize = 20;

/// Maintenance, job and event routes
pub fn router<S: RouterState>() -> Router<S> {
    Router::new()
        .route(
            "/cleanup/orphaned-references",
            post(cleanup_orphaned_references::<S>),
        )
        .route("/operations", get(list_operations::<S>))
        .route("/jobs/:job_id", get(get_job::<S>))
        .route("/events/recent", get(recent_events::<S>))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CleanupRequest {
    pub dry_run: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RecentEventsQuery {
    pub limit: Option<usize>,
}

/// POST /cleanup/orphaned-references
///
/// A dry run scans synchronously and returns the report. A real cleanup is
/// queued as a maintenance job.
#[tracing::instrument(skip(state, body))]
pub async fn cleanup_orphaned_references<S: RouterState>(
    state: State<S>,
    body: Option<Json<CleanupRequest>>,
) -> Result<Response, ApiError> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let system = state.system();
    let dry_run = request
        .dry_run
        .unwrap_or(state.config().orphan_cleanup.dry_run);

    if dry_run {
        let report = system.scanner.scan(true).await?;
        return Ok(Json(report).into_response());
    }

    let job_id = system
        .queue
        .enqueue(JobSpec::new(JobPayload::OrphanedReferenceCleanup {
            dry_run: Some(false),
        }))?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "jobId": job_id, "status": "queued" })),
    )
        .into_response())
}

/// GET /operations
///
/// Queue status, jobs not yet finished and the most recent finished jobs
#[tracing::instrument(skip(state))]
pub async fn list_operations<S: RouterState>(state: State<S>) -> impl IntoResponse {
    let queue = &state.system().queue;
    Json(json!({
        "status": queue.status(),
        "active": queue.active_jobs(),
        "recent": queue.history(Some(RECENT_JOBS)),
    }))
}

/// GET /jobs/:job_id
#[tracing::instrument(skip(state))]
pub async fn get_job<S: RouterState>(
    state: State<S>,
    Path(job_id): Path<JobId>,
) -> Result<impl IntoResponse, ApiError> {
    state.system().queue.job(job_id).map(Json).ok_or_else(|| {
        ApiError::new(
            StatusCode::NOT_FOUND,
            "JobNotFound",
            format!("Job '{job_id}' not found"),
        )
    })
}

/// GET /events/recent
#[tracing::instrument(skip(state))]
pub async fn recent_events<S: RouterState>(
    state: State<S>,
    Query(query): Query<RecentEventsQuery>,
) -> impl IntoResponse {
    let events = &state.system().events;
    Json(json!({
        "events": events.recent(query.limit),
        "critical": events.critical(),
    }))
}
