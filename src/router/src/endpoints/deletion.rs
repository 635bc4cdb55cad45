use crate::{ApiError, RouterState};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
};
use cascade::{AuditQuery, CascadeError, CascadeOptions, EntityKind};
use common::id::EntityId;
use jobs::{JobPayload, JobSpec};
use serde::Deserialize;
use serde_json::json;

/// Actor recorded when a request does not name one
const DEFAULT_ACTOR: &str = "api";

/// Deletion preview, cascade, rollback and audit routes
pub fn router<S: RouterState>() -> Router<S> {
    Router::new()
        .route(
            "/deletion-preview/:entity_kind/:entity_id",
            post(preview_deletion::<S>),
        )
        .route("/cascade/:entity_kind/:entity_id", delete(cascade_delete::<S>))
        .route("/rollback/:id", post(rollback::<S>))
        .route("/audit-log", get(list_audit_log::<S>))
        .route("/audit-log/:audit_id", get(get_audit_record::<S>))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CascadeRequest {
    #[serde(flatten)]
    pub options: CascadeOptions,
    pub reason: Option<String>,
    pub actor_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RollbackRequest {
    pub actor_id: Option<String>,
}

/// POST /deletion-preview/:entity_kind/:entity_id
///
/// Impact report for deleting an entity. Read only.
#[tracing::instrument(skip(state))]
pub async fn preview_deletion<S: RouterState>(
    state: State<S>,
    Path((entity_kind, entity_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let kind: EntityKind = entity_kind.parse()?;
    let report = state
        .system()
        .analyzer
        .preview_deletion(kind, &entity_id)
        .await?;
    Ok(Json(report))
}

/// DELETE /cascade/:entity_kind/:entity_id
///
/// Validates the request and queues a cascade deletion job. Malformed ids,
/// unknown entities and unconfirmed hard deletes are rejected here and never
/// reach the queue.
#[tracing::instrument(skip(state, body))]
pub async fn cascade_delete<S: RouterState>(
    state: State<S>,
    Path((entity_kind, entity_id)): Path<(String, String)>,
    body: Option<Json<CascadeRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let kind: EntityKind = entity_kind.parse()?;
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let system = state.system();

    let id = system
        .executor
        .validate_request(kind, &entity_id, &request.options)
        .await?;
    let job_id = system.queue.enqueue(JobSpec::new(JobPayload::CascadeDeletion {
        entity_kind: kind,
        entity_id: id.to_string(),
        actor_id: request.actor_id.unwrap_or_else(|| DEFAULT_ACTOR.to_string()),
        reason: request.reason,
        options: request.options,
    }))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "jobId": job_id,
            "status": "queued",
            "entityKind": kind,
            "entityId": id,
        })),
    ))
}

/// POST /rollback/:id
///
/// Reverse a cascade. The id may be the cascade's audit record or its
/// snapshot.
#[tracing::instrument(skip(state, body))]
pub async fn rollback<S: RouterState>(
    state: State<S>,
    Path(id): Path<String>,
    body: Option<Json<RollbackRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let actor_id = body
        .and_then(|Json(request)| request.actor_id)
        .unwrap_or_else(|| DEFAULT_ACTOR.to_string());
    let result = state.system().executor.rollback(&id, &actor_id).await?;
    Ok(Json(result))
}

/// GET /audit-log
#[tracing::instrument(skip(state))]
pub async fn list_audit_log<S: RouterState>(
    state: State<S>,
    Query(query): Query<AuditQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let page = state.system().audit().list(&query).await?;
    Ok(Json(page))
}

/// GET /audit-log/:audit_id
#[tracing::instrument(skip(state))]
pub async fn get_audit_record<S: RouterState>(
    state: State<S>,
    Path(audit_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = EntityId::parse(&audit_id).map_err(CascadeError::from)?;
    let record = state
        .system()
        .audit()
        .get(&id)
        .await?
        .ok_or(CascadeError::AuditNotFound(audit_id))?;
    Ok(Json(record))
}

#[cfg(test)]
mod tests {
    use crate::test_support::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use common::testing::TestConfigBuilder;
    use common::testing::fixtures::seed_student_scenario;
    use jobs::JobStatus;
    use serde_json::{Value, json};
    use std::time::Duration;

    async fn wait_for_job(t: &TestApp, job_id: &Value) -> JobStatus {
        let id = serde_json::from_value(job_id.clone()).unwrap();
        let queue = &t.system.handle().queue;
        for _ in 0..200 {
            if let Some(job) = queue.job(id) {
                if matches!(job.status, JobStatus::Completed | JobStatus::Failed) {
                    return job.status;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} did not finish");
    }

    fn delete(uri: &str, body: Value) -> Request<Body> {
        json_request("DELETE", uri, body)
    }

    #[tokio::test]
    async fn test_preview_reports_critical_dependencies() {
        let t = app(TestConfigBuilder::new()).await;
        let s = seed_student_scenario(t.store.as_ref()).await.unwrap();

        let uri = format!("/api/v1/deletion-preview/student/{}", s.student);
        let (status, body) = send(&t.app, json_request("POST", &uri, Value::Null)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["canDelete"], json!(false));
        assert_eq!(body["estimatedImpactLevel"], json!("high"));
        assert_eq!(body["totalReferences"], json!(6));

        let (status, body) = send(
            &t.app,
            json_request("POST", "/api/v1/deletion-preview/student/xyz", Value::Null),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], json!("InvalidIdentifier"));

        let uri = format!("/api/v1/deletion-preview/piano/{}", s.student);
        let (status, _) = send(&t.app, json_request("POST", &uri, Value::Null)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_cascade_then_rollback_once() {
        let t = app(TestConfigBuilder::new().with_fast_queue()).await;
        let s = seed_student_scenario(t.store.as_ref()).await.unwrap();

        let uri = format!("/api/v1/cascade/student/{}", s.student);
        let (status, body) = send(
            &t.app,
            delete(&uri, json!({ "reason": "graduated", "actorId": "admin" })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(wait_for_job(&t, &body["jobId"]).await, JobStatus::Completed);

        let (status, page) = send(&t.app, get("/api/v1/audit-log?actorId=admin")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["total"], json!(1));
        let audit_id = page["items"][0]["_id"].as_str().unwrap().to_string();

        let (status, record) = send(&t.app, get(&format!("/api/v1/audit-log/{audit_id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(record["cascadeOperations"].as_array().map(Vec::len), Some(4));

        let uri = format!("/api/v1/rollback/{audit_id}");
        let (status, restored) = send(&t.app, json_request("POST", &uri, Value::Null)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(restored["restoredFrom"], json!(audit_id));

        let (status, body) = send(&t.app, json_request("POST", &uri, Value::Null)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], json!("SnapshotAlreadyUsed"));
    }

    #[tokio::test]
    async fn test_invalid_requests_are_never_queued() {
        let t = app(TestConfigBuilder::new().with_hard_delete_secret("letmein")).await;
        let s = seed_student_scenario(t.store.as_ref()).await.unwrap();

        let uri = format!("/api/v1/cascade/student/{}", s.student);
        let (status, body) = send(&t.app, delete(&uri, json!({ "hardDelete": true }))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], json!("ConfirmationRequired"));

        let uri = format!("/api/v1/cascade/teacher/{}", s.student);
        let (status, _) = send(&t.app, delete(&uri, Value::Null)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&t.app, delete("/api/v1/cascade/student/1234", Value::Null)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        assert_eq!(t.system.handle().queue.metrics().enqueued(), 0);
    }

    #[tokio::test]
    async fn test_rollback_unknown_id() {
        let t = app(TestConfigBuilder::new()).await;
        let (status, body) = send(
            &t.app,
            json_request(
                "POST",
                "/api/v1/rollback/64b7f0c2a1d3e4f5a6b7c8d9",
                json!({ "actorId": "admin" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], json!("AuditNotFound"));
    }
}
