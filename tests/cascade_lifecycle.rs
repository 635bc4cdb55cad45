//! End-to-end tests: HTTP router, job queue and cascade engine over a
//! file-backed SQLite store.

use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use common::store::{Collections, DocumentStore, Filter};
use common::testing::TestConfigBuilder;
use common::testing::fixtures::seed_student_scenario;
use jobs::System;
use router::{AppState, create_router};
use serde_json::{Value, json};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

struct Harness {
    app: Router,
    store: Arc<dyn DocumentStore>,
    system: System,
    _dir: TempDir,
}

async fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let config = TestConfigBuilder::new()
        .with_sqlite_dir(dir.path().to_str().unwrap())
        .with_fast_queue()
        .without_scheduler()
        .build();
    let store = common::store::open(&config.database.dsn).await.unwrap();
    let system = System::start(&config, store.clone()).await.unwrap();
    let app = create_router(AppState::new(system.handle(), config));
    Harness {
        app,
        store,
        system,
        _dir: dir,
    }
}

async fn call(app: &Router, method: &str, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

async fn wait_for_job(app: &Router, job_id: &str) -> Value {
    for _ in 0..300 {
        let (_, job) = call(app, "GET", &format!("/api/v1/jobs/{job_id}"), Value::Null).await;
        if job["status"] == json!("completed") || job["status"] == json!("failed") {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} did not finish");
}

async fn doc(store: &dyn DocumentStore, collection: &str, id: &str) -> Value {
    let doc = store
        .find_one(collection, &Filter::id(id))
        .await
        .unwrap()
        .unwrap();
    Value::Object(doc)
}

#[tokio::test]
async fn test_delete_then_rollback_restores_every_reference() {
    let h = harness().await;
    let s = seed_student_scenario(h.store.as_ref()).await.unwrap();

    let (status, preview) = call(
        &h.app,
        "POST",
        &format!("/api/v1/deletion-preview/student/{}", s.student),
        Value::Null,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(preview["totalReferences"], json!(6));

    let (status, accepted) = call(
        &h.app,
        "DELETE",
        &format!("/api/v1/cascade/student/{}", s.student),
        json!({ "reason": "left the conservatory", "actorId": "registrar" }),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job = wait_for_job(&h.app, accepted["jobId"].as_str().unwrap()).await;
    assert_eq!(job["status"], json!("completed"));
    assert_eq!(job["result"]["totalAffected"], json!(6));

    let student = doc(h.store.as_ref(), "student", s.student.as_str()).await;
    assert_eq!(student["isActive"], json!(false));
    for orchestra in &s.orchestras {
        let orchestra = doc(h.store.as_ref(), "orchestra", orchestra.as_str()).await;
        assert_eq!(orchestra["memberIds"], json!([s.bystander]));
    }

    let audit_id = job["result"]["auditId"].as_str().unwrap().to_string();
    let (status, restored) = call(
        &h.app,
        "POST",
        &format!("/api/v1/rollback/{audit_id}"),
        json!({ "actorId": "registrar" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(restored["restoredFrom"], json!(audit_id));

    let student = doc(h.store.as_ref(), "student", s.student.as_str()).await;
    assert_eq!(student["isActive"], json!(true));
    for orchestra in &s.orchestras {
        let orchestra = doc(h.store.as_ref(), "orchestra", orchestra.as_str()).await;
        let members = orchestra["memberIds"].as_array().unwrap();
        assert_eq!(members.len(), 2);
        assert!(members.contains(&json!(s.student)));
    }
    for attendance in &s.attendance {
        let record = doc(h.store.as_ref(), "activity_attendance", attendance.as_str()).await;
        assert_ne!(record["archived"], json!(true));
    }

    let (status, page) = call(&h.app, "GET", "/api/v1/audit-log?actorId=registrar", Value::Null).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total"], json!(2));

    // Nothing dangles after a full round trip
    let (status, report) = call(
        &h.app,
        "POST",
        "/api/v1/cleanup/orphaned-references",
        json!({ "dryRun": true }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["orphans"], json!([]));

    h.system.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_shutdown_stops_accepting_jobs() {
    let h = harness().await;
    let queue = h.system.handle().queue;
    assert!(queue.is_accepting());

    h.system.shutdown(Duration::from_secs(1)).await;

    assert!(!queue.is_accepting());
    let (status, body) = call(&h.app, "POST", "/api/v1/cleanup/orphaned-references", Value::Null).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], json!("QueueStopped"));
}
