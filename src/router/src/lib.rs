use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use common::config::Configuration;
use jobs::SystemHandle;
use std::sync::Arc;

pub mod endpoints;
pub mod error;

pub use error::ApiError;

pub trait RouterState: std::fmt::Debug + Clone + Send + Sync + 'static {
    fn system(&self) -> &SystemHandle;
    fn config(&self) -> &Configuration;
}

/// Shared state for route handlers: the running system plus the
/// configuration it was started with
#[derive(Debug, Clone)]
pub struct AppState {
    system: SystemHandle,
    config: Arc<Configuration>,
}

impl AppState {
    pub fn new(system: SystemHandle, config: Configuration) -> Self {
        Self {
            system,
            config: Arc::new(config),
        }
    }
}

impl RouterState for AppState {
    fn system(&self) -> &SystemHandle {
        &self.system
    }

    fn config(&self) -> &Configuration {
        &self.config
    }
}

/// Create a new router instance with all routes configured
pub fn create_router<S: RouterState>(state: S) -> Router {
    Router::new()
        .route("/health", get(health_check::<S>))
        .nest(
            "/api/v1",
            endpoints::deletion::router().merge(endpoints::operations::router()),
        )
        .with_state(state)
}

/// Queue health; 503 while any alert is active
#[tracing::instrument(skip_all)]
async fn health_check<S: RouterState>(state: State<S>) -> impl IntoResponse {
    let report = state.system().health.check();
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, Response};
    use common::store::MemoryStore;
    use common::testing::TestConfigBuilder;
    use jobs::System;
    use serde_json::Value;
    use tower::ServiceExt;

    pub struct TestApp {
        pub app: Router,
        pub store: Arc<MemoryStore>,
        pub system: System,
    }

    pub async fn app(config: TestConfigBuilder) -> TestApp {
        let store = Arc::new(MemoryStore::new());
        let config = config.without_scheduler().build();
        let system = System::start(&config, store.clone()).await.unwrap();
        let app = create_router(AppState::new(system.handle(), config));
        TestApp { app, store, system }
    }

    pub async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response: Response<Body> = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    pub fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    pub fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use common::testing::TestConfigBuilder;
    use axum::http::StatusCode;
    use std::time::Duration;

    #[tokio::test]
    async fn test_health_endpoint() {
        let t = app(TestConfigBuilder::new()).await;
        let (status, body) = send(&t.app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["healthy"], serde_json::json!(true));
        t.system.shutdown(Duration::from_secs(1)).await;
    }
}
