use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use cascade::CascadeError;
use jobs::JobError;
use serde_json::json;

/// Error body returned by every endpoint: `{ "error": kind, "message": ... }`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: String,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(error = %self.error, "{}", self.message);
        }
        (
            self.status,
            Json(json!({
                "error": self.error,
                "message": self.message
            })),
        )
            .into_response()
    }
}

impl From<CascadeError> for ApiError {
    fn from(e: CascadeError) -> Self {
        let status = match &e {
            CascadeError::InvalidIdentifier(_) | CascadeError::UnknownEntityKind(_) => {
                StatusCode::BAD_REQUEST
            }
            CascadeError::EntityNotFound { .. }
            | CascadeError::AuditNotFound(_)
            | CascadeError::SnapshotMissing(_) => StatusCode::NOT_FOUND,
            CascadeError::SnapshotExpired(_) | CascadeError::SnapshotAlreadyUsed(_) => {
                StatusCode::CONFLICT
            }
            CascadeError::ConfirmationRequired => StatusCode::FORBIDDEN,
            CascadeError::CascadeFailed { .. } | CascadeError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, e.kind(), e.to_string())
    }
}

impl From<JobError> for ApiError {
    fn from(e: JobError) -> Self {
        match e {
            JobError::Cascade(e) => e.into(),
            stopped @ JobError::QueueStopped => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "QueueStopped",
                stopped.to_string(),
            ),
            other => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "JobError",
                other.to_string(),
            ),
        }
    }
}
