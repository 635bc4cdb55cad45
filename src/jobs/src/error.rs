use std::time::Duration;

use cascade::CascadeError;
use common::job::JobType;

/// Reasons a job attempt (or a submission) can fail
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job exceeded its {0:?} timeout")]
    JobTimeout(Duration),

    #[error("Job handler failed: {0}")]
    Handler(String),

    #[error("Invalid payload for {job_type} job: {reason}")]
    InvalidPayload { job_type: JobType, reason: String },

    #[error("No handler registered for {0} jobs")]
    NoHandler(JobType),

    #[error("Job queue is not accepting new jobs")]
    QueueStopped,

    #[error(transparent)]
    Cascade(#[from] CascadeError),
}

impl JobError {
    /// Whether another attempt of the same job could succeed.
    ///
    /// Malformed requests (bad ids, unknown entities, missing handlers) fail
    /// the same way every time and are not retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            JobError::JobTimeout(_) | JobError::Handler(_) => true,
            JobError::Cascade(e) => e.is_retryable(),
            JobError::InvalidPayload { .. } | JobError::NoHandler(_) | JobError::QueueStopped => {
                false
            }
        }
    }
}

impl From<serde_json::Error> for JobError {
    fn from(e: serde_json::Error) -> Self {
        JobError::Handler(format!("failed to encode job result: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, JobError>;
