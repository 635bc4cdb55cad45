//! Job records and submission specs.

use std::time::Duration;

use cascade::{CascadeOptions, EntityKind};
use chrono::{DateTime, Utc};
use common::job::{JobType, Priority};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

/// What a job operates on. The variant determines the job type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum JobPayload {
    CascadeDeletion {
        entity_kind: EntityKind,
        entity_id: String,
        actor_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default)]
        options: CascadeOptions,
    },
    BatchCascadeDeletion {
        entity_kind: EntityKind,
        entity_ids: Vec<String>,
        actor_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default)]
        options: CascadeOptions,
    },
    OrphanedReferenceCleanup {
        /// Falls back to the configured default when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dry_run: Option<bool>,
    },
    IntegrityValidation,
    AuditLogArchive,
}

impl JobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::CascadeDeletion { .. } => JobType::CascadeDeletion,
            JobPayload::BatchCascadeDeletion { .. } => JobType::BatchCascadeDeletion,
            JobPayload::OrphanedReferenceCleanup { .. } => JobType::OrphanedReferenceCleanup,
            JobPayload::IntegrityValidation => JobType::IntegrityValidation,
            JobPayload::AuditLogArchive => JobType::AuditLogArchive,
        }
    }

    /// Payload for a recurring maintenance job. Deletion jobs always need an
    /// explicit target and have no maintenance form.
    pub fn maintenance(job_type: JobType) -> Option<Self> {
        match job_type {
            JobType::OrphanedReferenceCleanup => {
                Some(JobPayload::OrphanedReferenceCleanup { dry_run: None })
            }
            JobType::IntegrityValidation => Some(JobPayload::IntegrityValidation),
            JobType::AuditLogArchive => Some(JobPayload::AuditLogArchive),
            JobType::CascadeDeletion | JobType::BatchCascadeDeletion => None,
        }
    }
}

/// A request to run a job, before the queue assigns it an id.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub payload: JobPayload,
    pub priority: Priority,
    pub max_retries: u32,
    pub timeout: Duration,
}

impl JobSpec {
    /// Spec with the defaults of the payload's job type.
    pub fn new(payload: JobPayload) -> Self {
        let job_type = payload.job_type();
        Self {
            payload,
            priority: job_type.default_priority(),
            max_retries: job_type.default_max_retries(),
            timeout: job_type.default_timeout(),
        }
    }

    pub fn job_type(&self) -> JobType {
        self.payload.job_type()
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub payload: JobPayload,
    pub priority: Priority,
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Attempts started so far
    pub attempts: u32,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Most recent failure, kept across retries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Job {
    pub fn new(spec: JobSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type: spec.payload.job_type(),
            payload: spec.payload,
            priority: spec.priority,
            max_retries: spec.max_retries,
            timeout: spec.timeout,
            attempts: 0,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, JobStatus::Completed | JobStatus::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_spec_uses_job_type_defaults() {
        let spec = JobSpec::new(JobPayload::CascadeDeletion {
            entity_kind: EntityKind::Student,
            entity_id: "64b7f0c2a1d3e4f5a6b7c8d9".to_string(),
            actor_id: "admin".to_string(),
            reason: None,
            options: CascadeOptions::default(),
        });
        assert_eq!(spec.job_type(), JobType::CascadeDeletion);
        assert_eq!(spec.priority, Priority::High);
        assert_eq!(spec.max_retries, 3);
        assert_eq!(spec.timeout, Duration::from_secs(300));

        let spec = JobSpec::new(JobPayload::IntegrityValidation).with_priority(Priority::High);
        assert_eq!(spec.priority, Priority::High);
        assert_eq!(spec.max_retries, 1);
    }

    #[test]
    fn test_payload_wire_format() {
        let payload: JobPayload = serde_json::from_value(json!({
            "type": "cascadeDeletion",
            "entityKind": "student",
            "entityId": "64b7f0c2a1d3e4f5a6b7c8d9",
            "actorId": "admin",
            "options": { "hardDelete": false }
        }))
        .unwrap();
        match &payload {
            JobPayload::CascadeDeletion { options, reason, .. } => {
                assert!(options.preserve_academic);
                assert!(reason.is_none());
            }
            other => panic!("unexpected payload {other:?}"),
        }

        let value = serde_json::to_value(JobPayload::AuditLogArchive).unwrap();
        assert_eq!(value, json!({ "type": "auditLogArchive" }));
    }

    #[test]
    fn test_deletion_jobs_have_no_maintenance_form() {
        assert!(JobPayload::maintenance(JobType::CascadeDeletion).is_none());
        assert_eq!(
            JobPayload::maintenance(JobType::AuditLogArchive).map(|p| p.job_type()),
            Some(JobType::AuditLogArchive)
        );
    }
}
