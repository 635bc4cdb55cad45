//! Job vocabulary shared by configuration and the job queue.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Job priority. Higher tiers are always dequeued first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    /// Lower rank is served first.
    pub fn rank(self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobType {
    CascadeDeletion,
    BatchCascadeDeletion,
    OrphanedReferenceCleanup,
    IntegrityValidation,
    AuditLogArchive,
}

impl JobType {
    pub const ALL: [JobType; 5] = [
        JobType::CascadeDeletion,
        JobType::BatchCascadeDeletion,
        JobType::OrphanedReferenceCleanup,
        JobType::IntegrityValidation,
        JobType::AuditLogArchive,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobType::CascadeDeletion => "cascadeDeletion",
            JobType::BatchCascadeDeletion => "batchCascadeDeletion",
            JobType::OrphanedReferenceCleanup => "orphanedReferenceCleanup",
            JobType::IntegrityValidation => "integrityValidation",
            JobType::AuditLogArchive => "auditLogArchive",
        }
    }

    pub fn default_priority(self) -> Priority {
        match self {
            JobType::CascadeDeletion => Priority::High,
            JobType::BatchCascadeDeletion => Priority::Medium,
            JobType::OrphanedReferenceCleanup
            | JobType::IntegrityValidation
            | JobType::AuditLogArchive => Priority::Low,
        }
    }

    pub fn default_max_retries(self) -> u32 {
        match self {
            JobType::CascadeDeletion => 3,
            JobType::BatchCascadeDeletion | JobType::AuditLogArchive => 2,
            JobType::OrphanedReferenceCleanup | JobType::IntegrityValidation => 1,
        }
    }

    pub fn default_timeout(self) -> Duration {
        match self {
            JobType::CascadeDeletion => Duration::from_secs(5 * 60),
            JobType::BatchCascadeDeletion | JobType::AuditLogArchive => Duration::from_secs(30 * 60),
            JobType::OrphanedReferenceCleanup | JobType::IntegrityValidation => {
                Duration::from_secs(60 * 60)
            }
        }
    }

    /// Deletion jobs are user facing; exhausting their retries raises an alert.
    pub fn is_deletion(self) -> bool {
        matches!(self, JobType::CascadeDeletion | JobType::BatchCascadeDeletion)
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
