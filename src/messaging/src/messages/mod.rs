use chrono::{DateTime, Utc};
use common::job::{JobType, Priority};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Severity shared by warnings, integrity issues and alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// Everything the job queue, cascade executor and integrity routines report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum Event {
    #[serde(rename = "jobQueued", rename_all = "camelCase")]
    JobQueued {
        job_id: Uuid,
        job_type: JobType,
        priority: Priority,
    },
    #[serde(rename = "jobStarted", rename_all = "camelCase")]
    JobStarted {
        job_id: Uuid,
        job_type: JobType,
        attempt: u32,
    },
    #[serde(rename = "jobCompleted", rename_all = "camelCase")]
    JobCompleted {
        job_id: Uuid,
        job_type: JobType,
        attempts: u32,
        duration_ms: u64,
    },
    #[serde(rename = "jobFailed", rename_all = "camelCase")]
    JobFailed {
        job_id: Uuid,
        job_type: JobType,
        attempts: u32,
        error: String,
    },
    #[serde(rename = "jobRetry", rename_all = "camelCase")]
    JobRetry {
        job_id: Uuid,
        job_type: JobType,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    #[serde(rename = "cascade.progress", rename_all = "camelCase")]
    CascadeProgress {
        entity_kind: String,
        entity_id: String,
        collection: String,
        operation: String,
        affected: u64,
        step: usize,
        total_steps: usize,
    },
    #[serde(rename = "cascade.complete", rename_all = "camelCase")]
    CascadeComplete {
        entity_kind: String,
        entity_id: String,
        audit_id: String,
        total_affected: u64,
    },
    #[serde(rename = "integrity.progress", rename_all = "camelCase")]
    IntegrityProgress {
        check: String,
        completed: usize,
        total: usize,
    },
    #[serde(rename = "integrity.issue", rename_all = "camelCase")]
    IntegrityIssue {
        check: String,
        collection: String,
        document_id: String,
        field: String,
        severity: Severity,
        fixed: bool,
        description: String,
    },
    #[serde(rename = "integrity.complete", rename_all = "camelCase")]
    IntegrityComplete {
        checks: usize,
        issues: usize,
        fixed: usize,
    },
    #[serde(rename = "batch.progress", rename_all = "camelCase")]
    BatchProgress {
        entity_id: String,
        processed: usize,
        total: usize,
        success: bool,
    },
    #[serde(rename = "batch.complete", rename_all = "camelCase")]
    BatchComplete { successful: usize, failed: usize },
    #[serde(rename = "system.alert", rename_all = "camelCase")]
    SystemAlert {
        severity: Severity,
        alert: String,
        message: String,
    },
}

impl Event {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Event::JobQueued { .. } => "jobQueued",
            Event::JobStarted { .. } => "jobStarted",
            Event::JobCompleted { .. } => "jobCompleted",
            Event::JobFailed { .. } => "jobFailed",
            Event::JobRetry { .. } => "jobRetry",
            Event::CascadeProgress { .. } => "cascade.progress",
            Event::CascadeComplete { .. } => "cascade.complete",
            Event::IntegrityProgress { .. } => "integrity.progress",
            Event::IntegrityIssue { .. } => "integrity.issue",
            Event::IntegrityComplete { .. } => "integrity.complete",
            Event::BatchProgress { .. } => "batch.progress",
            Event::BatchComplete { .. } => "batch.complete",
            Event::SystemAlert { .. } => "system.alert",
        }
    }

    /// Critical events are kept in a separate history slot.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Event::SystemAlert { severity, .. } if *severity >= Severity::High
        )
    }
}

/// An event as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Monotonic sequence number assigned by the bus
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: Event,
}
