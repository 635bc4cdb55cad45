//! Job handlers and the type-to-handler registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use cascade::CascadeExecutor;
use cascade::integrity::{AuditRetention, IntegrityValidator, OrphanScanner};
use chrono::Utc;
use common::job::JobType;
use serde_json::Value;

use crate::error::{JobError, Result};
use crate::job::{Job, JobPayload};

/// Executes the body of one job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<Value>;
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job_type: JobType, handler: Arc<dyn JobHandler>) -> &mut Self {
        self.handlers.insert(job_type, handler);
        self
    }

    pub fn with(mut self, job_type: JobType, handler: Arc<dyn JobHandler>) -> Self {
        self.register(job_type, handler);
        self
    }

    pub fn get(&self, job_type: JobType) -> Result<Arc<dyn JobHandler>> {
        self.handlers
            .get(&job_type)
            .cloned()
            .ok_or(JobError::NoHandler(job_type))
    }
}

fn unexpected(job: &Job) -> JobError {
    JobError::InvalidPayload {
        job_type: job.job_type,
        reason: format!("payload is for {} jobs", job.payload.job_type()),
    }
}

/// Runs a single cascade deletion.
#[derive(Debug, Clone)]
pub struct CascadeDeletionHandler {
    executor: CascadeExecutor,
}

impl CascadeDeletionHandler {
    pub fn new(executor: CascadeExecutor) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl JobHandler for CascadeDeletionHandler {
    async fn handle(&self, job: &Job) -> Result<Value> {
        let JobPayload::CascadeDeletion {
            entity_kind,
            entity_id,
            actor_id,
            reason,
            options,
        } = &job.payload
        else {
            return Err(unexpected(job));
        };

        let result = self
            .executor
            .execute(*entity_kind, entity_id, actor_id, reason.as_deref(), options)
            .await?;
        Ok(serde_json::to_value(result)?)
    }
}

/// Deletes a list of entities one transaction at a time. Progress events
/// come from the executor.
#[derive(Debug, Clone)]
pub struct BatchCascadeDeletionHandler {
    executor: CascadeExecutor,
}

impl BatchCascadeDeletionHandler {
    pub fn new(executor: CascadeExecutor) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl JobHandler for BatchCascadeDeletionHandler {
    async fn handle(&self, job: &Job) -> Result<Value> {
        let JobPayload::BatchCascadeDeletion {
            entity_kind,
            entity_ids,
            actor_id,
            reason,
            options,
        } = &job.payload
        else {
            return Err(unexpected(job));
        };

        let bulk = self
            .executor
            .bulk_execute(*entity_kind, entity_ids, actor_id, reason.as_deref(), options)
            .await;

        // Partial success is still success; a batch where nothing went
        // through is worth another attempt.
        if bulk.successful == 0 && bulk.failed > 0 {
            return Err(JobError::Handler(format!(
                "all {} deletions in the batch failed",
                bulk.failed
            )));
        }
        Ok(serde_json::to_value(bulk)?)
    }
}

#[derive(Debug, Clone)]
pub struct OrphanCleanupHandler {
    scanner: OrphanScanner,
    default_dry_run: bool,
}

impl OrphanCleanupHandler {
    pub fn new(scanner: OrphanScanner, default_dry_run: bool) -> Self {
        Self {
            scanner,
            default_dry_run,
        }
    }
}

#[async_trait]
impl JobHandler for OrphanCleanupHandler {
    async fn handle(&self, job: &Job) -> Result<Value> {
        let JobPayload::OrphanedReferenceCleanup { dry_run } = &job.payload else {
            return Err(unexpected(job));
        };
        let report = self
            .scanner
            .scan(dry_run.unwrap_or(self.default_dry_run))
            .await?;
        Ok(serde_json::to_value(report)?)
    }
}

#[derive(Debug, Clone)]
pub struct IntegrityValidationHandler {
    validator: IntegrityValidator,
}

impl IntegrityValidationHandler {
    pub fn new(validator: IntegrityValidator) -> Self {
        Self { validator }
    }
}

#[async_trait]
impl JobHandler for IntegrityValidationHandler {
    async fn handle(&self, job: &Job) -> Result<Value> {
        if !matches!(job.payload, JobPayload::IntegrityValidation) {
            return Err(unexpected(job));
        }
        let report = self.validator.run().await;
        Ok(serde_json::to_value(report)?)
    }
}

#[derive(Debug, Clone)]
pub struct AuditArchiveHandler {
    retention: AuditRetention,
}

impl AuditArchiveHandler {
    pub fn new(retention: AuditRetention) -> Self {
        Self { retention }
    }
}

#[async_trait]
impl JobHandler for AuditArchiveHandler {
    async fn handle(&self, job: &Job) -> Result<Value> {
        if !matches!(job.payload, JobPayload::AuditLogArchive) {
            return Err(unexpected(job));
        }
        let run = self.retention.archive(Utc::now()).await?;
        Ok(serde_json::to_value(run)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobSpec;
    use cascade::{CascadeOptions, EntityKind, Registry};
    use common::config::CascadeConfig;
    use common::store::MemoryStore;
    use common::testing::fixtures::seed_student_scenario;
    use serde_json::json;

    fn executor(store: Arc<MemoryStore>) -> CascadeExecutor {
        CascadeExecutor::new(store, Arc::new(Registry::conservatory()), &CascadeConfig::default())
    }

    #[tokio::test]
    async fn test_cascade_handler_runs_the_executor() {
        let store = Arc::new(MemoryStore::new());
        let scenario = seed_student_scenario(store.as_ref()).await.unwrap();
        let job = Job::new(JobSpec::new(JobPayload::CascadeDeletion {
            entity_kind: EntityKind::Student,
            entity_id: scenario.student.to_string(),
            actor_id: "admin".to_string(),
            reason: Some("test".to_string()),
            options: CascadeOptions::default(),
        }));

        let value = CascadeDeletionHandler::new(executor(store))
            .handle(&job)
            .await
            .unwrap();
        assert_eq!(value["totalAffected"], json!(6));
        assert_eq!(value["operations"].as_array().map(Vec::len), Some(4));
    }

    #[tokio::test]
    async fn test_unknown_entity_is_not_retryable() {
        let store = Arc::new(MemoryStore::new());
        let job = Job::new(JobSpec::new(JobPayload::CascadeDeletion {
            entity_kind: EntityKind::Teacher,
            entity_id: "64b7f0c2a1d3e4f5a6b7c8d9".to_string(),
            actor_id: "admin".to_string(),
            reason: None,
            options: CascadeOptions::default(),
        }));

        let err = CascadeDeletionHandler::new(executor(store))
            .handle(&job)
            .await
            .unwrap_err();
        assert!(!err.is_retryable(), "{err}");
    }

    #[tokio::test]
    async fn test_mismatched_payload_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let job = Job::new(JobSpec::new(JobPayload::AuditLogArchive));
        let err = CascadeDeletionHandler::new(executor(store))
            .handle(&job)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidPayload { .. }));
    }

    #[test]
    fn test_registry_reports_missing_handler() {
        let registry = HandlerRegistry::new();
        assert!(matches!(
            registry.get(JobType::IntegrityValidation),
            Err(JobError::NoHandler(JobType::IntegrityValidation))
        ));
    }
}
