//! Cascade executor.
//!
//! A cascade is one storage transaction: snapshot, per-relationship cleanup,
//! entity soft (or hard) delete, snapshot insert and audit insert either all
//! commit or all roll back. Restores replay the recorded operations in
//! reverse against the snapshot, again inside a single transaction.
//!
//! The executor never retries. Storage failures surface as
//! [`CascadeError::CascadeFailed`] and the job queue decides what to do.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, SecondsFormat, Utc};
use common::config::CascadeConfig;
use common::id::EntityId;
use common::store::{
    Collections, DocumentStore, Filter, StoreTransaction, Update, UpdateOutcome, document_id,
};
use messaging::{Event, EventSink, NullSink};
use serde::{Deserialize, Serialize};

use crate::analyzer::{create_snapshot, load_entity};
use crate::audit::{AuditRecord, AuditStore, CascadeOperation, DeletionType, OperationKind};
use crate::error::{CascadeError, Result};
use crate::metrics::CascadeMetrics;
use crate::registry::{CascadeAction, EntityKind, Registry, RelationshipDefinition};
use crate::snapshot::{self, Snapshot};

/// Entity fields touched by the soft delete and put back on restore.
const SOFT_DELETE_FIELDS: [&str; 4] = ["isActive", "deleted", "deletedAt", "deletionReason"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CascadeOptions {
    /// Physically remove the entity document. Requires `confirmation`.
    pub hard_delete: bool,
    /// Archive academic records instead of deleting them
    pub preserve_academic: bool,
    pub confirmation: Option<String>,
}

impl Default for CascadeOptions {
    fn default() -> Self {
        Self {
            hard_delete: false,
            preserve_academic: true,
            confirmation: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CascadeResult {
    pub entity_id: EntityId,
    pub entity_kind: EntityKind,
    pub audit_id: EntityId,
    pub snapshot_id: EntityId,
    pub operations: Vec<CascadeOperation>,
    pub total_affected: u64,
    pub hard_deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreResult {
    pub entity_id: EntityId,
    pub entity_kind: EntityKind,
    /// The restoration audit record
    pub audit_id: EntityId,
    /// The cascade audit record that was reversed
    pub restored_from: EntityId,
    pub snapshot_id: EntityId,
    pub operations: Vec<CascadeOperation>,
    pub total_restored: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkFailure {
    pub entity_id: String,
    pub kind: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkResult {
    pub successful: usize,
    pub failed: usize,
    pub results: Vec<CascadeResult>,
    pub errors: Vec<BulkFailure>,
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Map storage failures inside a transaction to `CascadeFailed`; domain
/// errors pass through unchanged.
fn into_failure(entity_id: &EntityId, error: CascadeError) -> CascadeError {
    match error {
        CascadeError::Store(cause) => CascadeError::CascadeFailed {
            entity_id: entity_id.to_string(),
            cause: cause.to_string(),
        },
        other => other,
    }
}

#[derive(Clone)]
pub struct CascadeExecutor {
    store: Arc<dyn DocumentStore>,
    registry: Arc<Registry>,
    audit: AuditStore,
    events: Arc<dyn EventSink>,
    metrics: CascadeMetrics,
    snapshot_ttl: chrono::Duration,
    hard_delete_secret: Option<String>,
}

impl std::fmt::Debug for CascadeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CascadeExecutor")
            .field("store", &self.store)
            .field("snapshot_ttl", &self.snapshot_ttl)
            .field("hard_delete_enabled", &self.hard_delete_secret.is_some())
            .finish_non_exhaustive()
    }
}

impl CascadeExecutor {
    pub fn new(store: Arc<dyn DocumentStore>, registry: Arc<Registry>, config: &CascadeConfig) -> Self {
        let snapshot_ttl =
            chrono::Duration::from_std(config.snapshot_ttl).unwrap_or(chrono::Duration::days(30));
        Self {
            audit: AuditStore::new(store.clone()),
            store,
            registry,
            events: Arc::new(NullSink),
            metrics: CascadeMetrics::new(),
            snapshot_ttl,
            hard_delete_secret: config.hard_delete_secret.clone(),
        }
    }

    /// Publish progress and completion events to `events`.
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn metrics(&self) -> &CascadeMetrics {
        &self.metrics
    }

    pub fn audit(&self) -> &AuditStore {
        &self.audit
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Delete `raw_id` and clean up every reference to it atomically.
    pub async fn execute(
        &self,
        kind: EntityKind,
        raw_id: &str,
        actor_id: &str,
        reason: Option<&str>,
        options: &CascadeOptions,
    ) -> Result<CascadeResult> {
        let id = EntityId::parse(raw_id)?;
        if options.hard_delete {
            self.check_confirmation(options)?;
        }

        let started = Instant::now();
        tracing::info!(entity_kind = %kind, entity_id = %id, actor_id, hard_delete = options.hard_delete, "Starting cascade deletion");

        let tx = self.store.begin().await.map_err(|e| into_failure(&id, e.into()))?;
        let applied = self
            .apply_cascade(tx.as_ref(), kind, &id, actor_id, reason, options)
            .await;
        let result = match self.finish(tx, applied).await {
            Ok(result) => result,
            Err(e) => {
                self.metrics.record_failure();
                tracing::error!(entity_kind = %kind, entity_id = %id, "Cascade deletion rolled back: {e}");
                return Err(into_failure(&id, e));
            }
        };

        self.metrics
            .record_execution(result.total_affected, started.elapsed());
        // Progress is only reported for committed work
        let total_steps = result.operations.len();
        for (step, operation) in result.operations.iter().enumerate() {
            self.events.publish(Event::CascadeProgress {
                entity_kind: kind.to_string(),
                entity_id: id.to_string(),
                collection: operation.collection.clone(),
                operation: format!("{:?}", operation.operation),
                affected: operation.affected_count,
                step: step + 1,
                total_steps,
            });
        }
        self.events.publish(Event::CascadeComplete {
            entity_kind: kind.to_string(),
            entity_id: id.to_string(),
            audit_id: result.audit_id.to_string(),
            total_affected: result.total_affected,
        });
        tracing::info!(
            entity_kind = %kind,
            entity_id = %id,
            audit_id = %result.audit_id,
            total_affected = result.total_affected,
            "Cascade deletion committed"
        );
        Ok(result)
    }

    /// Commit on success, roll back otherwise.
    async fn finish<T>(&self, tx: Box<dyn StoreTransaction>, applied: Result<T>) -> Result<T> {
        match applied {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!("Rollback failed: {rollback}");
                }
                Err(e)
            }
        }
    }

    /// Check a deletion request without changing anything: the id must be
    /// well formed, the entity must exist and a hard delete must carry the
    /// confirmation.
    pub async fn validate_request(
        &self,
        kind: EntityKind,
        raw_id: &str,
        options: &CascadeOptions,
    ) -> Result<EntityId> {
        let id = EntityId::parse(raw_id)?;
        if options.hard_delete {
            self.check_confirmation(options)?;
        }
        load_entity(self.store.as_ref(), kind, &id).await?;
        Ok(id)
    }

    fn check_confirmation(&self, options: &CascadeOptions) -> Result<()> {
        match (&self.hard_delete_secret, &options.confirmation) {
            (Some(secret), Some(given)) if secret == given => Ok(()),
            _ => Err(CascadeError::ConfirmationRequired),
        }
    }

    async fn apply_cascade<C: Collections + ?Sized>(
        &self,
        tx: &C,
        kind: EntityKind,
        id: &EntityId,
        actor_id: &str,
        reason: Option<&str>,
        options: &CascadeOptions,
    ) -> Result<CascadeResult> {
        let now = Utc::now();
        let snapshot =
            create_snapshot(tx, &self.registry, kind, id, now, self.snapshot_ttl).await?;
        let audit_id = EntityId::generate();
        let tag = format!("{kind}_deletion:{audit_id}");

        let relationships = self.registry.relationships(kind);
        let mut operations = Vec::with_capacity(relationships.len());
        for relationship in relationships {
            let operation = self
                .apply_relationship(tx, relationship, id, &tag, now, options)
                .await?;
            tracing::debug!(
                entity_id = %id,
                collection = %operation.collection,
                field = %operation.field,
                affected = operation.affected_count,
                "{}",
                operation.details
            );
            operations.push(operation);
        }

        let entity_filter = Filter::id(id);
        if options.hard_delete {
            tx.delete_many(kind.collection(), &entity_filter).await?;
        } else {
            tx.update_one(
                kind.collection(),
                &entity_filter,
                &[
                    Update::set("isActive", false),
                    Update::set("deleted", true),
                    Update::set("deletedAt", timestamp(now)),
                    Update::set("deletionReason", reason),
                ],
            )
            .await?;
        }

        snapshot::insert(tx, &snapshot).await?;

        let record = AuditRecord {
            id: audit_id.clone(),
            entity_type: kind,
            entity_id: id.clone(),
            deletion_type: DeletionType::CascadeCleanup,
            cascade_operations: operations.clone(),
            snapshot_ref: Some(snapshot.id.clone()),
            timestamp: now,
            actor_id: actor_id.to_string(),
            reason: reason.map(str::to_string),
            hard_delete: options.hard_delete,
            restored_from: None,
            archived: false,
            archived_at: None,
        };
        AuditStore::insert(tx, &record).await?;

        Ok(CascadeResult {
            entity_id: id.clone(),
            entity_kind: kind,
            audit_id,
            snapshot_id: snapshot.id,
            total_affected: record.total_affected(),
            operations,
            hard_deleted: options.hard_delete,
        })
    }

    async fn apply_relationship<C: Collections + ?Sized>(
        &self,
        tx: &C,
        relationship: &RelationshipDefinition,
        id: &EntityId,
        tag: &str,
        now: DateTime<Utc>,
        options: &CascadeOptions,
    ) -> Result<CascadeOperation> {
        let collection = relationship.owner_collection.as_str();
        let filter = relationship.reference_filter(id.as_str());
        let archive = || {
            vec![
                Update::set("archived", true),
                Update::set("archivedAt", timestamp(now)),
                Update::set("archivedReason", tag),
            ]
        };

        let (operation, affected, details) = match relationship.action {
            CascadeAction::RemoveReference => {
                let outcome = tx
                    .update_many(collection, &filter, &relationship.accessor.detach(id.as_str()))
                    .await?;
                (
                    OperationKind::RemoveReference,
                    outcome.modified,
                    format!("Removed reference from {} {collection} documents", outcome.modified),
                )
            }
            CascadeAction::PreserveHistory => {
                let outcome = tx.update_many(collection, &filter, &archive()).await?;
                (
                    OperationKind::ArchiveHistory,
                    outcome.modified,
                    format!("Archived {} {collection} history records", outcome.modified),
                )
            }
            CascadeAction::ArchiveRecord if options.preserve_academic => {
                let mut updates = archive();
                updates.push(Update::set("isActive", false));
                let outcome = tx.update_many(collection, &filter, &updates).await?;
                (
                    OperationKind::ArchiveRecord,
                    outcome.modified,
                    format!("Archived and deactivated {} {collection} records", outcome.modified),
                )
            }
            CascadeAction::ArchiveRecord => {
                let deleted = tx.delete_many(collection, &filter).await?;
                (
                    OperationKind::DeleteRecord,
                    deleted,
                    format!("Deleted {deleted} {collection} records"),
                )
            }
        };

        Ok(CascadeOperation {
            collection: collection.to_string(),
            operation,
            field: relationship.field_path(),
            affected_count: affected,
            details,
        })
    }

    /// Reverse the cascade recorded in audit record `raw_audit_id`.
    pub async fn restore(
        &self,
        raw_entity_id: &str,
        actor_id: &str,
        raw_audit_id: &str,
    ) -> Result<RestoreResult> {
        let entity_id = EntityId::parse(raw_entity_id)?;
        let audit_id = EntityId::parse(raw_audit_id)?;
        let record = self
            .audit
            .get(&audit_id)
            .await?
            .filter(|r| r.deletion_type == DeletionType::CascadeCleanup && r.entity_id == entity_id)
            .ok_or_else(|| CascadeError::AuditNotFound(audit_id.to_string()))?;
        self.restore_record(record, actor_id).await
    }

    /// Reverse the cascade that produced snapshot `raw_snapshot_id`.
    pub async fn restore_from_snapshot(
        &self,
        raw_snapshot_id: &str,
        actor_id: &str,
    ) -> Result<RestoreResult> {
        let snapshot_id = EntityId::parse(raw_snapshot_id)?;
        let record = self
            .audit
            .find_by_snapshot(&snapshot_id)
            .await?
            .ok_or_else(|| CascadeError::AuditNotFound(snapshot_id.to_string()))?;
        self.restore_record(record, actor_id).await
    }

    /// Restore by either a cascade audit id or a snapshot id.
    pub async fn rollback(&self, raw_id: &str, actor_id: &str) -> Result<RestoreResult> {
        let id = EntityId::parse(raw_id)?;
        if let Some(record) = self
            .audit
            .get(&id)
            .await?
            .filter(|r| r.deletion_type == DeletionType::CascadeCleanup)
        {
            return self.restore_record(record, actor_id).await;
        }
        self.restore_from_snapshot(id.as_str(), actor_id).await
    }

    async fn restore_record(&self, record: AuditRecord, actor_id: &str) -> Result<RestoreResult> {
        let snapshot_id = record
            .snapshot_ref
            .clone()
            .ok_or_else(|| CascadeError::SnapshotMissing(record.id.to_string()))?;
        tracing::info!(
            entity_kind = %record.entity_type,
            entity_id = %record.entity_id,
            audit_id = %record.id,
            actor_id,
            "Restoring cascade deletion"
        );

        let entity_id = record.entity_id.clone();
        let tx = self
            .store
            .begin()
            .await
            .map_err(|e| into_failure(&entity_id, e.into()))?;
        let applied = self
            .apply_restore(tx.as_ref(), &record, &snapshot_id, actor_id)
            .await;
        match self.finish(tx, applied).await {
            Ok(result) => {
                self.metrics.record_restoration();
                tracing::info!(
                    entity_id = %entity_id,
                    audit_id = %result.audit_id,
                    total_restored = result.total_restored,
                    "Restore committed"
                );
                Ok(result)
            }
            Err(e) => {
                self.metrics.record_failure();
                tracing::warn!(entity_id = %entity_id, "Restore rolled back: {e}");
                Err(into_failure(&entity_id, e))
            }
        }
    }

    async fn apply_restore<C: Collections + ?Sized>(
        &self,
        tx: &C,
        record: &AuditRecord,
        snapshot_id: &EntityId,
        actor_id: &str,
    ) -> Result<RestoreResult> {
        let now = Utc::now();
        let snapshot = snapshot::load(tx, snapshot_id)
            .await?
            .ok_or_else(|| CascadeError::SnapshotMissing(record.id.to_string()))?;
        if snapshot.used {
            return Err(CascadeError::SnapshotAlreadyUsed(snapshot_id.to_string()));
        }
        if snapshot.is_expired(now) {
            return Err(CascadeError::SnapshotExpired(snapshot_id.to_string()));
        }

        let kind = record.entity_type;
        let tag = format!("{kind}_deletion:{}", record.id);
        let mut operations = Vec::with_capacity(record.cascade_operations.len());
        for operation in &record.cascade_operations {
            let Some(relationship) = self
                .registry
                .find(kind, &operation.collection, &operation.field)
            else {
                tracing::warn!(
                    collection = %operation.collection,
                    field = %operation.field,
                    "No relationship registered for recorded operation; skipping"
                );
                continue;
            };
            operations.push(
                self.reverse(tx, relationship, operation, &snapshot, &record.entity_id, &tag)
                    .await?,
            );
        }

        self.restore_entity(tx, kind, record, &snapshot).await?;

        if !snapshot::mark_used(tx, snapshot_id, now).await? {
            return Err(CascadeError::SnapshotAlreadyUsed(snapshot_id.to_string()));
        }

        let restoration = AuditRecord {
            id: EntityId::generate(),
            entity_type: kind,
            entity_id: record.entity_id.clone(),
            deletion_type: DeletionType::Restoration,
            cascade_operations: operations.clone(),
            snapshot_ref: Some(snapshot_id.clone()),
            timestamp: now,
            actor_id: actor_id.to_string(),
            reason: Some(format!("Restored from audit record {}", record.id)),
            hard_delete: false,
            restored_from: Some(record.id.clone()),
            archived: false,
            archived_at: None,
        };
        AuditStore::insert(tx, &restoration).await?;

        Ok(RestoreResult {
            entity_id: record.entity_id.clone(),
            entity_kind: kind,
            audit_id: restoration.id.clone(),
            restored_from: record.id.clone(),
            snapshot_id: snapshot_id.clone(),
            total_restored: restoration.total_affected(),
            operations,
        })
    }

    async fn reverse<C: Collections + ?Sized>(
        &self,
        tx: &C,
        relationship: &RelationshipDefinition,
        operation: &CascadeOperation,
        snapshot: &Snapshot,
        entity_id: &EntityId,
        tag: &str,
    ) -> Result<CascadeOperation> {
        let collection = operation.collection.as_str();
        let originals = snapshot.related(collection);
        let unarchive = [
            Update::unset("archived"),
            Update::unset("archivedAt"),
            Update::unset("archivedReason"),
        ];

        let (kind, restored) = match operation.operation {
            OperationKind::RemoveReference => {
                let mut modified = 0;
                for original in originals {
                    let updates = relationship.accessor.reattach(original, entity_id.as_str());
                    if updates.is_empty() {
                        continue;
                    }
                    let filter = relationship.accessor.reattach_filter(document_id(original)?);
                    let outcome: UpdateOutcome = tx.update_one(collection, &filter, &updates).await?;
                    modified += outcome.modified;
                }
                (OperationKind::RestoreReference, modified)
            }
            OperationKind::ArchiveHistory => {
                let outcome = tx
                    .update_many(collection, &Filter::eq("archivedReason", tag), &unarchive)
                    .await?;
                (OperationKind::UnarchiveHistory, outcome.modified)
            }
            OperationKind::ArchiveRecord => {
                let mut modified = 0;
                for original in originals {
                    let filter = Filter::and([
                        Filter::id(document_id(original)?),
                        Filter::eq("archivedReason", tag),
                    ]);
                    let mut updates = unarchive.to_vec();
                    updates.push(match original.get("isActive") {
                        Some(active) => Update::set("isActive", active.clone()),
                        None => Update::unset("isActive"),
                    });
                    modified += tx.update_one(collection, &filter, &updates).await?.modified;
                }
                (OperationKind::UnarchiveRecord, modified)
            }
            OperationKind::DeleteRecord => {
                let mut inserted = 0;
                for original in originals {
                    let filter = Filter::id(document_id(original)?);
                    if tx.count(collection, &filter).await? == 0 {
                        tx.insert_one(collection, original.clone()).await?;
                        inserted += 1;
                    }
                }
                (OperationKind::ReinsertRecord, inserted)
            }
            other => {
                tracing::warn!(operation = ?other, "Operation is not reversible; skipping");
                (other, 0)
            }
        };

        Ok(CascadeOperation {
            collection: collection.to_string(),
            operation: kind,
            field: operation.field.clone(),
            affected_count: restored,
            details: format!("Restored {restored} {collection} documents"),
        })
    }

    async fn restore_entity<C: Collections + ?Sized>(
        &self,
        tx: &C,
        kind: EntityKind,
        record: &AuditRecord,
        snapshot: &Snapshot,
    ) -> Result<()> {
        let filter = Filter::id(&record.entity_id);
        if record.hard_delete || tx.count(kind.collection(), &filter).await? == 0 {
            tx.insert_one(kind.collection(), snapshot.entity_document.clone())
                .await?;
            return Ok(());
        }

        let updates: Vec<Update> = SOFT_DELETE_FIELDS
            .iter()
            .map(|field| match snapshot.entity_document.get(*field) {
                Some(value) => Update::set(*field, value.clone()),
                None => Update::unset(*field),
            })
            .collect();
        tx.update_one(kind.collection(), &filter, &updates).await?;
        Ok(())
    }

    /// Delete each entity in its own transaction, one after another. A
    /// failing entity is recorded and the batch continues.
    pub async fn bulk_execute(
        &self,
        kind: EntityKind,
        entity_ids: &[String],
        actor_id: &str,
        reason: Option<&str>,
        options: &CascadeOptions,
    ) -> BulkResult {
        let mut bulk = BulkResult::default();
        for (index, raw_id) in entity_ids.iter().enumerate() {
            let success = match self.execute(kind, raw_id, actor_id, reason, options).await {
                Ok(result) => {
                    bulk.results.push(result);
                    true
                }
                Err(e) => {
                    bulk.errors.push(BulkFailure {
                        entity_id: raw_id.clone(),
                        kind: e.kind().to_string(),
                        error: e.to_string(),
                    });
                    false
                }
            };
            self.events.publish(Event::BatchProgress {
                entity_id: raw_id.clone(),
                processed: index + 1,
                total: entity_ids.len(),
                success,
            });
        }

        bulk.successful = bulk.results.len();
        bulk.failed = bulk.errors.len();
        self.events.publish(Event::BatchComplete {
            successful: bulk.successful,
            failed: bulk.failed,
        });
        tracing::info!(
            entity_kind = %kind,
            successful = bulk.successful,
            failed = bulk.failed,
            "Bulk cascade deletion finished"
        );
        bulk
    }
}
