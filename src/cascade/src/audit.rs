//! Append-only deletion audit log.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::id::EntityId;
use common::store::{
    Collections, DocumentStore, Filter, FindOptions, IndexSpec, from_document, to_document,
};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::registry::EntityKind;
use crate::snapshot::SNAPSHOT_COLLECTION;

pub const AUDIT_COLLECTION: &str = "deletion_audit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionType {
    CascadeCleanup,
    Restoration,
    RetentionArchive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    RemoveReference,
    ArchiveHistory,
    ArchiveRecord,
    DeleteRecord,
    RestoreReference,
    UnarchiveHistory,
    UnarchiveRecord,
    ReinsertRecord,
}

/// One counted step of a cascade or restore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CascadeOperation {
    pub collection: String,
    pub operation: OperationKind,
    /// Path of the reference inside `collection`
    pub field: String,
    pub affected_count: u64,
    pub details: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    #[serde(rename = "_id")]
    pub id: EntityId,
    pub entity_type: EntityKind,
    pub entity_id: EntityId,
    pub deletion_type: DeletionType,
    pub cascade_operations: Vec<CascadeOperation>,
    pub snapshot_ref: Option<EntityId>,
    pub timestamp: DateTime<Utc>,
    pub actor_id: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub hard_delete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restored_from: Option<EntityId>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
}

impl AuditRecord {
    pub fn total_affected(&self) -> u64 {
        self.cascade_operations.iter().map(|op| op.affected_count).sum()
    }
}

/// Filters for listing the audit log. Pages are 1-based.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuditQuery {
    pub entity_id: Option<String>,
    pub entity_type: Option<EntityKind>,
    pub actor_id: Option<String>,
    pub deletion_type: Option<DeletionType>,
    pub include_archived: bool,
    pub page: usize,
    pub page_size: usize,
}

impl Default for AuditQuery {
    fn default() -> Self {
        Self {
            entity_id: None,
            entity_type: None,
            actor_id: None,
            deletion_type: None,
            include_archived: false,
            page: 1,
            page_size: 20,
        }
    }
}

impl AuditQuery {
    pub const MAX_PAGE_SIZE: usize = 200;

    fn filter(&self) -> Filter {
        let mut filters = Vec::new();
        if let Some(entity_id) = &self.entity_id {
            filters.push(Filter::eq("entityId", entity_id.to_ascii_lowercase()));
        }
        if let Some(entity_type) = self.entity_type {
            filters.push(Filter::eq("entityType", entity_type.as_str()));
        }
        if let Some(actor_id) = &self.actor_id {
            filters.push(Filter::eq("actorId", actor_id.as_str()));
        }
        if let Some(deletion_type) = self.deletion_type {
            filters.push(Filter::eq("deletionType", serde_json::json!(deletion_type)));
        }
        if !self.include_archived {
            filters.push(Filter::ne("archived", true));
        }
        Filter::and(filters)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: usize,
    pub page_size: usize,
}

/// Access to the audit collection.
#[derive(Debug, Clone)]
pub struct AuditStore {
    store: Arc<dyn DocumentStore>,
}

impl AuditStore {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Create the audit and snapshot collections and their indexes.
    pub async fn ensure_indexes(&self) -> Result<()> {
        if self.store.ensure_collection(AUDIT_COLLECTION).await? {
            tracing::info!(collection = AUDIT_COLLECTION, "Created audit collection");
        }
        if self.store.ensure_collection(SNAPSHOT_COLLECTION).await? {
            tracing::info!(collection = SNAPSHOT_COLLECTION, "Created snapshot collection");
        }

        let audit_indexes = [
            IndexSpec::new(["entityId", "timestamp"]),
            IndexSpec::new(["entityType", "timestamp"]),
            IndexSpec::new(["actorId", "timestamp"]),
            IndexSpec::new(["deletionType"]),
            IndexSpec::new(["timestamp"]),
            IndexSpec::new(["archived", "archivedAt"]),
            IndexSpec::new(["snapshotRef"]),
        ];
        for index in audit_indexes {
            self.store.ensure_index(AUDIT_COLLECTION, index).await?;
        }

        for index in [IndexSpec::new(["entityId"]), IndexSpec::new(["expiresAt"])] {
            self.store.ensure_index(SNAPSHOT_COLLECTION, index).await?;
        }
        Ok(())
    }

    /// Insert through `store`, which is usually the open cascade transaction.
    pub async fn insert<C: Collections + ?Sized>(store: &C, record: &AuditRecord) -> Result<()> {
        store
            .insert_one(AUDIT_COLLECTION, to_document(record)?)
            .await?;
        Ok(())
    }

    pub async fn get(&self, id: &EntityId) -> Result<Option<AuditRecord>> {
        self.find_one(Filter::id(id)).await
    }

    /// The cascade record that produced `snapshot_id`.
    pub async fn find_by_snapshot(&self, snapshot_id: &EntityId) -> Result<Option<AuditRecord>> {
        self.find_one(Filter::and([
            Filter::eq("snapshotRef", snapshot_id),
            Filter::eq("deletionType", "cascade_cleanup"),
        ]))
        .await
    }

    async fn find_one(&self, filter: Filter) -> Result<Option<AuditRecord>> {
        match self.store.find_one(AUDIT_COLLECTION, &filter).await? {
            Some(doc) => Ok(Some(from_document(doc)?)),
            None => Ok(None),
        }
    }

    /// Page through the log, newest first.
    pub async fn list(&self, query: &AuditQuery) -> Result<Page<AuditRecord>> {
        let filter = query.filter();
        let page = query.page.max(1);
        let page_size = query.page_size.clamp(1, AuditQuery::MAX_PAGE_SIZE);

        let total = self.store.count(AUDIT_COLLECTION, &filter).await?;
        let options = FindOptions::default()
            .with_sort("timestamp", true)
            .with_skip((page - 1) * page_size)
            .with_limit(page_size);
        let items = self
            .store
            .find(AUDIT_COLLECTION, &filter, options)
            .await?
            .into_iter()
            .map(from_document)
            .collect::<std::result::Result<Vec<AuditRecord>, _>>()?;

        Ok(Page {
            items,
            total,
            page,
            page_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use common::store::MemoryStore;

    fn record(entity_id: &EntityId, actor: &str, at: DateTime<Utc>) -> AuditRecord {
        AuditRecord {
            id: EntityId::generate(),
            entity_type: EntityKind::Student,
            entity_id: entity_id.clone(),
            deletion_type: DeletionType::CascadeCleanup,
            cascade_operations: vec![CascadeOperation {
                collection: "orchestra".to_string(),
                operation: OperationKind::RemoveReference,
                field: "memberIds".to_string(),
                affected_count: 2,
                details: "Removed from 2 orchestra documents".to_string(),
            }],
            snapshot_ref: Some(EntityId::generate()),
            timestamp: at,
            actor_id: actor.to_string(),
            reason: Some("graduated".to_string()),
            hard_delete: false,
            restored_from: None,
            archived: false,
            archived_at: None,
        }
    }

    #[tokio::test]
    async fn test_list_is_newest_first_and_paginated() {
        let memory = Arc::new(MemoryStore::new());
        let audit = AuditStore::new(memory.clone());
        audit.ensure_indexes().await.unwrap();

        let entity = EntityId::generate();
        let base = Utc::now() - Duration::hours(1);
        for minutes in 0..5 {
            AuditStore::insert(
                memory.as_ref(),
                &record(&entity, "admin", base + Duration::minutes(minutes)),
            )
            .await
            .unwrap();
        }
        AuditStore::insert(memory.as_ref(), &record(&EntityId::generate(), "other", base))
            .await
            .unwrap();

        let query = AuditQuery {
            entity_id: Some(entity.to_string()),
            page: 1,
            page_size: 2,
            ..AuditQuery::default()
        };
        let first = audit.list(&query).await.unwrap();
        assert_eq!(first.total, 5);
        assert_eq!(first.items.len(), 2);
        assert!(first.items[0].timestamp > first.items[1].timestamp);

        let last = audit.list(&AuditQuery { page: 3, ..query }).await.unwrap();
        assert_eq!(last.items.len(), 1);
        assert_eq!(last.items[0].timestamp, base);

        let by_actor = audit
            .list(&AuditQuery {
                actor_id: Some("other".to_string()),
                ..AuditQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(by_actor.total, 1);
    }

    #[tokio::test]
    async fn test_find_by_snapshot() {
        let memory = Arc::new(MemoryStore::new());
        let audit = AuditStore::new(memory.clone());
        let original = record(&EntityId::generate(), "admin", Utc::now());
        AuditStore::insert(memory.as_ref(), &original).await.unwrap();

        let snapshot_id = original.snapshot_ref.clone().unwrap();
        let found = audit.find_by_snapshot(&snapshot_id).await.unwrap().unwrap();
        assert_eq!(found, original);
        assert_eq!(found.total_affected(), 2);
        assert!(audit.get(&EntityId::generate()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ensure_indexes_is_idempotent() {
        let memory = Arc::new(MemoryStore::new());
        let audit = AuditStore::new(memory.clone());
        audit.ensure_indexes().await.unwrap();
        audit.ensure_indexes().await.unwrap();
        let indexes = memory.list_indexes(AUDIT_COLLECTION).await.unwrap();
        assert_eq!(indexes.len(), 7);
        assert!(indexes.iter().any(|i| i.name == "entityId_timestamp"));
    }
}
