use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use common::id::EntityId;
use common::store::{Collections, Document, Filter, Update, from_document, to_document};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::registry::EntityKind;

pub const SNAPSHOT_COLLECTION: &str = "deletion_snapshots";

/// Point-in-time copy of an entity and every document referencing it,
/// captured inside the cascade transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(rename = "_id")]
    pub id: EntityId,
    pub entity_kind: EntityKind,
    pub entity_id: EntityId,
    pub entity_document: Document,
    pub related_documents_by_collection: BTreeMap<String, Vec<Document>>,
    pub captured_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub used: bool,
    #[serde(default)]
    pub used_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Snapshot documents of `collection`.
    pub fn related(&self, collection: &str) -> &[Document] {
        self.related_documents_by_collection
            .get(collection)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn related_count(&self) -> usize {
        self.related_documents_by_collection.values().map(Vec::len).sum()
    }
}

pub async fn insert<C: Collections + ?Sized>(store: &C, snapshot: &Snapshot) -> Result<()> {
    store
        .insert_one(SNAPSHOT_COLLECTION, to_document(snapshot)?)
        .await?;
    Ok(())
}

pub async fn load<C: Collections + ?Sized>(store: &C, id: &EntityId) -> Result<Option<Snapshot>> {
    match store.find_one(SNAPSHOT_COLLECTION, &Filter::id(id)).await? {
        Some(doc) => Ok(Some(from_document(doc)?)),
        None => Ok(None),
    }
}

/// Consume the snapshot. Only an unused snapshot transitions.
pub async fn mark_used<C: Collections + ?Sized>(
    store: &C,
    id: &EntityId,
    now: DateTime<Utc>,
) -> Result<bool> {
    let outcome = store
        .update_one(
            SNAPSHOT_COLLECTION,
            &Filter::and([Filter::id(id), Filter::ne("used", true)]),
            &[Update::set("used", true), Update::set("usedAt", now.to_rfc3339())],
        )
        .await?;
    Ok(outcome.modified > 0)
}
