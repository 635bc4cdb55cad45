//! Document store collaborator.
//!
//! The cascade engine talks to storage only through these traits: named
//! collections of JSON documents supporting filtered find/count/update/delete,
//! plus multi-statement transactions. Two backends are provided, an
//! in-memory store (development and tests) and a SQLite store (sqlx).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

pub mod memory;
pub mod path;
pub mod query;
pub mod sqlite;

pub use memory::MemoryStore;
pub use path::{FieldPath, Segment};
pub use query::{Filter, FindOptions, PullMatcher, Sort, Update};
pub use sqlite::SqliteStore;

/// A stored document. Always carries a string `_id`.
pub type Document = Map<String, Value>;

/// Error types that can occur during store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Document in '{collection}' already exists: {id}")]
    DuplicateKey { collection: String, id: String },

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Transaction already finished")]
    TransactionClosed,

    #[error("Injected fault on '{0}'")]
    InjectedFault(String),

    #[error("Unsupported store DSN: {0}")]
    UnsupportedDsn(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of an update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateOutcome {
    pub matched: u64,
    pub modified: u64,
}

/// Index declaration. Backends record it; query evaluation does not depend on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub keys: Vec<String>,
}

impl IndexSpec {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        Self {
            name: keys.join("_"),
            keys,
        }
    }
}

/// Collection operations available both on a store and inside a transaction.
#[async_trait]
pub trait Collections: Send + Sync {
    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: FindOptions,
    ) -> StoreResult<Vec<Document>>;

    async fn find_one(&self, collection: &str, filter: &Filter) -> StoreResult<Option<Document>> {
        let mut docs = self
            .find(collection, filter, FindOptions::limit(1))
            .await?;
        Ok(docs.pop())
    }

    async fn count(&self, collection: &str, filter: &Filter) -> StoreResult<u64>;

    async fn insert_one(&self, collection: &str, doc: Document) -> StoreResult<()>;

    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> StoreResult<u64> {
        let mut inserted = 0;
        for doc in docs {
            self.insert_one(collection, doc).await?;
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        updates: &[Update],
    ) -> StoreResult<UpdateOutcome>;

    async fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        updates: &[Update],
    ) -> StoreResult<UpdateOutcome>;

    async fn delete_many(&self, collection: &str, filter: &Filter) -> StoreResult<u64>;
}

/// A transactional document store.
#[async_trait]
pub trait DocumentStore: Collections + std::fmt::Debug + 'static {
    /// Check that the backend is reachable.
    async fn ping(&self) -> StoreResult<()>;

    async fn list_collections(&self) -> StoreResult<Vec<String>>;

    /// Create the collection if absent. Returns true when it was created.
    async fn ensure_collection(&self, name: &str) -> StoreResult<bool>;

    async fn ensure_index(&self, collection: &str, index: IndexSpec) -> StoreResult<()>;

    async fn list_indexes(&self, collection: &str) -> StoreResult<Vec<IndexSpec>>;

    /// Begin a transaction. Dropping it without `commit` rolls it back.
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>>;
}

/// A multi-statement transaction.
#[async_trait]
pub trait StoreTransaction: Collections {
    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

/// Open a store for the configured DSN (`memory://` or `sqlite:...`).
pub async fn open(dsn: &str) -> StoreResult<Arc<dyn DocumentStore>> {
    if dsn.starts_with("memory:") {
        Ok(Arc::new(MemoryStore::new()))
    } else if dsn.starts_with("sqlite:") {
        Ok(Arc::new(SqliteStore::connect(dsn).await?))
    } else {
        Err(StoreError::UnsupportedDsn(dsn.to_string()))
    }
}

/// Read the `_id` of a document.
pub fn document_id(doc: &Document) -> StoreResult<&str> {
    doc.get("_id")
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::InvalidDocument("document has no string _id".to_string()))
}

/// Convert a serializable value into a document.
pub fn to_document<T: Serialize>(value: &T) -> StoreResult<Document> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::InvalidDocument(format!(
            "expected an object, got {other}"
        ))),
    }
}

/// Convert a document into a typed value.
pub fn from_document<T: for<'de> Deserialize<'de>>(doc: Document) -> StoreResult<T> {
    Ok(serde_json::from_value(Value::Object(doc))?)
}
