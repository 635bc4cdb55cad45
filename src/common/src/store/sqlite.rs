use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, Transaction, query};
use tokio::sync::Mutex;

use super::query::{self as eval, Filter, FindOptions, Update};
use super::{
    Collections, Document, DocumentStore, IndexSpec, StoreError, StoreResult, StoreTransaction,
    UpdateOutcome, document_id,
};

/// Document store persisted in SQLite.
///
/// Documents are stored as JSON bodies keyed by `(collection, id)`; filters
/// are evaluated in process with the same rules as the in-memory store.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect and initialise the schema.
    pub async fn connect(dsn: &str) -> StoreResult<Self> {
        log::info!("Connecting to document store with DSN: {dsn}");

        let in_memory = dsn.contains(":memory:");
        let dsn_with_create = if in_memory || dsn.contains("mode=") {
            dsn.to_string()
        } else if dsn.contains('?') {
            format!("{dsn}&mode=rwc")
        } else {
            format!("{dsn}?mode=rwc")
        };

        // An in-memory database lives and dies with its connection
        let options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(8)
        };

        let pool = options.connect(&dsn_with_create).await.map_err(|e| {
            log::error!("Failed to connect to SQLite database with DSN '{dsn_with_create}': {e}");
            e
        })?;

        let store = Self { pool };
        store.init().await.map_err(|e| {
            log::error!("Failed to initialize document store schema: {e}");
            e
        })?;
        log::info!("Document store schema initialized successfully");
        Ok(store)
    }

    async fn init(&self) -> StoreResult<()> {
        let create_documents = r#"
        CREATE TABLE IF NOT EXISTS documents (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            collection TEXT NOT NULL,
            id TEXT NOT NULL,
            body TEXT NOT NULL,
            UNIQUE (collection, id)
        )"#;
        query(create_documents).execute(&self.pool).await?;

        let create_collections = r#"
        CREATE TABLE IF NOT EXISTS collections (
            name TEXT PRIMARY KEY,
            created_at TEXT NOT NULL
        )"#;
        query(create_collections).execute(&self.pool).await?;

        let create_indexes = r#"
        CREATE TABLE IF NOT EXISTS indexes (
            collection TEXT NOT NULL,
            name TEXT NOT NULL,
            keys TEXT NOT NULL,
            PRIMARY KEY (collection, name)
        )"#;
        query(create_indexes).execute(&self.pool).await?;
        Ok(())
    }
}

async fn load(conn: &mut SqliteConnection, collection: &str) -> StoreResult<Vec<(i64, Document)>> {
    let rows = query("SELECT seq, body FROM documents WHERE collection = ? ORDER BY seq")
        .bind(collection)
        .fetch_all(&mut *conn)
        .await?;

    rows.into_iter()
        .map(|row| -> StoreResult<(i64, Document)> {
            let seq: i64 = row.try_get("seq")?;
            let body: String = row.try_get("body")?;
            Ok((seq, serde_json::from_str(&body)?))
        })
        .collect()
}

async fn register_collection(conn: &mut SqliteConnection, name: &str) -> StoreResult<bool> {
    let result = query("INSERT OR IGNORE INTO collections (name, created_at) VALUES (?, ?)")
        .bind(name)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

async fn find_in(
    conn: &mut SqliteConnection,
    collection: &str,
    filter: &Filter,
    options: &FindOptions,
) -> StoreResult<Vec<Document>> {
    let docs = load(conn, collection).await?;
    Ok(eval::select(docs.iter().map(|(_, doc)| doc), filter, options))
}

async fn count_in(conn: &mut SqliteConnection, collection: &str, filter: &Filter) -> StoreResult<u64> {
    let docs = load(conn, collection).await?;
    Ok(docs.iter().filter(|(_, doc)| filter.matches(doc)).count() as u64)
}

async fn insert_in(conn: &mut SqliteConnection, collection: &str, doc: Document) -> StoreResult<()> {
    let id = document_id(&doc)?.to_string();
    let body = serde_json::to_string(&doc)?;
    register_collection(conn, collection).await?;

    let result = query("INSERT INTO documents (collection, id, body) VALUES (?, ?, ?)")
        .bind(collection)
        .bind(&id)
        .bind(body)
        .execute(&mut *conn)
        .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(StoreError::DuplicateKey {
            collection: collection.to_string(),
            id,
        }),
        Err(e) => Err(e.into()),
    }
}

async fn update_in(
    conn: &mut SqliteConnection,
    collection: &str,
    filter: &Filter,
    updates: &[Update],
    many: bool,
) -> StoreResult<UpdateOutcome> {
    let mut outcome = UpdateOutcome::default();
    for (seq, mut doc) in load(conn, collection).await? {
        if !filter.matches(&doc) {
            continue;
        }
        outcome.matched += 1;
        if eval::apply_all(&mut doc, updates) {
            outcome.modified += 1;
            query("UPDATE documents SET body = ? WHERE seq = ?")
                .bind(serde_json::to_string(&doc)?)
                .bind(seq)
                .execute(&mut *conn)
                .await?;
        }
        if !many {
            break;
        }
    }
    Ok(outcome)
}

async fn delete_in(conn: &mut SqliteConnection, collection: &str, filter: &Filter) -> StoreResult<u64> {
    let mut deleted = 0;
    for (seq, doc) in load(conn, collection).await? {
        if filter.matches(&doc) {
            query("DELETE FROM documents WHERE seq = ?")
                .bind(seq)
                .execute(&mut *conn)
                .await?;
            deleted += 1;
        }
    }
    Ok(deleted)
}

#[async_trait]
impl Collections for SqliteStore {
    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: FindOptions,
    ) -> StoreResult<Vec<Document>> {
        let mut conn = self.pool.acquire().await?;
        find_in(&mut conn, collection, filter, &options).await
    }

    async fn count(&self, collection: &str, filter: &Filter) -> StoreResult<u64> {
        let mut conn = self.pool.acquire().await?;
        count_in(&mut conn, collection, filter).await
    }

    async fn insert_one(&self, collection: &str, doc: Document) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        insert_in(&mut tx, collection, doc).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        updates: &[Update],
    ) -> StoreResult<UpdateOutcome> {
        let mut tx = self.pool.begin().await?;
        let outcome = update_in(&mut tx, collection, filter, updates, false).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        updates: &[Update],
    ) -> StoreResult<UpdateOutcome> {
        let mut tx = self.pool.begin().await?;
        let outcome = update_in(&mut tx, collection, filter, updates, true).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;
        let deleted = delete_in(&mut tx, collection, filter).await?;
        tx.commit().await?;
        Ok(deleted)
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn ping(&self) -> StoreResult<()> {
        query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn list_collections(&self) -> StoreResult<Vec<String>> {
        let rows = query("SELECT name FROM collections ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| row.try_get::<String, _>("name").map_err(StoreError::from))
            .collect()
    }

    async fn ensure_collection(&self, name: &str) -> StoreResult<bool> {
        let mut conn = self.pool.acquire().await?;
        register_collection(&mut conn, name).await
    }

    async fn ensure_index(&self, collection: &str, index: IndexSpec) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        register_collection(&mut tx, collection).await?;
        query("INSERT OR IGNORE INTO indexes (collection, name, keys) VALUES (?, ?, ?)")
            .bind(collection)
            .bind(&index.name)
            .bind(serde_json::to_string(&index.keys)?)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_indexes(&self, collection: &str) -> StoreResult<Vec<IndexSpec>> {
        let known = query("SELECT 1 FROM collections WHERE name = ?")
            .bind(collection)
            .fetch_optional(&self.pool)
            .await?;
        if known.is_none() {
            return Err(StoreError::CollectionNotFound(collection.to_string()));
        }

        let rows = query("SELECT name, keys FROM indexes WHERE collection = ? ORDER BY name")
            .bind(collection)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| -> StoreResult<IndexSpec> {
                let name: String = row.try_get("name")?;
                let keys: String = row.try_get("keys")?;
                Ok(IndexSpec {
                    name,
                    keys: serde_json::from_str(&keys)?,
                })
            })
            .collect()
    }

    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteTransaction {
            tx: Mutex::new(Some(tx)),
        }))
    }
}

struct SqliteTransaction {
    tx: Mutex<Option<Transaction<'static, Sqlite>>>,
}

macro_rules! with_tx {
    ($self:ident, $conn:ident => $body:expr) => {{
        let mut guard = $self.tx.lock().await;
        let $conn: &mut SqliteConnection = guard.as_mut().ok_or(StoreError::TransactionClosed)?;
        $body.await
    }};
}

#[async_trait]
impl Collections for SqliteTransaction {
    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: FindOptions,
    ) -> StoreResult<Vec<Document>> {
        with_tx!(self, conn => find_in(conn, collection, filter, &options))
    }

    async fn count(&self, collection: &str, filter: &Filter) -> StoreResult<u64> {
        with_tx!(self, conn => count_in(conn, collection, filter))
    }

    async fn insert_one(&self, collection: &str, doc: Document) -> StoreResult<()> {
        with_tx!(self, conn => insert_in(conn, collection, doc))
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        updates: &[Update],
    ) -> StoreResult<UpdateOutcome> {
        with_tx!(self, conn => update_in(conn, collection, filter, updates, false))
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        updates: &[Update],
    ) -> StoreResult<UpdateOutcome> {
        with_tx!(self, conn => update_in(conn, collection, filter, updates, true))
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> StoreResult<u64> {
        with_tx!(self, conn => delete_in(conn, collection, filter))
    }
}

#[async_trait]
impl StoreTransaction for SqliteTransaction {
    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let tx = self.tx.into_inner().ok_or(StoreError::TransactionClosed)?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        let tx = self.tx.into_inner().ok_or(StoreError::TransactionClosed)?;
        tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::to_document;
    use serde_json::json;
    use tempfile::TempDir;

    async fn temp_store() -> (TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let dsn = format!("sqlite:{}", dir.path().join("store.db").display());
        let store = SqliteStore::connect(&dsn).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_documents_survive_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let dsn = format!("sqlite:{}", dir.path().join("store.db").display());

        let store = SqliteStore::connect(&dsn).await.unwrap();
        store
            .insert_one("student", to_document(&json!({"_id": "s1", "isActive": true})).unwrap())
            .await
            .unwrap();
        drop(store);

        let reopened = SqliteStore::connect(&dsn).await.unwrap();
        let doc = reopened
            .find_one("student", &Filter::id("s1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc["isActive"], json!(true));
        assert_eq!(reopened.list_collections().await.unwrap(), vec!["student"]);
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let (_dir, store) = temp_store().await;
        store
            .insert_one("orchestra", to_document(&json!({"_id": "o1", "memberIds": ["s1"]})).unwrap())
            .await
            .unwrap();

        let outcome = store
            .update_many("orchestra", &Filter::eq("memberIds", "s1"), &[Update::pull("memberIds", "s1")])
            .await
            .unwrap();
        assert_eq!(outcome.modified, 1);
        assert_eq!(store.count("orchestra", &Filter::eq("memberIds", "s1")).await.unwrap(), 0);
        assert_eq!(store.delete_many("orchestra", &Filter::All).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_id_is_rejected() {
        let (_dir, store) = temp_store().await;
        let doc = to_document(&json!({"_id": "s1"})).unwrap();
        store.insert_one("student", doc.clone()).await.unwrap();
        let err = store.insert_one("student", doc).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { .. }));
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let (_dir, store) = temp_store().await;
        store
            .insert_one("student", to_document(&json!({"_id": "s1"})).unwrap())
            .await
            .unwrap();

        let tx = store.begin().await.unwrap();
        tx.delete_many("student", &Filter::All).await.unwrap();
        assert_eq!(tx.count("student", &Filter::All).await.unwrap(), 0);
        tx.rollback().await.unwrap();

        assert_eq!(store.count("student", &Filter::All).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_in_memory_dsn() {
        let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
        store.ping().await.unwrap();
        store
            .ensure_index("deletion_audit", IndexSpec::new(["entityId", "timestamp"]))
            .await
            .unwrap();
        let indexes = store.list_indexes("deletion_audit").await.unwrap();
        assert_eq!(indexes, vec![IndexSpec::new(["entityId", "timestamp"])]);
        assert!(matches!(
            store.list_indexes("missing").await,
            Err(StoreError::CollectionNotFound(_))
        ));
    }
}
