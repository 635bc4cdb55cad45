use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::query::{self, Filter, FindOptions, Update};
use super::{
    Collections, Document, DocumentStore, IndexSpec, StoreError, StoreResult, StoreTransaction,
    UpdateOutcome, document_id,
};

#[derive(Debug, Clone, Default)]
struct CollectionData {
    docs: Vec<Document>,
    indexes: Vec<IndexSpec>,
}

type Data = BTreeMap<String, CollectionData>;

#[derive(Debug, Default)]
struct Inner {
    data: RwLock<Data>,
    /// Serialises writers; a transaction holds it from begin to commit.
    writer: Arc<AsyncMutex<()>>,
    failing_writes: Mutex<HashSet<String>>,
    failing_reads: Mutex<HashSet<String>>,
}

/// In-memory document store.
///
/// Transactions take a private working copy at `begin` and publish it at
/// `commit`. Readers outside the transaction only ever observe committed
/// state, and a single writer lock keeps transactions serialised.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write to `collection` fail until faults are cleared.
    pub fn fail_writes_to(&self, collection: &str) {
        self.inner
            .failing_writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(collection.to_string());
    }

    /// Make every read from `collection` fail until faults are cleared.
    pub fn fail_reads_from(&self, collection: &str) {
        self.inner
            .failing_reads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(collection.to_string());
    }

    pub fn clear_faults(&self) {
        self.inner
            .failing_writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.inner
            .failing_reads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Copy of every committed document in `collection`, in insertion order.
    pub fn dump(&self, collection: &str) -> Vec<Document> {
        self.read_data()
            .get(collection)
            .map(|c| c.docs.clone())
            .unwrap_or_default()
    }

    fn read_data(&self) -> std::sync::RwLockReadGuard<'_, Data> {
        self.inner.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_read(&self, collection: &str) -> StoreResult<()> {
        check_fault(&self.inner.failing_reads, collection)
    }

    fn check_write(&self, collection: &str) -> StoreResult<()> {
        check_fault(&self.inner.failing_writes, collection)
    }

    async fn write<T>(&self, apply: impl FnOnce(&mut Data) -> StoreResult<T>) -> StoreResult<T> {
        let _writer = self.inner.writer.lock().await;
        let mut data = self
            .inner
            .data
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        apply(&mut data)
    }
}

fn check_fault(faults: &Mutex<HashSet<String>>, collection: &str) -> StoreResult<()> {
    if faults
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .contains(collection)
    {
        return Err(StoreError::InjectedFault(collection.to_string()));
    }
    Ok(())
}

fn find_in(data: &Data, collection: &str, filter: &Filter, options: &FindOptions) -> Vec<Document> {
    data.get(collection)
        .map(|c| query::select(c.docs.iter(), filter, options))
        .unwrap_or_default()
}

fn count_in(data: &Data, collection: &str, filter: &Filter) -> u64 {
    data.get(collection)
        .map(|c| c.docs.iter().filter(|d| filter.matches(d)).count() as u64)
        .unwrap_or(0)
}

fn insert_in(data: &mut Data, collection: &str, doc: Document) -> StoreResult<()> {
    let id = document_id(&doc)?.to_string();
    let entry = data.entry(collection.to_string()).or_default();
    if entry
        .docs
        .iter()
        .any(|existing| document_id(existing).ok() == Some(id.as_str()))
    {
        return Err(StoreError::DuplicateKey {
            collection: collection.to_string(),
            id,
        });
    }
    entry.docs.push(doc);
    Ok(())
}

fn update_in(
    data: &mut Data,
    collection: &str,
    filter: &Filter,
    updates: &[Update],
    many: bool,
) -> UpdateOutcome {
    let mut outcome = UpdateOutcome::default();
    let Some(entry) = data.get_mut(collection) else {
        return outcome;
    };
    for doc in entry.docs.iter_mut().filter(|d| filter.matches(d)) {
        outcome.matched += 1;
        if query::apply_all(doc, updates) {
            outcome.modified += 1;
        }
        if !many {
            break;
        }
    }
    outcome
}

fn delete_in(data: &mut Data, collection: &str, filter: &Filter) -> u64 {
    let Some(entry) = data.get_mut(collection) else {
        return 0;
    };
    let before = entry.docs.len();
    entry.docs.retain(|d| !filter.matches(d));
    (before - entry.docs.len()) as u64
}

#[async_trait]
impl Collections for MemoryStore {
    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: FindOptions,
    ) -> StoreResult<Vec<Document>> {
        self.check_read(collection)?;
        Ok(find_in(&self.read_data(), collection, filter, &options))
    }

    async fn count(&self, collection: &str, filter: &Filter) -> StoreResult<u64> {
        self.check_read(collection)?;
        Ok(count_in(&self.read_data(), collection, filter))
    }

    async fn insert_one(&self, collection: &str, doc: Document) -> StoreResult<()> {
        self.check_write(collection)?;
        self.write(|data| insert_in(data, collection, doc)).await
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        updates: &[Update],
    ) -> StoreResult<UpdateOutcome> {
        self.check_write(collection)?;
        self.write(|data| Ok(update_in(data, collection, filter, updates, false)))
            .await
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        updates: &[Update],
    ) -> StoreResult<UpdateOutcome> {
        self.check_write(collection)?;
        self.write(|data| Ok(update_in(data, collection, filter, updates, true)))
            .await
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> StoreResult<u64> {
        self.check_write(collection)?;
        self.write(|data| Ok(delete_in(data, collection, filter))).await
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn list_collections(&self) -> StoreResult<Vec<String>> {
        Ok(self.read_data().keys().cloned().collect())
    }

    async fn ensure_collection(&self, name: &str) -> StoreResult<bool> {
        self.write(|data| {
            if data.contains_key(name) {
                return Ok(false);
            }
            data.insert(name.to_string(), CollectionData::default());
            Ok(true)
        })
        .await
    }

    async fn ensure_index(&self, collection: &str, index: IndexSpec) -> StoreResult<()> {
        self.write(|data| {
            let entry = data.entry(collection.to_string()).or_default();
            if !entry.indexes.iter().any(|existing| existing.name == index.name) {
                entry.indexes.push(index);
            }
            Ok(())
        })
        .await
    }

    async fn list_indexes(&self, collection: &str) -> StoreResult<Vec<IndexSpec>> {
        self.read_data()
            .get(collection)
            .map(|c| c.indexes.clone())
            .ok_or_else(|| StoreError::CollectionNotFound(collection.to_string()))
    }

    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        let guard = self.inner.writer.clone().lock_owned().await;
        let working = self.read_data().clone();
        Ok(Box::new(MemoryTransaction {
            store: self.clone(),
            working: Mutex::new(Some(working)),
            _writer: guard,
        }))
    }
}

/// Transaction over a private working copy of the store.
struct MemoryTransaction {
    store: MemoryStore,
    working: Mutex<Option<Data>>,
    _writer: OwnedMutexGuard<()>,
}

impl MemoryTransaction {
    fn with_working<T>(&self, f: impl FnOnce(&mut Data) -> T) -> StoreResult<T> {
        let mut working = self.working.lock().unwrap_or_else(PoisonError::into_inner);
        let data = working.as_mut().ok_or(StoreError::TransactionClosed)?;
        Ok(f(data))
    }
}

#[async_trait]
impl Collections for MemoryTransaction {
    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: FindOptions,
    ) -> StoreResult<Vec<Document>> {
        self.store.check_read(collection)?;
        self.with_working(|data| find_in(data, collection, filter, &options))
    }

    async fn count(&self, collection: &str, filter: &Filter) -> StoreResult<u64> {
        self.store.check_read(collection)?;
        self.with_working(|data| count_in(data, collection, filter))
    }

    async fn insert_one(&self, collection: &str, doc: Document) -> StoreResult<()> {
        self.store.check_write(collection)?;
        self.with_working(|data| insert_in(data, collection, doc))?
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        updates: &[Update],
    ) -> StoreResult<UpdateOutcome> {
        self.store.check_write(collection)?;
        self.with_working(|data| update_in(data, collection, filter, updates, false))
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        updates: &[Update],
    ) -> StoreResult<UpdateOutcome> {
        self.store.check_write(collection)?;
        self.with_working(|data| update_in(data, collection, filter, updates, true))
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> StoreResult<u64> {
        self.store.check_write(collection)?;
        self.with_working(|data| delete_in(data, collection, filter))
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let working = self
            .working
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(StoreError::TransactionClosed)?;
        *self
            .store
            .inner
            .data
            .write()
            .unwrap_or_else(PoisonError::into_inner) = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.working
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }
}
