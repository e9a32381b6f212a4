use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{DocumentStore, StoreError, VersionedDocument};

type DocumentKey = (String, String);

/// In-process document store. Writes are compare-and-set on a per-document
/// version, like the hosted store. Tests can inject conflicts to exercise
/// retry paths.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    documents: Mutex<HashMap<DocumentKey, VersionedDocument>>,
    pending_conflicts: AtomicUsize,
    collection_conflicts: Mutex<HashMap<String, usize>>,
    commits: AtomicUsize,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` commits fail with a conflict.
    pub fn inject_conflicts(&self, count: usize) {
        self.pending_conflicts.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` commits to `collection` fail with a conflict.
    /// Commits to other collections are unaffected.
    pub fn inject_conflicts_in(&self, collection: &str, count: usize) {
        self.collection_conflicts
            .lock()
            .insert(collection.to_string(), count);
    }

    /// Number of successful commits.
    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Ids and values of every document in `collection`, sorted by id.
    pub fn documents(&self, collection: &str) -> Vec<(String, serde_json::Value)> {
        let mut documents: Vec<_> = self
            .documents
            .lock()
            .iter()
            .filter(|((coll, _), _)| coll == collection)
            .map(|((_, id), doc)| (id.clone(), doc.value.clone()))
            .collect();
        documents.sort_by(|a, b| a.0.cmp(&b.0));
        documents
    }

    fn take_injected_conflict(&self, collection: &str) -> bool {
        if let Some(pending) = self.collection_conflicts.lock().get_mut(collection)
            && *pending > 0
        {
            *pending -= 1;
            return true;
        }
        self.pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |pending| {
                pending.checked_sub(1)
            })
            .is_ok()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<VersionedDocument>, StoreError> {
        Ok(self
            .documents
            .lock()
            .get(&(collection.to_string(), id.to_string()))
            .cloned())
    }

    async fn list(
        &self,
        collection: &str,
    ) -> Result<Vec<(String, VersionedDocument)>, StoreError> {
        Ok(self
            .documents
            .lock()
            .iter()
            .filter(|((coll, _), _)| coll == collection)
            .map(|((_, id), doc)| (id.clone(), doc.clone()))
            .collect())
    }

    async fn commit(
        &self,
        collection: &str,
        id: &str,
        expected_version: u64,
        value: serde_json::Value,
    ) -> Result<u64, StoreError> {
        let mut documents = self.documents.lock();
        let key = (collection.to_string(), id.to_string());
        let actual = documents.get(&key).map(|doc| doc.version).unwrap_or(0);
        if actual != expected_version || self.take_injected_conflict(collection) {
            return Err(StoreError::Conflict {
                collection: collection.to_string(),
                id: id.to_string(),
                expected: expected_version,
                actual,
            });
        }
        let version = actual + 1;
        documents.insert(key, VersionedDocument { version, value });
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(version)
    }
}
