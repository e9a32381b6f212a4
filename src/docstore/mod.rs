//! Boundary to the transactional document store that holds counter shards,
//! user stats and prayer records.

use async_trait::async_trait;
use thiserror::Error;

mod memory;
mod transaction;

pub use memory::MemoryDocumentStore;
pub use transaction::{Committed, RetryPolicy, TransactionError, read_modify_write, update_existing};

/// A stored document together with its version. Version 0 never appears on
/// a stored document; committing against version 0 means "create".
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedDocument {
    pub version: u64,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("write conflict on {collection}/{id}: expected version {expected}, found {actual}")]
    Conflict {
        collection: String,
        id: String,
        expected: u64,
        actual: u64,
    },
    #[error("document {collection}/{id} could not be (de)serialized: {reason}")]
    Serialization {
        collection: String,
        id: String,
        reason: String,
    },
    #[error("document store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Keyed documents with compare-and-set writes.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str)
    -> Result<Option<VersionedDocument>, StoreError>;

    /// Every document of `collection` with its id, in no particular order.
    async fn list(&self, collection: &str)
    -> Result<Vec<(String, VersionedDocument)>, StoreError>;

    /// Writes `value` if the stored version still equals `expected_version`
    /// and returns the new version. Otherwise fails with
    /// [`StoreError::Conflict`].
    async fn commit(
        &self,
        collection: &str,
        id: &str,
        expected_version: u64,
        value: serde_json::Value,
    ) -> Result<u64, StoreError>;
}
