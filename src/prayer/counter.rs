use std::sync::Arc;

use futures::future::try_join_all;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::docstore::{DocumentStore, RetryPolicy, StoreError, read_modify_write};
use crate::error::TallyError;

pub const COUNTER_COLLECTION: &str = "prayer_counters";

/// One shard of a counter. The logical count is the sum over all shards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardCounter {
    pub counter_id: String,
    pub shard_id: u32,
    pub count: u64,
}

/// Counter split over `shard_count` documents so concurrent increments
/// from many devices rarely contend on the same document.
#[derive(Clone)]
pub struct ShardedCounter {
    store: Arc<dyn DocumentStore>,
    shard_count: u32,
    retry: RetryPolicy,
}

impl ShardedCounter {
    pub fn new(store: Arc<dyn DocumentStore>, shard_count: u32, retry: RetryPolicy) -> Self {
        Self {
            store,
            shard_count: shard_count.max(1),
            retry,
        }
    }

    /// Adds one to a randomly chosen shard and returns that shard.
    pub async fn increment(&self, counter_id: &str) -> Result<ShardCounter, TallyError> {
        let shard_id = rand::rng().random_range(0..self.shard_count);
        self.increment_shard(counter_id, shard_id).await
    }

    pub(crate) async fn increment_shard(
        &self,
        counter_id: &str,
        shard_id: u32,
    ) -> Result<ShardCounter, TallyError> {
        validate_counter_id(counter_id)?;
        let doc_id = shard_doc_id(counter_id, shard_id);
        let committed = read_modify_write(
            self.store.as_ref(),
            COUNTER_COLLECTION,
            &doc_id,
            self.retry,
            "counter",
            |current: Option<ShardCounter>| match current {
                Some(mut shard) => {
                    shard.count += 1;
                    shard
                }
                None => ShardCounter {
                    counter_id: counter_id.to_string(),
                    shard_id,
                    count: 1,
                },
            },
        )
        .await
        .map_err(|err| TallyError::CounterWriteFailed {
            counter_id: counter_id.to_string(),
            attempts: err.attempts(),
            reason: err.to_string(),
        })?;
        trace!(counter_id, shard_id, count = committed.value.count, "counter shard incremented");
        Ok(committed.value)
    }

    /// Sums every shard. Shards that were never written count as zero.
    /// Reads are not a snapshot, so the sum may trail concurrent writes.
    pub async fn read(&self, counter_id: &str) -> Result<u64, TallyError> {
        validate_counter_id(counter_id)?;
        let reads = (0..self.shard_count).map(|shard_id| {
            let doc_id = shard_doc_id(counter_id, shard_id);
            async move {
                let Some(doc) = self.store.get(COUNTER_COLLECTION, &doc_id).await? else {
                    return Ok::<u64, StoreError>(0);
                };
                let shard: ShardCounter =
                    serde_json::from_value(doc.value).map_err(|err| StoreError::Serialization {
                        collection: COUNTER_COLLECTION.to_string(),
                        id: doc_id.clone(),
                        reason: err.to_string(),
                    })?;
                Ok(shard.count)
            }
        });
        let counts = try_join_all(reads).await?;
        Ok(counts.into_iter().sum())
    }
}

fn shard_doc_id(counter_id: &str, shard_id: u32) -> String {
    format!("{counter_id}/{shard_id}")
}

fn validate_counter_id(counter_id: &str) -> Result<(), TallyError> {
    if counter_id.is_empty() || counter_id.contains('/') {
        return Err(TallyError::InvalidId(counter_id.to_string()));
    }
    Ok(())
}
