use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, warn};

use super::{DocumentStore, StoreError};

const MAX_BACKOFF_DOUBLINGS: u32 = 6;

/// Bounded retry of optimistic transactions. Delays double per attempt
/// from `base_backoff`, with up to one `base_backoff` of random jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(20),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_backoff,
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(MAX_BACKOFF_DOUBLINGS);
        let base = self.base_backoff.saturating_mul(1u32 << doublings);
        let jitter_ceiling = self.base_backoff.as_millis() as u64;
        let jitter = if jitter_ceiling == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ceiling)
        };
        base + Duration::from_millis(jitter)
    }
}

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("transaction gave up after {attempts} conflicting attempt(s)")]
    RetriesExhausted { attempts: u32 },
    #[error("document to update does not exist")]
    Missing { attempts: u32 },
    #[error("transaction failed on attempt {attempts}: {source}")]
    Store {
        attempts: u32,
        #[source]
        source: StoreError,
    },
}

impl TransactionError {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::RetriesExhausted { attempts }
            | Self::Missing { attempts }
            | Self::Store { attempts, .. } => *attempts,
        }
    }
}

/// Result of a committed transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct Committed<T> {
    pub value: T,
    pub version: u64,
    pub attempts: u32,
}

/// Reads the document, applies `update` and commits against the version
/// that was read. A conflict re-reads and re-applies `update`, so it must
/// be a pure function of the value it is given. `kind` labels metrics.
pub async fn read_modify_write<T, F>(
    store: &dyn DocumentStore,
    collection: &str,
    id: &str,
    policy: RetryPolicy,
    kind: &'static str,
    mut update: F,
) -> Result<Committed<T>, TransactionError>
where
    T: Serialize + DeserializeOwned + Send,
    F: FnMut(Option<T>) -> T + Send,
{
    transact(store, collection, id, policy, kind, |current| Some(update(current))).await
}

/// Like [`read_modify_write`] for a document that must already exist.
/// A missing document fails with [`TransactionError::Missing`] and nothing
/// is written.
pub async fn update_existing<T, F>(
    store: &dyn DocumentStore,
    collection: &str,
    id: &str,
    policy: RetryPolicy,
    kind: &'static str,
    mut update: F,
) -> Result<Committed<T>, TransactionError>
where
    T: Serialize + DeserializeOwned + Send,
    F: FnMut(T) -> T + Send,
{
    transact(store, collection, id, policy, kind, |current| current.map(&mut update)).await
}

/// `update` returning `None` aborts without writing.
async fn transact<T, F>(
    store: &dyn DocumentStore,
    collection: &str,
    id: &str,
    policy: RetryPolicy,
    kind: &'static str,
    mut update: F,
) -> Result<Committed<T>, TransactionError>
where
    T: Serialize + DeserializeOwned + Send,
    F: FnMut(Option<T>) -> Option<T> + Send,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let store_error = |source| TransactionError::Store {
            attempts: attempt,
            source,
        };

        let current = store.get(collection, id).await.map_err(store_error)?;
        let (version, value) = match current {
            Some(doc) => {
                let value = serde_json::from_value(doc.value)
                    .map_err(|err| store_error(serialization(collection, id, err)))?;
                (doc.version, Some(value))
            }
            None => (0, None),
        };
        let Some(next) = update(value) else {
            return Err(TransactionError::Missing { attempts: attempt });
        };
        let encoded = serde_json::to_value(&next)
            .map_err(|err| store_error(serialization(collection, id, err)))?;

        match store.commit(collection, id, version, encoded).await {
            Ok(version) => {
                crate::metrics::record_transaction_commit(kind);
                return Ok(Committed {
                    value: next,
                    version,
                    attempts: attempt,
                });
            }
            Err(err) if err.is_conflict() => {
                crate::metrics::record_transaction_conflict(kind);
                if attempt >= max_attempts {
                    crate::metrics::record_transaction_exhausted(kind);
                    warn!(collection, id, attempts = attempt, "transaction retries exhausted");
                    return Err(TransactionError::RetriesExhausted { attempts: attempt });
                }
                let delay = policy.backoff(attempt);
                debug!(collection, id, attempt, delay_ms = delay.as_millis() as u64, "write conflict, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(store_error(err)),
        }
    }
}

fn serialization(collection: &str, id: &str, err: serde_json::Error) -> StoreError {
    StoreError::Serialization {
        collection: collection.to_string(),
        id: id.to_string(),
        reason: err.to_string(),
    }
}
