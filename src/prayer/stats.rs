use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;

use crate::docstore::{DocumentStore, RetryPolicy, StoreError, read_modify_write};
use crate::error::TallyError;

pub const STATS_COLLECTION: &str = "user_prayer_stats";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetCount {
    pub target_id: String,
    pub count: u64,
}

/// Rolling prayer summary of one user.
///
/// `top_targets` is sorted by descending count and holds at most K entries.
/// Among equal counts the most recently prayed target comes first. Counts of
/// targets that fell out of the list are not kept, so a target that comes
/// back restarts at one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
    pub user_id: String,
    pub total_events: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_event_at: OffsetDateTime,
    pub top_targets: Vec<TargetCount>,
    #[serde(default)]
    pub visited_targets: BTreeSet<String>,
}

impl UserStats {
    fn first(user_id: &str, target_id: &str, at: OffsetDateTime) -> Self {
        Self {
            user_id: user_id.to_string(),
            total_events: 1,
            last_event_at: at,
            top_targets: vec![TargetCount {
                target_id: target_id.to_string(),
                count: 1,
            }],
            visited_targets: BTreeSet::from([target_id.to_string()]),
        }
    }

    fn apply(&mut self, target_id: &str, at: OffsetDateTime, top_k: usize) {
        self.total_events += 1;
        self.last_event_at = at;
        self.visited_targets.insert(target_id.to_string());

        let touched = match self
            .top_targets
            .iter()
            .position(|entry| entry.target_id == target_id)
        {
            Some(index) => {
                let mut entry = self.top_targets.remove(index);
                entry.count += 1;
                entry
            }
            None => TargetCount {
                target_id: target_id.to_string(),
                count: 1,
            },
        };
        self.top_targets.insert(0, touched);
        // Stable, so the entry just touched leads its count group.
        self.top_targets.sort_by(|a, b| b.count.cmp(&a.count));
        self.top_targets.truncate(top_k);
    }

    /// Number of distinct targets this user has prayed at.
    pub fn unique_targets(&self) -> usize {
        self.visited_targets.len()
    }
}

/// Maintains [`UserStats`] documents with transactional updates.
#[derive(Clone)]
pub struct StatsAggregator {
    store: Arc<dyn DocumentStore>,
    top_k: usize,
    retry: RetryPolicy,
}

impl StatsAggregator {
    pub fn new(store: Arc<dyn DocumentStore>, top_k: usize, retry: RetryPolicy) -> Self {
        Self {
            store,
            top_k: top_k.max(1),
            retry,
        }
    }

    pub async fn record_event(
        &self,
        user_id: &str,
        target_id: &str,
    ) -> Result<UserStats, TallyError> {
        self.record_event_at(user_id, target_id, OffsetDateTime::now_utc())
            .await
    }

    pub async fn record_event_at(
        &self,
        user_id: &str,
        target_id: &str,
        at: OffsetDateTime,
    ) -> Result<UserStats, TallyError> {
        validate_id(user_id)?;
        validate_id(target_id)?;
        let top_k = self.top_k;
        let committed = read_modify_write(
            self.store.as_ref(),
            STATS_COLLECTION,
            user_id,
            self.retry,
            "stats",
            |current: Option<UserStats>| match current {
                Some(mut stats) => {
                    stats.apply(target_id, at, top_k);
                    stats
                }
                None => UserStats::first(user_id, target_id, at),
            },
        )
        .await
        .map_err(|err| TallyError::StatsWriteFailed {
            user_id: user_id.to_string(),
            attempts: err.attempts(),
            reason: err.to_string(),
        })?;
        debug!(
            user_id,
            target_id,
            total_events = committed.value.total_events,
            attempts = committed.attempts,
            "user stats updated"
        );
        Ok(committed.value)
    }

    pub async fn get(&self, user_id: &str) -> Result<Option<UserStats>, TallyError> {
        validate_id(user_id)?;
        let Some(doc) = self.store.get(STATS_COLLECTION, user_id).await? else {
            return Ok(None);
        };
        let stats = serde_json::from_value(doc.value).map_err(|err| StoreError::Serialization {
            collection: STATS_COLLECTION.to_string(),
            id: user_id.to_string(),
            reason: err.to_string(),
        })?;
        Ok(Some(stats))
    }
}

pub(super) fn validate_id(id: &str) -> Result<(), TallyError> {
    if id.is_empty() || id.contains('/') {
        return Err(TallyError::InvalidId(id.to_string()));
    }
    Ok(())
}
