use std::cmp::Reverse;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use super::stats::validate_id;
use crate::docstore::{DocumentStore, RetryPolicy, TransactionError, update_existing};
use crate::error::TallyError;

pub const PRAYER_COLLECTION: &str = "prayers";
pub const DEFAULT_LIST_LIMIT: usize = 50;
const ANONYMOUS: &str = "Anonymous";

/// A prayer as written by a user at a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrayerDraft {
    pub target_id: String,
    pub user_id: String,
    pub user_name: Option<String>,
    pub text: String,
    pub is_private: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrayerReport {
    pub reporter_id: String,
    pub reason: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Stored prayer. Reports live inside the record so that adding one and
/// bumping `report_count` commit together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrayerRecord {
    pub id: String,
    pub target_id: String,
    pub user_id: String,
    pub user_name: String,
    pub text: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub is_private: bool,
    pub is_reported: bool,
    pub report_count: u64,
    #[serde(default)]
    pub reports: Vec<PrayerReport>,
}

/// Prayer records in the document store.
#[derive(Clone)]
pub struct PrayerBook {
    store: Arc<dyn DocumentStore>,
    retry: RetryPolicy,
}

impl PrayerBook {
    pub fn new(store: Arc<dyn DocumentStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub async fn add(&self, draft: PrayerDraft) -> Result<PrayerRecord, TallyError> {
        self.add_at(draft, OffsetDateTime::now_utc()).await
    }

    pub async fn add_at(
        &self,
        draft: PrayerDraft,
        at: OffsetDateTime,
    ) -> Result<PrayerRecord, TallyError> {
        validate_id(&draft.user_id)?;
        validate_id(&draft.target_id)?;
        let user_name = draft
            .user_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| ANONYMOUS.to_string());
        let record = PrayerRecord {
            id: uuid::Uuid::new_v4().simple().to_string(),
            target_id: draft.target_id,
            user_id: draft.user_id,
            user_name,
            text: draft.text,
            created_at: at,
            is_private: draft.is_private,
            is_reported: false,
            report_count: 0,
            reports: Vec::new(),
        };

        let write_failed = |reason: String| TallyError::PrayerWriteFailed {
            prayer_id: record.id.clone(),
            attempts: 1,
            reason,
        };
        let value = serde_json::to_value(&record).map_err(|err| write_failed(err.to_string()))?;
        self.store
            .commit(PRAYER_COLLECTION, &record.id, 0, value)
            .await
            .map_err(|err| write_failed(err.to_string()))?;
        crate::metrics::record_transaction_commit("prayer");
        debug!(
            prayer_id = %record.id,
            target_id = %record.target_id,
            is_private = record.is_private,
            "prayer stored"
        );
        Ok(record)
    }

    pub async fn get(&self, prayer_id: &str) -> Result<Option<PrayerRecord>, TallyError> {
        validate_id(prayer_id)?;
        let Some(doc) = self.store.get(PRAYER_COLLECTION, prayer_id).await? else {
            return Ok(None);
        };
        let record = serde_json::from_value(doc.value).map_err(|err| {
            crate::docstore::StoreError::Serialization {
                collection: PRAYER_COLLECTION.to_string(),
                id: prayer_id.to_string(),
                reason: err.to_string(),
            }
        })?;
        Ok(Some(record))
    }

    /// Public prayers at `target_id`, newest first, at most `limit`.
    pub async fn list_for_target(
        &self,
        target_id: &str,
        limit: usize,
    ) -> Result<Vec<PrayerRecord>, TallyError> {
        validate_id(target_id)?;
        let mut prayers: Vec<PrayerRecord> = self
            .store
            .list(PRAYER_COLLECTION)
            .await?
            .into_iter()
            .filter_map(|(id, doc)| match serde_json::from_value::<PrayerRecord>(doc.value) {
                Ok(record) => Some(record),
                Err(err) => {
                    warn!(prayer_id = %id, error = %err, "skipping undecodable prayer");
                    None
                }
            })
            .filter(|record| record.target_id == target_id && !record.is_private)
            .collect();
        prayers.sort_by_key(|record| (Reverse(record.created_at), record.id.clone()));
        prayers.truncate(limit);
        Ok(prayers)
    }

    /// Adds a report to a prayer and marks it reported.
    pub async fn report(
        &self,
        prayer_id: &str,
        reporter_id: &str,
        reason: &str,
    ) -> Result<PrayerRecord, TallyError> {
        validate_id(prayer_id)?;
        validate_id(reporter_id)?;
        let report = PrayerReport {
            reporter_id: reporter_id.to_string(),
            reason: reason.to_string(),
            created_at: OffsetDateTime::now_utc(),
        };
        let committed = update_existing(
            self.store.as_ref(),
            PRAYER_COLLECTION,
            prayer_id,
            self.retry,
            "report",
            |mut record: PrayerRecord| {
                record.reports.push(report.clone());
                record.report_count += 1;
                record.is_reported = true;
                record
            },
        )
        .await
        .map_err(|err| match err {
            TransactionError::Missing { .. } => TallyError::PrayerNotFound(prayer_id.to_string()),
            err => TallyError::PrayerWriteFailed {
                prayer_id: prayer_id.to_string(),
                attempts: err.attempts(),
                reason: err.to_string(),
            },
        })?;
        info!(
            prayer_id,
            report_count = committed.value.report_count,
            "prayer reported"
        );
        Ok(committed.value)
    }
}
