//! Prayer tallies: sharded per-target counters, per-user summaries and the
//! prayer records themselves.

use std::sync::Arc;

use tracing::warn;

use crate::docstore::{DocumentStore, RetryPolicy};
use crate::error::TallyError;

mod counter;
mod records;
mod stats;

pub use counter::{COUNTER_COLLECTION, ShardCounter, ShardedCounter};
pub use records::{
    DEFAULT_LIST_LIMIT, PRAYER_COLLECTION, PrayerBook, PrayerDraft, PrayerRecord, PrayerReport,
};
pub use stats::{STATS_COLLECTION, StatsAggregator, TargetCount, UserStats};

/// Outcome of one recorded prayer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrayerReceipt {
    pub shard: ShardCounter,
    pub stats: UserStats,
}

/// A stored prayer together with the tally it produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferedPrayer {
    pub prayer: PrayerRecord,
    pub receipt: PrayerReceipt,
}

/// Records a prayer as one logical operation: the target's counter first,
/// then the user's summary.
#[derive(Clone)]
pub struct PrayerRecorder {
    counter: ShardedCounter,
    stats: StatsAggregator,
    book: PrayerBook,
}

impl PrayerRecorder {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        shard_count: u32,
        top_k: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            counter: ShardedCounter::new(Arc::clone(&store), shard_count, retry),
            stats: StatsAggregator::new(Arc::clone(&store), top_k, retry),
            book: PrayerBook::new(store, retry),
        }
    }

    pub fn stats(&self) -> &StatsAggregator {
        &self.stats
    }

    pub fn book(&self) -> &PrayerBook {
        &self.book
    }

    /// Stores the prayer, then tallies it with [`PrayerRecorder::record`].
    /// A record that cannot be stored is not counted.
    pub async fn offer(&self, draft: PrayerDraft) -> Result<OfferedPrayer, TallyError> {
        let prayer = self.book.add(draft).await?;
        let receipt = self.record(&prayer.user_id, &prayer.target_id).await?;
        Ok(OfferedPrayer { prayer, receipt })
    }

    /// A counter failure aborts before the stats update. A stats failure
    /// after the counter was incremented is returned as is; the counter is
    /// not rolled back.
    pub async fn record(&self, user_id: &str, target_id: &str) -> Result<PrayerReceipt, TallyError> {
        let shard = self.counter.increment(target_id).await?;
        let stats = match self.stats.record_event(user_id, target_id).await {
            Ok(stats) => stats,
            Err(err) => {
                warn!(user_id, target_id, error = %err, "prayer counted but user stats not updated");
                return Err(err);
            }
        };
        Ok(PrayerReceipt { shard, stats })
    }

    pub async fn count(&self, target_id: &str) -> Result<u64, TallyError> {
        self.counter.read(target_id).await
    }
}
