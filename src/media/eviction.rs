use tracing::{info, trace, warn};

use super::entry::CacheEntry;
use super::store::CacheStore;
use crate::error::MediaError;

/// Least-recently-used eviction down to a byte cap.
#[derive(Debug, Clone, Copy)]
pub struct EvictionPolicy {
    max_cache_bytes: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EvictionReport {
    pub inspected: usize,
    pub evicted: usize,
    pub bytes_freed: u64,
    pub remaining_bytes: u64,
    pub skipped_pinned: usize,
    pub failures: usize,
}

impl EvictionPolicy {
    pub fn new(max_cache_bytes: u64) -> Self {
        Self { max_cache_bytes }
    }

    pub fn max_cache_bytes(&self) -> u64 {
        self.max_cache_bytes
    }

    /// Oldest access first; equal access times fall back to entry id order.
    pub fn eviction_order(mut entries: Vec<CacheEntry>) -> Vec<CacheEntry> {
        entries.sort_by(|a, b| {
            a.last_accessed_at
                .cmp(&b.last_accessed_at)
                .then_with(|| a.entry_id().cmp(b.entry_id()))
        });
        entries
    }

    /// Deletes entries oldest-first until the cache fits the cap. Entries
    /// for which `is_pinned` returns true are left alone. A failed delete is
    /// logged and the pass moves on to the next candidate.
    pub async fn enforce<F>(
        &self,
        store: &CacheStore,
        is_pinned: F,
    ) -> Result<EvictionReport, MediaError>
    where
        F: Fn(&str) -> bool,
    {
        let entries = store.entries().await?;
        let mut report = EvictionReport {
            inspected: entries.len(),
            ..EvictionReport::default()
        };
        let mut total: u64 = entries.iter().map(|entry| entry.size_bytes).sum();
        crate::metrics::record_eviction_pass();

        if total <= self.max_cache_bytes {
            report.remaining_bytes = total;
            return Ok(report);
        }

        for entry in Self::eviction_order(entries) {
            if total <= self.max_cache_bytes {
                break;
            }
            if is_pinned(entry.entry_id()) {
                report.skipped_pinned += 1;
                continue;
            }
            match store.remove(&entry.key).await {
                Ok(removed) => {
                    total = total.saturating_sub(entry.size_bytes);
                    if removed {
                        report.evicted += 1;
                        report.bytes_freed += entry.size_bytes;
                        crate::metrics::record_cache_eviction(entry.size_bytes);
                        trace!(key = %entry.key, bytes = entry.size_bytes, "evicted cache entry");
                    }
                }
                Err(err) => {
                    report.failures += 1;
                    crate::metrics::record_cache_eviction_failure();
                    warn!(error = %err, key = %entry.key, "failed to evict cache entry");
                }
            }
        }

        report.remaining_bytes = total;
        if report.evicted > 0 {
            info!(
                evicted = report.evicted,
                bytes_freed = report.bytes_freed,
                remaining_bytes = report.remaining_bytes,
                max_cache_bytes = self.max_cache_bytes,
                "evicted least recently used media"
            );
        }
        if total > self.max_cache_bytes {
            warn!(
                remaining_bytes = total,
                max_cache_bytes = self.max_cache_bytes,
                skipped_pinned = report.skipped_pinned,
                failures = report.failures,
                "cache remains over its cap after eviction"
            );
        }
        Ok(report)
    }
}
