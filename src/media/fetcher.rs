use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use url::Url;

use super::entry::CacheEntry;
use super::eviction::{EvictionPolicy, EvictionReport};
use super::key::{CacheKey, KeyResolver, Owner};
use super::store::CacheStore;
use crate::blob::{BlobStore, redacted_url};
use crate::error::MediaError;
use crate::logging::FetchLogBuilder;

type SharedFetch = Shared<BoxFuture<'static, Result<CacheEntry, MediaError>>>;

/// Snapshot of the cache footprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheUsage {
    pub entries: usize,
    pub total_bytes: u64,
    pub max_cache_bytes: u64,
}

/// Resolves media URLs to local files, downloading on a miss.
///
/// Downloads run as detached tasks, one per cache key. A caller that misses
/// while a download for the same key is running joins it instead of starting
/// another, so every caller for that key sees the same path or the same
/// error. Dropping a caller's future does not cancel the download.
///
/// Cloning is cheap; clones share the in-flight table.
#[derive(Clone)]
pub struct MediaFetcher {
    inner: Arc<FetcherInner>,
}

struct FetcherInner {
    resolver: KeyResolver,
    store: CacheStore,
    eviction: EvictionPolicy,
    blobs: Arc<dyn BlobStore>,
    in_flight: Mutex<HashMap<String, SharedFetch>>,
    eviction_lock: tokio::sync::Mutex<()>,
    last_published: Mutex<Option<String>>,
    pending_evictions: Mutex<JoinSet<()>>,
}

/// Releases the in-flight slot when the download task ends, including when
/// it panics or is aborted.
struct InFlightGuard {
    inner: Arc<FetcherInner>,
    entry_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight.lock().remove(&self.entry_id);
    }
}

impl MediaFetcher {
    pub fn new(store: CacheStore, eviction: EvictionPolicy, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            inner: Arc::new(FetcherInner {
                resolver: KeyResolver::new(),
                store,
                eviction,
                blobs,
                in_flight: Mutex::new(HashMap::new()),
                eviction_lock: tokio::sync::Mutex::new(()),
                last_published: Mutex::new(None),
                pending_evictions: Mutex::new(JoinSet::new()),
            }),
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.inner.store
    }

    /// Returns the local path for `raw_url`, downloading it on a miss.
    pub async fn fetch(&self, raw_url: &str) -> Result<PathBuf, MediaError> {
        let started = Instant::now();
        let url = match KeyResolver::parse(raw_url) {
            Ok(url) => url,
            Err(err) => {
                crate::metrics::record_cache_lookup("malformed");
                FetchLogBuilder::new(raw_url)
                    .outcome("failed")
                    .error(err.kind(), err.to_string())
                    .elapsed(started.elapsed())
                    .log();
                return Err(err);
            }
        };
        let key = self.inner.resolver.resolve_or_unaffiliated(&url);
        let log = FetchLogBuilder::new(redacted_url(&url))
            .key(key.entry_id())
            .owner(key.owner().to_string())
            .media_type(key.media_type().dir_name());

        if let Some(entry) = self.inner.store.lookup(&key).await {
            crate::metrics::record_cache_lookup("hit");
            log.outcome("hit")
                .bytes(entry.size_bytes)
                .elapsed(started.elapsed())
                .log();
            return Ok(entry.local_path);
        }
        crate::metrics::record_cache_lookup("miss");

        let (download, joined) = self.join_or_start(url, key);
        if joined {
            crate::metrics::record_coalesced_fetch();
        }
        match download.await {
            Ok(entry) => {
                log.outcome(if joined { "coalesced" } else { "miss" })
                    .bytes(entry.size_bytes)
                    .elapsed(started.elapsed())
                    .log();
                Ok(entry.local_path)
            }
            Err(err) => {
                log.outcome("failed")
                    .error(err.kind(), err.to_string())
                    .elapsed(started.elapsed())
                    .log();
                Err(err)
            }
        }
    }

    /// Returns the cached path without touching the network.
    pub async fn cached(&self, raw_url: &str) -> Result<Option<PathBuf>, MediaError> {
        let url = KeyResolver::parse(raw_url)?;
        let key = self.inner.resolver.resolve_or_unaffiliated(&url);
        Ok(self
            .inner
            .store
            .lookup(&key)
            .await
            .map(|entry| entry.local_path))
    }

    /// Drops the cached copy of one URL. Returns whether a file was removed.
    pub async fn invalidate(&self, raw_url: &str) -> Result<bool, MediaError> {
        let url = KeyResolver::parse(raw_url)?;
        let key = self.inner.resolver.resolve_or_unaffiliated(&url);
        self.inner.store.remove(&key).await
    }

    /// Drops all cached media of an owning entity, e.g. after it was deleted.
    pub async fn invalidate_owner(&self, owner_id: &str) -> Result<usize, MediaError> {
        let owner = Owner::entity(owner_id)?;
        self.inner.store.remove_all_for_owner(&owner).await
    }

    /// Runs an eviction pass now and waits for it.
    pub async fn evict_now(&self) -> Result<EvictionReport, MediaError> {
        self.inner.run_eviction(None).await
    }

    /// Waits for the eviction passes started by finished downloads. Passes
    /// started while waiting are awaited too.
    pub async fn settle_evictions(&self) {
        loop {
            let mut pending = std::mem::take(&mut *self.inner.pending_evictions.lock());
            if pending.is_empty() {
                return;
            }
            while let Some(joined) = pending.join_next().await {
                if let Err(err) = joined {
                    warn!(error = %err, "eviction task ended abnormally");
                }
            }
        }
    }

    pub async fn usage(&self) -> Result<CacheUsage, MediaError> {
        let entries = self.inner.store.entries().await?;
        Ok(CacheUsage {
            entries: entries.len(),
            total_bytes: entries.iter().map(|entry| entry.size_bytes).sum(),
            max_cache_bytes: self.inner.eviction.max_cache_bytes(),
        })
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.lock().len()
    }

    fn join_or_start(&self, url: Url, key: CacheKey) -> (SharedFetch, bool) {
        let mut in_flight = self.inner.in_flight.lock();
        if let Some(existing) = in_flight.get(key.entry_id()) {
            return (existing.clone(), true);
        }

        let entry_id = key.entry_id().to_string();
        let guard = InFlightGuard {
            inner: Arc::clone(&self.inner),
            entry_id: entry_id.clone(),
        };
        let inner = Arc::clone(&self.inner);
        let source = redacted_url(&url);
        let task = tokio::spawn(async move {
            let result = inner.download(&url, &key).await;
            if let Ok(entry) = &result {
                *inner.last_published.lock() = Some(entry.entry_id().to_string());
            }
            drop(guard);
            if let Ok(entry) = &result {
                inner.spawn_eviction(entry.entry_id().to_string());
            }
            result
        });

        let download = async move {
            match task.await {
                Ok(result) => result,
                Err(err) => Err(MediaError::download(
                    source,
                    format!("download task ended abnormally: {err}"),
                )),
            }
        }
        .boxed()
        .shared();
        in_flight.insert(entry_id, download.clone());
        (download, false)
    }
}

impl FetcherInner {
    async fn download(&self, url: &Url, key: &CacheKey) -> Result<CacheEntry, MediaError> {
        // A download for this key may have published between the caller's
        // lookup and this task taking the in-flight slot.
        if let Some(entry) = self.store.lookup(key).await {
            return Ok(entry);
        }

        let source_url = redacted_url(url);
        let source = match self.blobs.get(url).await {
            Ok(source) => source,
            Err(err) => {
                crate::metrics::record_download("failed");
                return Err(MediaError::download(source_url, err));
            }
        };
        match self.store.put(key, &source_url, source).await {
            Ok(entry) => {
                crate::metrics::record_download("ok");
                debug!(key = %key, bytes = entry.size_bytes, "media downloaded");
                Ok(entry)
            }
            Err(err) => {
                crate::metrics::record_download("failed");
                Err(err)
            }
        }
    }

    fn is_pinned(&self, entry_id: &str) -> bool {
        if self.in_flight.lock().contains_key(entry_id) {
            return true;
        }
        self.last_published.lock().as_deref() == Some(entry_id)
    }

    /// `published` stays pinned for this pass even if another download has
    /// published since.
    async fn run_eviction(&self, published: Option<&str>) -> Result<EvictionReport, MediaError> {
        let _pass = self.eviction_lock.lock().await;
        self.eviction
            .enforce(&self.store, |entry_id| {
                published == Some(entry_id) || self.is_pinned(entry_id)
            })
            .await
    }

    fn spawn_eviction(self: &Arc<Self>, published: String) {
        let inner = Arc::clone(self);
        let mut pending = self.pending_evictions.lock();
        while pending.try_join_next().is_some() {}
        pending.spawn(async move {
            if let Err(err) = inner.run_eviction(Some(&published)).await {
                warn!(error = %err, "eviction after download failed");
            }
        });
    }
}
