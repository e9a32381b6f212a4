pub mod blob;
pub mod cli;
pub mod docstore;
pub mod error;
pub mod logging;
pub mod media;
pub mod metrics;
pub mod prayer;
pub mod settings;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::info;

use crate::{
    blob::{BlobStore, HttpBlobStore},
    docstore::DocumentStore,
    media::{CacheStore, EvictionPolicy, MediaFetcher, MediaUploader},
    prayer::PrayerRecorder,
    settings::Settings,
};

/// Media cache runtime: the fetcher, the uploader and the background tasks
/// that maintain the cache directory. Background tasks stop on
/// [`MediaServices::shutdown`] or when the value is dropped.
pub struct MediaServices {
    fetcher: MediaFetcher,
    uploader: MediaUploader,
    background: Vec<JoinHandle<()>>,
}

impl MediaServices {
    /// Opens the cache directory and starts layout cleanup and the
    /// scheduled eviction sweeper.
    pub async fn start(settings: &Settings, blobs: Arc<dyn BlobStore>) -> Result<Self> {
        let (store, cleanup_dirs) = CacheStore::open(&settings.cache_dir)
            .await
            .with_context(|| {
                format!("failed to open media cache at {}", settings.cache_dir.display())
            })?;
        let fetcher = MediaFetcher::new(
            store,
            EvictionPolicy::new(settings.cache_max_bytes),
            Arc::clone(&blobs),
        );

        let mut background = media::spawn_cache_dir_cleanup(cleanup_dirs);
        background.extend(media::spawn_eviction_sweeper(
            fetcher.clone(),
            settings.eviction_interval(),
        ));
        info!(
            cache_dir = %fetcher.store().disk_dir().display(),
            max_cache_bytes = settings.cache_max_bytes,
            eviction_interval_secs = settings.eviction_interval,
            "media cache ready"
        );

        Ok(Self {
            fetcher,
            uploader: MediaUploader::new(blobs),
            background,
        })
    }

    /// Starts against the HTTP blob store described by `settings`.
    pub async fn start_http(settings: &Settings) -> Result<Self> {
        let blobs = HttpBlobStore::new(
            settings.download_connect_timeout(),
            settings.download_timeout(),
            settings.blob_base_url()?,
        )
        .context("failed to build blob store client")?;
        Self::start(settings, Arc::new(blobs)).await
    }

    pub fn fetcher(&self) -> &MediaFetcher {
        &self.fetcher
    }

    pub fn uploader(&self) -> &MediaUploader {
        &self.uploader
    }

    /// Serves metrics on `addr` for the lifetime of these services.
    pub fn serve_metrics(&mut self, addr: SocketAddr, path: String) {
        self.background.push(tokio::spawn(async move {
            if let Err(err) = crate::metrics::serve(addr, path).await {
                tracing::error!(error = %err, "metrics endpoint failed");
            }
        }));
    }

    /// Stops the background tasks, then waits for eviction passes that
    /// finished downloads started, so the cap holds once this returns.
    pub async fn shutdown(mut self) {
        for handle in self.background.drain(..) {
            handle.abort();
            let _ = handle.await;
        }
        self.fetcher.settle_evictions().await;
        info!("media services stopped");
    }
}

impl Drop for MediaServices {
    fn drop(&mut self) {
        for handle in &self.background {
            handle.abort();
        }
    }
}

/// Prayer tally runtime bound to a document store.
#[derive(Clone)]
pub struct PrayerServices {
    recorder: PrayerRecorder,
}

impl PrayerServices {
    pub fn new(settings: &Settings, documents: Arc<dyn DocumentStore>) -> Self {
        Self {
            recorder: PrayerRecorder::new(
                documents,
                settings.shard_count,
                settings.top_k,
                settings.retry_policy(),
            ),
        }
    }

    pub fn recorder(&self) -> &PrayerRecorder {
        &self.recorder
    }
}

/// Long-running mode: scheduled eviction plus the optional metrics endpoint,
/// until Ctrl-C.
pub async fn run(settings: Settings) -> Result<()> {
    let mut services = MediaServices::start_http(&settings).await?;
    if let Some(addr) = settings.metrics_listen {
        services.serve_metrics(addr, settings.metrics_path.clone());
    }
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");
    services.shutdown().await;
    Ok(())
}
