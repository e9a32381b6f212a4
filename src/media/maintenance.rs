//! Layout versioning of the cache root and the background upkeep tasks.
//!
//! The cache root holds one directory per layout version (`v1`, ...). Only
//! the current version is used; directories of other versions are renamed
//! to `retired-*` on open and deleted in the background.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs as async_fs;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::fetcher::MediaFetcher;

const LAYOUT_VERSION: u32 = 1;
const RETIRED_PREFIX: &str = "retired-";

pub(super) const STAGING_DIR: &str = ".staging";
pub(super) const TEMP_PREFIX: &str = "tmp_";

/// Kinds of directories found directly below the cache root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RootDir {
    Current,
    OtherVersion(u32),
    Retired,
    Unrelated,
}

impl RootDir {
    fn classify(name: &str) -> Self {
        if name.starts_with(RETIRED_PREFIX) {
            return Self::Retired;
        }
        let version = name
            .strip_prefix('v')
            .filter(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|digits| digits.parse::<u32>().ok());
        match version {
            Some(LAYOUT_VERSION) => Self::Current,
            Some(other) => Self::OtherVersion(other),
            None => Self::Unrelated,
        }
    }
}

pub(super) fn layout_dir(root: &Path) -> PathBuf {
    root.join(format!("v{LAYOUT_VERSION}"))
}

/// Outcome of [`prepare_layout`].
#[derive(Debug)]
pub(super) struct PreparedLayout {
    pub active: PathBuf,
    pub retired: Vec<PathBuf>,
}

/// Ensures the current layout directory exists and retires every other
/// versioned directory. Directories that do not look like cache layouts are
/// left alone.
pub(super) async fn prepare_layout(root: &Path) -> io::Result<PreparedLayout> {
    let active = layout_dir(root);
    async_fs::create_dir_all(&active).await?;

    let mut retired = Vec::new();
    let mut children = async_fs::read_dir(root).await?;
    while let Some(child) = children.next_entry().await? {
        if !child.file_type().await?.is_dir() {
            continue;
        }
        let name = child.file_name().to_string_lossy().into_owned();
        match RootDir::classify(&name) {
            RootDir::Current | RootDir::Unrelated => {}
            RootDir::Retired => retired.push(child.path()),
            RootDir::OtherVersion(version) => {
                let target = root.join(format!("{RETIRED_PREFIX}{name}-{}", uuid::Uuid::new_v4()));
                match async_fs::rename(child.path(), &target).await {
                    Ok(()) => {
                        info!(version, "retired old media cache layout");
                        retired.push(target);
                    }
                    Err(err) => {
                        warn!(error = %err, path = %child.path().display(), "cannot retire old cache layout");
                    }
                }
            }
        }
    }

    Ok(PreparedLayout { active, retired })
}

/// Deletes retired layout directories, one task per directory.
pub(crate) fn spawn_cache_dir_cleanup(dirs: Vec<PathBuf>) -> Vec<JoinHandle<()>> {
    dirs.into_iter()
        .map(|dir| {
            tokio::spawn(async move {
                match async_fs::remove_dir_all(&dir).await {
                    Ok(()) => crate::metrics::record_cache_cleanup_dir(),
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => {
                        warn!(error = %err, path = %dir.display(), "retired cache dir not removed");
                    }
                }
            })
        })
        .collect()
}

/// Runs an eviction pass every `interval`. A zero interval disables the
/// sweeper.
pub(crate) fn spawn_eviction_sweeper(
    fetcher: MediaFetcher,
    interval: Duration,
) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        return None;
    }
    Some(tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut schedule = tokio::time::interval_at(start, interval);
        schedule.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            schedule.tick().await;
            match fetcher.evict_now().await {
                Ok(report) => debug!(
                    evicted = report.evicted,
                    bytes_freed = report.bytes_freed,
                    remaining_bytes = report.remaining_bytes,
                    "scheduled eviction pass finished"
                ),
                Err(err) => warn!(error = %err, "scheduled eviction pass failed"),
            }
        }
    }))
}
