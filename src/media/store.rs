use std::fs::Metadata;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use futures::StreamExt;
use tokio::fs as async_fs;
use tracing::{debug, warn};

use super::entry::CacheEntry;
use super::key::{CacheKey, MediaType, Owner};
use super::maintenance::{STAGING_DIR, TEMP_PREFIX, prepare_layout};
use super::writer::CacheWriter;
use crate::blob::BlobStream;
use crate::error::MediaError;

/// Disk-backed mapping from [`CacheKey`] to file. There is no separate
/// index: every query reads the filesystem, so results always match disk.
#[derive(Debug, Clone)]
pub struct CacheStore {
    disk_dir: PathBuf,
}

impl CacheStore {
    /// Opens the cache below `root`, preparing the versioned layout
    /// directory and removing temp files left behind by an earlier crash.
    /// Returns old layout directories that should be deleted in the
    /// background.
    pub async fn open(root: &Path) -> Result<(Self, Vec<PathBuf>), MediaError> {
        let layout = prepare_layout(root)
            .await
            .map_err(|err| MediaError::disk(root, err))?;
        let store = Self::new(layout.active);
        async_fs::create_dir_all(store.staging_dir())
            .await
            .map_err(|err| MediaError::disk(store.staging_dir(), err))?;
        store.remove_temp_files().await;
        Ok((store, layout.retired))
    }

    pub fn new(disk_dir: PathBuf) -> Self {
        Self { disk_dir }
    }

    pub fn disk_dir(&self) -> &Path {
        &self.disk_dir
    }

    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.disk_dir.join(key.relative_path())
    }

    pub fn owner_dir(&self, media_type: MediaType, owner: &Owner) -> PathBuf {
        self.disk_dir
            .join(media_type.dir_name())
            .join(owner.dir_name())
    }

    fn staging_dir(&self) -> PathBuf {
        self.disk_dir.join(STAGING_DIR)
    }

    fn temp_path(&self) -> PathBuf {
        self.staging_dir()
            .join(format!("{TEMP_PREFIX}{}", uuid::Uuid::new_v4()))
    }

    /// Returns the entry when the file exists and stamps its access time.
    pub async fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        let path = self.entry_path(key);
        let metadata = match async_fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return None,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(error = %err, path = %path.display(), "cache entry metadata unreadable");
                return None;
            }
        };

        let now = SystemTime::now();
        let last_accessed_at = match set_last_accessed(&path, now).await {
            Ok(()) => now,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(error = %err, path = %path.display(), "failed to refresh cache access time");
                metadata.modified().unwrap_or(now)
            }
        };

        Some(CacheEntry {
            key: key.clone(),
            local_path: path,
            size_bytes: metadata.len(),
            last_accessed_at,
        })
    }

    /// Opens a staged writer for `key`. The owner directory is created when
    /// the writer publishes.
    pub async fn begin_write(&self, key: &CacheKey) -> Result<CacheWriter, MediaError> {
        CacheWriter::create(self.temp_path(), self.entry_path(key), key.clone()).await
    }

    /// Streams `source` into a staged file and publishes it atomically.
    /// Errors from the source are `DownloadFailed`; local write and rename
    /// errors are `DiskWriteFailed`. Either way nothing becomes visible.
    pub async fn put(
        &self,
        key: &CacheKey,
        source_url: &str,
        mut source: BlobStream,
    ) -> Result<CacheEntry, MediaError> {
        let mut writer = self.begin_write(key).await?;
        while let Some(chunk) = source.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    writer.discard().await;
                    return Err(MediaError::download(source_url, err));
                }
            };
            if let Err(err) = writer.write_chunk(&chunk).await {
                writer.discard().await;
                return Err(err);
            }
        }
        writer.publish().await
    }

    /// Removes one entry. The owner directory stays, since a concurrent
    /// writer may be publishing into it; only
    /// [`CacheStore::remove_all_for_owner`] drops owner directories.
    pub async fn remove(&self, key: &CacheKey) -> Result<bool, MediaError> {
        let path = self.entry_path(key);
        match async_fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(MediaError::disk(path, err)),
        }
    }

    /// Drops every cached file of `owner` across all media types. Returns
    /// the number of media directories removed.
    pub async fn remove_all_for_owner(&self, owner: &Owner) -> Result<usize, MediaError> {
        let mut removed = 0;
        for media_type in MediaType::ALL {
            let dir = self.owner_dir(media_type, owner);
            match async_fs::remove_dir_all(&dir).await {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(MediaError::disk(dir, err)),
            }
        }
        debug!(owner = %owner, removed, "invalidated owner media");
        Ok(removed)
    }

    /// Enumerates every entry below the media directories.
    pub async fn entries(&self) -> Result<Vec<CacheEntry>, MediaError> {
        let mut entries = Vec::new();
        for media_type in MediaType::ALL {
            let media_dir = self.disk_dir.join(media_type.dir_name());
            let Some(mut owners) = read_dir_if_exists(&media_dir).await? else {
                continue;
            };
            while let Some(owner_dir) = owners
                .next_entry()
                .await
                .map_err(|err| MediaError::disk(&media_dir, err))?
            {
                let name = owner_dir.file_name();
                let Some(owner) = Owner::from_dir_name(&name.to_string_lossy()) else {
                    continue;
                };
                let owner_path = owner_dir.path();
                let mut files = match async_fs::read_dir(&owner_path).await {
                    Ok(files) => files,
                    Err(err) => {
                        skip_unreadable(&owner_path, &err);
                        continue;
                    }
                };
                loop {
                    let file = match files.next_entry().await {
                        Ok(Some(file)) => file,
                        Ok(None) => break,
                        Err(err) => {
                            skip_unreadable(&owner_path, &err);
                            break;
                        }
                    };
                    let Some(metadata) = file_metadata(&file.path(), file.metadata().await) else {
                        continue;
                    };
                    let entry_id = file.file_name().to_string_lossy().into_owned();
                    entries.push(CacheEntry {
                        key: CacheKey::new(entry_id, owner.clone(), media_type),
                        local_path: file.path(),
                        size_bytes: metadata.len(),
                        last_accessed_at: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                    });
                }
            }
        }
        Ok(entries)
    }

    pub async fn total_size(&self) -> Result<u64, MediaError> {
        Ok(self
            .entries()
            .await?
            .iter()
            .map(|entry| entry.size_bytes)
            .sum())
    }

    pub(super) async fn remove_temp_files(&self) {
        let staging = self.staging_dir();
        let mut entries = match async_fs::read_dir(&staging).await {
            Ok(entries) => entries,
            Err(_) => return,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let is_temp = entry
                .file_name()
                .to_str()
                .map(|name| name.starts_with(TEMP_PREFIX))
                .unwrap_or(false);
            if is_temp {
                async_fs::remove_file(entry.path()).await.ok();
            }
        }
    }
}

async fn read_dir_if_exists(path: &Path) -> Result<Option<async_fs::ReadDir>, MediaError> {
    match async_fs::read_dir(path).await {
        Ok(entries) => Ok(Some(entries)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(MediaError::disk(path, err)),
    }
}

/// Metadata of a regular file. Files that vanished or cannot be inspected
/// are skipped so one bad entry does not hide the rest of the cache.
fn file_metadata(path: &Path, metadata: std::io::Result<Metadata>) -> Option<Metadata> {
    match metadata {
        Ok(metadata) if metadata.is_file() => Some(metadata),
        Ok(_) => None,
        Err(err) => {
            skip_unreadable(path, &err);
            None
        }
    }
}

fn skip_unreadable(path: &Path, err: &std::io::Error) {
    if err.kind() != ErrorKind::NotFound {
        warn!(error = %err, path = %path.display(), "skipping unreadable cache path");
    }
}

/// Sets the modification time used as the entry's last access.
pub(crate) async fn set_last_accessed(path: &Path, when: SystemTime) -> std::io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let file = std::fs::OpenOptions::new().write(true).open(&path)?;
        file.set_modified(when)
    })
    .await
    .map_err(std::io::Error::other)?
}
