use std::path::PathBuf;
use std::time::SystemTime;

use tokio::fs::{self as async_fs, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{trace, warn};

use super::entry::CacheEntry;
use super::key::CacheKey;
use super::store::set_last_accessed;
use crate::error::MediaError;

/// Staged write of one cache entry. Bytes go to a temp file in the staging
/// directory; [`CacheWriter::publish`] renames it into place. A writer that
/// is dropped without publishing removes its temp file.
pub struct CacheWriter {
    file: BufWriter<File>,
    temp_path: PathBuf,
    final_path: PathBuf,
    key: CacheKey,
    written: u64,
    settled: bool,
}

impl CacheWriter {
    pub(super) async fn create(
        temp_path: PathBuf,
        final_path: PathBuf,
        key: CacheKey,
    ) -> Result<Self, MediaError> {
        let mut options = async_fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);
        let file = options
            .open(&temp_path)
            .await
            .map_err(|err| MediaError::disk(&temp_path, err))?;
        Ok(Self {
            file: BufWriter::new(file),
            temp_path,
            final_path,
            key,
            written: 0,
            settled: false,
        })
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Appends one chunk. Local I/O failures are `DiskWriteFailed`.
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), MediaError> {
        self.file
            .write_all(chunk)
            .await
            .map_err(|err| MediaError::disk(&self.temp_path, err))?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Makes the staged bytes visible at the final path in one rename.
    pub async fn publish(mut self) -> Result<CacheEntry, MediaError> {
        match self.move_into_place().await {
            Ok(()) => self.settled = true,
            Err(err) => {
                self.discard_temp().await;
                return Err(err);
            }
        }

        let now = SystemTime::now();
        if let Err(err) = set_last_accessed(&self.final_path, now).await {
            warn!(error = %err, path = %self.final_path.display(), "cannot stamp cache entry access time");
        }
        trace!(key = %self.key, bytes = self.written, "published cache entry");

        Ok(CacheEntry {
            key: self.key.clone(),
            local_path: self.final_path.clone(),
            size_bytes: self.written,
            last_accessed_at: now,
        })
    }

    /// Drops the staged bytes without publishing anything.
    pub async fn discard(mut self) {
        self.discard_temp().await;
    }

    async fn move_into_place(&mut self) -> Result<(), MediaError> {
        let temp_err = |err: std::io::Error| MediaError::disk(&self.temp_path, err);
        self.file.flush().await.map_err(temp_err)?;
        self.file.get_ref().sync_all().await.map_err(temp_err)?;

        let owner_dir = self
            .final_path
            .parent()
            .ok_or_else(|| MediaError::disk(&self.final_path, "cache entry path has no parent"))?;
        // An owner invalidation can drop the directory between creating it
        // and the rename; recreate it once.
        let mut retried = false;
        loop {
            async_fs::create_dir_all(owner_dir)
                .await
                .map_err(|err| MediaError::disk(owner_dir, err))?;
            match async_fs::rename(&self.temp_path, &self.final_path).await {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound && !retried => {
                    retried = true;
                }
                Err(err) => return Err(MediaError::disk(&self.final_path, err)),
            }
        }
    }

    async fn discard_temp(&mut self) {
        let _ = async_fs::remove_file(&self.temp_path).await;
        self.settled = true;
    }
}

impl Drop for CacheWriter {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let temp_path = std::mem::take(&mut self.temp_path);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let _ = async_fs::remove_file(temp_path).await;
                });
            }
            Err(_) => {
                let _ = std::fs::remove_file(temp_path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::key::{MediaType, Owner};
    use anyhow::Result;
    use tempfile::TempDir;

    fn video_key() -> CacheKey {
        CacheKey::new(
            "0123abcd.mp4",
            Owner::Entity("abc".to_string()),
            MediaType::Video,
        )
    }

    #[tokio::test]
    async fn nothing_is_visible_until_publish() -> Result<()> {
        let dir = TempDir::new()?;
        let key = video_key();
        let temp_path = dir.path().join("tmp_a");
        let final_path = dir.path().join(key.relative_path());

        let mut writer = CacheWriter::create(temp_path.clone(), final_path.clone(), key).await?;
        writer.write_chunk(b"first half, ").await?;
        writer.write_chunk(b"second half").await?;
        assert!(!final_path.exists());
        assert_eq!(writer.bytes_written(), 23);

        let entry = writer.publish().await?;
        assert_eq!(entry.size_bytes, 23);
        assert_eq!(entry.local_path, final_path);
        assert_eq!(std::fs::read(&final_path)?, b"first half, second half");
        assert!(!temp_path.exists());
        Ok(())
    }

    #[tokio::test]
    async fn dropped_writer_removes_temp_file() -> Result<()> {
        let dir = TempDir::new()?;
        let key = video_key();
        let temp_path = dir.path().join("tmp_b");
        let final_path = dir.path().join(key.relative_path());

        let mut writer = CacheWriter::create(temp_path.clone(), final_path.clone(), key).await?;
        writer.write_chunk(b"half of a vid").await?;
        assert!(temp_path.exists());
        drop(writer);

        for _ in 0..50 {
            if !temp_path.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(!temp_path.exists());
        assert!(!final_path.exists());
        Ok(())
    }

    #[tokio::test]
    async fn discard_leaves_no_files() -> Result<()> {
        let dir = TempDir::new()?;
        let key = video_key();
        let temp_path = dir.path().join("tmp_c");
        let final_path = dir.path().join(key.relative_path());

        let mut writer = CacheWriter::create(temp_path.clone(), final_path.clone(), key).await?;
        writer.write_chunk(b"abandoned").await?;
        writer.discard().await;
        assert!(!temp_path.exists());
        assert!(!final_path.exists());
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn published_files_are_private_to_the_owner() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new()?;
        let key = video_key();
        let mut writer = CacheWriter::create(
            dir.path().join("tmp_d"),
            dir.path().join(key.relative_path()),
            key,
        )
        .await?;
        writer.write_chunk(b"payload").await?;
        let entry = writer.publish().await?;

        let mode = std::fs::metadata(&entry.local_path)?.permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        Ok(())
    }
}
