use std::path::PathBuf;
use std::time::SystemTime;

use super::key::CacheKey;

/// One file in the cache. Derived from filesystem state on every read;
/// `last_accessed_at` is the file's modification time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub local_path: PathBuf,
    pub size_bytes: u64,
    pub last_accessed_at: SystemTime,
}

impl CacheEntry {
    pub fn entry_id(&self) -> &str {
        self.key.entry_id()
    }
}
