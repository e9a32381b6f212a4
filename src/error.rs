use std::path::PathBuf;

use thiserror::Error;

/// Failures surfaced by the media cache. Cloneable so that every caller
/// coalesced onto one download observes the same outcome.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("malformed media url {url}: {reason}")]
    MalformedUrl { url: String, reason: &'static str },
    #[error("download of {url} failed: {reason}")]
    DownloadFailed { url: String, reason: String },
    #[error("cache write to {} failed: {reason}", path.display())]
    DiskWriteFailed { path: PathBuf, reason: String },
    #[error("upload of {} failed: {reason}", path.display())]
    UploadFailed { path: PathBuf, reason: String },
}

impl MediaError {
    pub(crate) fn malformed(url: impl Into<String>, reason: &'static str) -> Self {
        Self::MalformedUrl {
            url: url.into(),
            reason,
        }
    }

    pub(crate) fn download(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::DownloadFailed {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn disk(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::DiskWriteFailed {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Short label used for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedUrl { .. } => "malformed_url",
            Self::DownloadFailed { .. } => "download_failed",
            Self::DiskWriteFailed { .. } => "disk_write_failed",
            Self::UploadFailed { .. } => "upload_failed",
        }
    }
}

/// Failures recording prayers against the transactional document store.
#[derive(Debug, Error)]
pub enum TallyError {
    #[error("counter {counter_id} write failed after {attempts} attempt(s): {reason}")]
    CounterWriteFailed {
        counter_id: String,
        attempts: u32,
        reason: String,
    },
    #[error("stats for user {user_id} write failed after {attempts} attempt(s): {reason}")]
    StatsWriteFailed {
        user_id: String,
        attempts: u32,
        reason: String,
    },
    #[error("prayer {prayer_id} write failed after {attempts} attempt(s): {reason}")]
    PrayerWriteFailed {
        prayer_id: String,
        attempts: u32,
        reason: String,
    },
    #[error("prayer {0} does not exist")]
    PrayerNotFound(String),
    #[error("invalid counter or user id {0:?}")]
    InvalidId(String),
    #[error("document store read failed: {0}")]
    ReadFailed(#[from] crate::docstore::StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable_labels() {
        assert_eq!(
            MediaError::malformed("x", "missing owner").kind(),
            "malformed_url"
        );
        assert_eq!(
            MediaError::download("x", "status 404").kind(),
            "download_failed"
        );
        assert_eq!(
            MediaError::disk("/tmp/x", "disk full").kind(),
            "disk_write_failed"
        );
    }

    #[test]
    fn download_error_message_includes_reason() {
        let err = MediaError::download("https://store/a.jpg", "status 503");
        assert_eq!(
            err.to_string(),
            "download of https://store/a.jpg failed: status 503"
        );
    }
}
