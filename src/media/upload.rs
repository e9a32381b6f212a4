use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tracing::info;
use url::Url;

use super::key::{MediaType, Owner};
use crate::blob::BlobStore;
use crate::error::MediaError;

const OBJECT_ROOT: &str = "stupas";

/// Stores local media in the blob store under its owner's object path, so
/// that the returned URL resolves back to the same owner.
#[derive(Clone)]
pub struct MediaUploader {
    blobs: Arc<dyn BlobStore>,
}

impl MediaUploader {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    /// Uploads `local_file` as media of `owner_id`. A `None` media type is
    /// taken from the file extension.
    pub async fn upload(
        &self,
        owner_id: &str,
        media_type: Option<MediaType>,
        local_file: &Path,
    ) -> Result<Url, MediaError> {
        let owner =
            Owner::entity(owner_id).map_err(|_| upload_error(local_file, "invalid owner id"))?;
        let extension = local_file
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        let media_type = media_type.unwrap_or_else(|| {
            extension
                .as_deref()
                .map(MediaType::from_extension)
                .unwrap_or(MediaType::Other)
        });

        let body = tokio::fs::read(local_file)
            .await
            .map_err(|err| upload_error(local_file, err))?;
        let object_path = object_path(
            &owner,
            media_type,
            unix_millis(),
            extension.as_deref().unwrap_or(default_extension(media_type)),
        );
        let size = body.len();
        let url = self
            .blobs
            .put(&object_path, content_type(media_type, extension.as_deref()), Bytes::from(body))
            .await
            .map_err(|err| upload_error(local_file, err))?;

        crate::metrics::record_upload(media_type.dir_name());
        info!(owner = %owner, media_type = %media_type, bytes = size, object_path, "media uploaded");
        Ok(url)
    }
}

fn upload_error(path: &Path, reason: impl ToString) -> MediaError {
    MediaError::UploadFailed {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn object_path(owner: &Owner, media_type: MediaType, millis: u128, extension: &str) -> String {
    let folder = match media_type {
        MediaType::Photo => "photos",
        MediaType::Video => "videos",
        MediaType::Other => "media",
    };
    format!("{OBJECT_ROOT}/{owner}/{folder}/{millis}.{extension}")
}

fn default_extension(media_type: MediaType) -> &'static str {
    match media_type {
        MediaType::Photo => "jpg",
        MediaType::Video => "mp4",
        MediaType::Other => "bin",
    }
}

fn content_type(media_type: MediaType, extension: Option<&str>) -> &'static str {
    match (media_type, extension) {
        (_, Some("png")) => "image/png",
        (_, Some("webp")) => "image/webp",
        (_, Some("gif")) => "image/gif",
        (_, Some("heic")) => "image/heic",
        (_, Some("mov")) => "video/quicktime",
        (_, Some("webm")) => "video/webm",
        (MediaType::Photo, _) => "image/jpeg",
        (MediaType::Video, _) => "video/mp4",
        (MediaType::Other, _) => "application/octet-stream",
    }
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default()
}
