//! Boundary to the remote object store that holds uploaded media.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use thiserror::Error;
use url::Url;

mod http;
mod memory;

pub use http::HttpBlobStore;
pub use memory::MemoryBlobStore;

/// Body of a downloaded object, delivered in chunks.
pub type BlobStream = BoxStream<'static, std::io::Result<Bytes>>;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob store answered {status} for {url}")]
    Status { url: String, status: u16 },
    #[error("blob store request for {url} failed: {reason}")]
    Transport { url: String, reason: String },
    #[error("invalid object path {0:?}")]
    InvalidPath(String),
    #[error("uploads are disabled: no blob store base url configured")]
    UploadsDisabled,
}

/// Object storage addressed by URL. `get` streams an object; `put` stores
/// one and returns the durable URL it can be downloaded from.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, url: &Url) -> Result<BlobStream, BlobError>;

    async fn put(&self, object_path: &str, content_type: &str, body: Bytes)
    -> Result<Url, BlobError>;
}

/// Percent-encodes an object path into a single URL segment, the way
/// object-store download URLs carry it (`stupas%2Fabc%2Fphotos%2F1.jpg`).
pub fn encode_object_path(object_path: &str) -> String {
    urlencoding::encode(object_path).into_owned()
}

/// URL without query or fragment. Download URLs carry access tokens in the
/// query, which must stay out of errors and logs.
pub fn redacted_url(url: &Url) -> String {
    let mut shown = url.clone();
    shown.set_query(None);
    shown.set_fragment(None);
    shown.to_string()
}

pub(crate) fn validate_object_path(object_path: &str) -> Result<(), BlobError> {
    let valid = !object_path.is_empty()
        && !object_path.starts_with('/')
        && object_path
            .split('/')
            .all(|part| !part.is_empty() && part != "." && part != "..");
    if valid {
        Ok(())
    } else {
        Err(BlobError::InvalidPath(object_path.to_string()))
    }
}
