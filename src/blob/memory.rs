use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream};
use parking_lot::Mutex;
use url::Url;

use super::{
    BlobError, BlobStore, BlobStream, encode_object_path, redacted_url, validate_object_path,
};

const CHUNK_SIZE: usize = 64 * 1024;
const MEMORY_BASE_URL: &str = "https://blobs.local/o/";

#[derive(Debug, Clone)]
enum StoredObject {
    Body(Bytes),
    Truncated(Bytes),
    Status(u16),
}

/// In-process blob store. Useful for embedding without a network and for
/// exercising fetch behaviour: it counts downloads and can add latency,
/// fail with a status, or cut a body short.
#[derive(Debug)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<String, StoredObject>>,
    gets: AtomicUsize,
    latency: Duration,
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            gets: AtomicUsize::new(0),
            latency: Duration::ZERO,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn insert(&self, url: &str, body: impl Into<Bytes>) {
        self.store(url, StoredObject::Body(body.into()));
    }

    /// The download yields `partial` and then fails mid-stream.
    pub fn insert_truncated(&self, url: &str, partial: impl Into<Bytes>) {
        self.store(url, StoredObject::Truncated(partial.into()));
    }

    pub fn insert_status(&self, url: &str, status: u16) {
        self.store(url, StoredObject::Status(status));
    }

    /// Number of `get` calls served so far.
    pub fn downloads(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn object(&self, url: &str) -> Option<Bytes> {
        match self.objects.lock().get(&normalize(url)) {
            Some(StoredObject::Body(body)) => Some(body.clone()),
            _ => None,
        }
    }

    fn store(&self, url: &str, object: StoredObject) {
        self.objects.lock().insert(normalize(url), object);
    }
}

fn normalize(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => redacted_url(&parsed),
        Err(_) => url.to_string(),
    }
}

fn chunked(body: Bytes) -> Vec<std::io::Result<Bytes>> {
    let mut chunks = Vec::new();
    let mut offset = 0;
    while offset < body.len() {
        let end = (offset + CHUNK_SIZE).min(body.len());
        chunks.push(Ok(body.slice(offset..end)));
        offset = end;
    }
    chunks
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, url: &Url) -> Result<BlobStream, BlobError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let object = self.objects.lock().get(&normalize(url.as_str())).cloned();
        match object {
            Some(StoredObject::Body(body)) => Ok(stream::iter(chunked(body)).boxed()),
            Some(StoredObject::Truncated(partial)) => {
                let mut chunks = chunked(partial);
                chunks.push(Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed before end of body",
                )));
                Ok(stream::iter(chunks).boxed())
            }
            Some(StoredObject::Status(status)) => Err(BlobError::Status {
                url: redacted_url(url),
                status,
            }),
            None => Err(BlobError::Status {
                url: redacted_url(url),
                status: 404,
            }),
        }
    }

    async fn put(
        &self,
        object_path: &str,
        _content_type: &str,
        body: Bytes,
    ) -> Result<Url, BlobError> {
        validate_object_path(object_path)?;
        let base = Url::parse(MEMORY_BASE_URL)
            .map_err(|_| BlobError::InvalidPath(object_path.to_string()))?;
        let mut url = base
            .join(&encode_object_path(object_path))
            .map_err(|_| BlobError::InvalidPath(object_path.to_string()))?;
        self.store(url.as_str(), StoredObject::Body(body));
        url.set_query(Some("alt=media"));
        Ok(url)
    }
}
