use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use tracing::debug;
use url::Url;

use super::{
    BlobError, BlobStore, BlobStream, encode_object_path, redacted_url, validate_object_path,
};

/// Blob store reached over HTTP. Objects are addressed as
/// `{base}/o/{percent-encoded object path}`; download URLs add `alt=media`.
#[derive(Debug, Clone)]
pub struct HttpBlobStore {
    client: reqwest::Client,
    base_url: Option<Url>,
}

impl HttpBlobStore {
    /// `base_url` is only needed for uploads; downloads use absolute URLs.
    pub fn new(
        connect_timeout: Duration,
        timeout: Duration,
        base_url: Option<Url>,
    ) -> Result<Self, BlobError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(timeout)
            .build()
            .map_err(|err| BlobError::Transport {
                url: String::new(),
                reason: err.to_string(),
            })?;
        let base_url = base_url.map(|mut url| {
            if !url.path().ends_with('/') {
                let path = format!("{}/", url.path());
                url.set_path(&path);
            }
            url
        });
        Ok(Self { client, base_url })
    }

    pub fn object_url(&self, object_path: &str) -> Result<Url, BlobError> {
        validate_object_path(object_path)?;
        let base = self.base_url.as_ref().ok_or(BlobError::UploadsDisabled)?;
        base.join(&format!("o/{}", encode_object_path(object_path)))
            .map_err(|_| BlobError::InvalidPath(object_path.to_string()))
    }
}

fn transport(url: &Url, err: reqwest::Error) -> BlobError {
    BlobError::Transport {
        url: redacted_url(url),
        reason: err.without_url().to_string(),
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn get(&self, url: &Url) -> Result<BlobStream, BlobError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|err| transport(url, err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(BlobError::Status {
                url: redacted_url(url),
                status: status.as_u16(),
            });
        }
        debug!(url = %redacted_url(url), content_length = ?response.content_length(), "blob download started");
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|err| std::io::Error::other(err.without_url())))
            .boxed())
    }

    async fn put(
        &self,
        object_path: &str,
        content_type: &str,
        body: Bytes,
    ) -> Result<Url, BlobError> {
        let url = self.object_url(object_path)?;
        let response = self
            .client
            .put(url.clone())
            .header(CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await
            .map_err(|err| transport(&url, err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(BlobError::Status {
                url: redacted_url(&url),
                status: status.as_u16(),
            });
        }
        let mut download_url = url;
        download_url.set_query(Some("alt=media"));
        Ok(download_url)
    }
}
