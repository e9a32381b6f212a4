use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder, core::Collector,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpListener,
    time::timeout,
};
use tracing::{debug, info, warn};

const METRICS_READ_TIMEOUT: Duration = Duration::from_secs(5);
const METRICS_MAX_REQUEST_BYTES: usize = 8 * 1024;

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static CACHE_LOOKUP_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec("media_cache_lookup_total", "Media cache lookups by result", "result")
});
static DOWNLOADS_TOTAL: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("media_downloads_total", "Blob downloads by result", "result"));
static COALESCED_FETCHES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "media_coalesced_fetches_total",
        "Fetches that joined an in-flight download",
    )
});
static CACHE_EVICTIONS_TOTAL: Lazy<IntCounter> =
    Lazy::new(|| counter("media_cache_evictions_total", "Media cache evictions"));
static CACHE_EVICTED_BYTES_TOTAL: Lazy<IntCounter> =
    Lazy::new(|| counter("media_cache_evicted_bytes_total", "Bytes reclaimed by eviction"));
static CACHE_EVICTION_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "media_cache_eviction_failures_total",
        "Cache entries that could not be deleted",
    )
});
static CACHE_EVICTION_PASSES_TOTAL: Lazy<IntCounter> =
    Lazy::new(|| counter("media_cache_eviction_passes_total", "Eviction passes run"));
static CACHE_CLEANUP_DIRS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "media_cache_cleanup_dirs_total",
        "Old cache layout directories removed",
    )
});
static UPLOADS_TOTAL: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("media_uploads_total", "Media uploads by media type", "media_type"));
static TRANSACTION_COMMITS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec("tally_transaction_commits_total", "Committed tally transactions", "kind")
});
static TRANSACTION_CONFLICTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "tally_transaction_conflicts_total",
        "Write conflicts seen by tally transactions",
        "kind",
    )
});
static TRANSACTION_EXHAUSTED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "tally_transaction_exhausted_total",
        "Tally transactions that ran out of retries",
        "kind",
    )
});

// Metric names are literals above; construction only fails on an invalid name.
fn counter(name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("valid metric name");
    register(name, Box::new(counter.clone()));
    counter
}

fn counter_vec(name: &str, help: &str, label: &str) -> IntCounterVec {
    let vec = IntCounterVec::new(Opts::new(name, help), &[label]).expect("valid metric name");
    register(name, Box::new(vec.clone()));
    vec
}

fn register(name: &str, collector: Box<dyn Collector>) {
    if let Err(err) = REGISTRY.register(collector) {
        warn!(metric = name, error = %err, "metric not registered");
    }
}

pub fn record_cache_lookup(result: &str) {
    CACHE_LOOKUP_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_download(result: &str) {
    DOWNLOADS_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_coalesced_fetch() {
    COALESCED_FETCHES_TOTAL.inc();
}

pub fn record_cache_eviction(bytes: u64) {
    CACHE_EVICTIONS_TOTAL.inc();
    CACHE_EVICTED_BYTES_TOTAL.inc_by(bytes);
}

pub fn record_cache_eviction_failure() {
    CACHE_EVICTION_FAILURES_TOTAL.inc();
}

pub fn record_eviction_pass() {
    CACHE_EVICTION_PASSES_TOTAL.inc();
}

pub fn record_cache_cleanup_dir() {
    CACHE_CLEANUP_DIRS_TOTAL.inc();
}

pub fn record_upload(media_type: &str) {
    UPLOADS_TOTAL.with_label_values(&[media_type]).inc();
}

pub fn record_transaction_commit(kind: &str) {
    TRANSACTION_COMMITS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn record_transaction_conflict(kind: &str) {
    TRANSACTION_CONFLICTS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn record_transaction_exhausted(kind: &str) {
    TRANSACTION_EXHAUSTED_TOTAL.with_label_values(&[kind]).inc();
}

pub fn gather() -> Vec<u8> {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(err) = TextEncoder::new().encode(&metric_families, &mut buffer) {
        warn!(error = %err, "failed to encode metrics");
    }
    buffer
}

/// Serves the registry as plain text on `GET {path}` until the task is
/// aborted.
pub async fn serve(addr: SocketAddr, path: String) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    let path = if path.is_empty() {
        "/metrics".to_string()
    } else {
        path
    };
    info!(listen = %addr, path = %path, "metrics endpoint started");
    loop {
        let (stream, peer) = listener.accept().await?;
        let path = path.clone();
        tokio::spawn(async move {
            let limits = RequestLimits {
                read_timeout: METRICS_READ_TIMEOUT,
                max_bytes: METRICS_MAX_REQUEST_BYTES,
            };
            if let Err(err) = respond(stream, &path, limits).await {
                debug!(peer = %peer, error = %err, "metrics request dropped");
            }
        });
    }
}

#[derive(Debug, Clone, Copy)]
struct RequestLimits {
    read_timeout: Duration,
    max_bytes: usize,
}

async fn respond<S>(mut stream: S, path: &str, limits: RequestLimits) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(head) = read_request_head(&mut stream, limits).await? else {
        return Ok(());
    };
    let request_line = head.lines().next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let wanted = parts.next() == Some("GET") && parts.next() == Some(path);

    let response = if wanted {
        build_response("200 OK", TextEncoder::new().format_type(), gather())
    } else {
        build_response("404 Not Found", "text/plain", b"not found".to_vec())
    };
    stream.write_all(&response).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Reads up to the blank line ending the request head. Returns `None` when
/// the peer closes without sending anything.
async fn read_request_head<S>(stream: &mut S, limits: RequestLimits) -> Result<Option<String>>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::new();
    let mut chunk = [0u8; 512];
    loop {
        let n = timeout(limits.read_timeout, stream.read(&mut chunk))
            .await
            .map_err(|_| anyhow!("timed out reading metrics request"))??;
        if n == 0 {
            if head.is_empty() {
                return Ok(None);
            }
            bail!("connection closed inside metrics request");
        }
        head.extend_from_slice(&chunk[..n]);
        if head.len() > limits.max_bytes {
            bail!("metrics request exceeded allowed size");
        }
        if head.windows(4).any(|window| window == b"\r\n\r\n") {
            break;
        }
    }
    let head = String::from_utf8(head).map_err(|_| anyhow!("metrics request is not utf-8"))?;
    Ok(Some(head))
}

fn build_response(status: &str, content_type: &str, body: Vec<u8>) -> Vec<u8> {
    let mut response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(&body);
    response
}
