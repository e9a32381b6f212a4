#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};
use std::time::Duration as StdDuration;

use anyhow::{Result, anyhow};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use stupamap_core::{cli::LogFormat, settings::Settings};

pub struct TestDirs {
    _temp: TempDir,
    pub cache_dir: PathBuf,
    pub files_dir: PathBuf,
}

impl TestDirs {
    pub fn new() -> Result<Self> {
        let temp = TempDir::new()?;
        let cache_dir = temp.path().join("media_cache");
        let files_dir = temp.path().join("files");
        std::fs::create_dir_all(&files_dir)?;
        Ok(Self {
            _temp: temp,
            cache_dir,
            files_dir,
        })
    }

    pub fn write_file(&self, name: &str, body: &[u8]) -> Result<PathBuf> {
        let path = self.files_dir.join(name);
        std::fs::write(&path, body)?;
        Ok(path)
    }
}

pub fn default_test_settings(cache_dir: &Path) -> Settings {
    Settings {
        cache_dir: cache_dir.to_path_buf(),
        log: LogFormat::Text,
        cache_max_bytes: 10 * 1024 * 1024,
        eviction_interval: 0,
        shard_count: 10,
        top_k: 10,
        transaction_max_attempts: 10,
        transaction_backoff_ms: 1,
        download_connect_timeout: 5,
        download_timeout: 10,
        blob_base_url: None,
        metrics_listen: None,
        metrics_path: "/metrics".to_string(),
    }
}

#[derive(Clone)]
enum MockObject {
    Body(Vec<u8>),
    Truncated(Vec<u8>),
    Status(u16),
}

#[derive(Default)]
struct MockState {
    objects: Mutex<HashMap<String, MockObject>>,
    gets: AtomicUsize,
    puts: AtomicUsize,
}

/// Minimal HTTP object store. GET serves stored objects by request path
/// (query ignored), PUT stores the request body. Counts requests.
pub struct MockBlobServer {
    addr: SocketAddr,
    state: Arc<MockState>,
    task: JoinHandle<()>,
}

impl MockBlobServer {
    pub async fn start() -> Result<Self> {
        Self::start_with_delay(None).await
    }

    /// `delay` is applied after the response head, before the body.
    pub async fn start_with_delay(delay: Option<StdDuration>) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(MockState::default());
        let task = tokio::spawn(serve(listener, state.clone(), delay));
        Ok(Self { addr, state, task })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}/v0/b/stupamap", self.addr)
    }

    /// Download URL for an object path, percent-encoded like the uploader does.
    pub fn object_url(&self, object_path: &str) -> String {
        format!(
            "{}/o/{}?alt=media&token=t1",
            self.base_url(),
            object_path.replace('/', "%2F")
        )
    }

    pub fn insert(&self, object_path: &str, body: &[u8]) {
        self.store(object_path, MockObject::Body(body.to_vec()));
    }

    pub fn insert_truncated(&self, object_path: &str, partial: &[u8]) {
        self.store(object_path, MockObject::Truncated(partial.to_vec()));
    }

    pub fn insert_status(&self, object_path: &str, status: u16) {
        self.store(object_path, MockObject::Status(status));
    }

    pub fn gets(&self) -> usize {
        self.state.gets.load(Ordering::SeqCst)
    }

    pub fn puts(&self) -> usize {
        self.state.puts.load(Ordering::SeqCst)
    }

    pub fn shutdown(self) {
        self.task.abort();
    }

    fn store(&self, object_path: &str, object: MockObject) {
        let key = format!("/v0/b/stupamap/o/{}", object_path.replace('/', "%2F"));
        self.state.objects.lock().unwrap().insert(key, object);
    }
}

async fn serve(listener: TcpListener, state: Arc<MockState>, delay: Option<StdDuration>) {
    loop {
        let Ok((socket, _)) = listener.accept().await else {
            return;
        };
        let state = state.clone();
        tokio::spawn(async move {
            let _ = handle(socket, state, delay).await;
        });
    }
}

async fn handle(
    mut socket: TcpStream,
    state: Arc<MockState>,
    delay: Option<StdDuration>,
) -> Result<()> {
    let mut buf = [0u8; 4096];
    let mut data = Vec::new();
    let head_end = loop {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&data[..head_end]).to_string();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default();
    let path = target.split('?').next().unwrap_or_default().to_string();
    let content_length = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    let mut body = data[head_end..].to_vec();
    while body.len() < content_length {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }

    match method.as_str() {
        "PUT" => {
            state.puts.fetch_add(1, Ordering::SeqCst);
            state
                .objects
                .lock()
                .unwrap()
                .insert(path, MockObject::Body(body));
            write_response(&mut socket, 200, b"{}", None, None).await
        }
        "GET" => {
            state.gets.fetch_add(1, Ordering::SeqCst);
            let object = state.objects.lock().unwrap().get(&path).cloned();
            match object {
                Some(MockObject::Body(body)) => {
                    write_response(&mut socket, 200, &body, None, delay).await
                }
                Some(MockObject::Truncated(partial)) => {
                    let declared = partial.len() * 2 + 1;
                    write_response(&mut socket, 200, &partial, Some(declared), delay).await
                }
                Some(MockObject::Status(status)) => {
                    write_response(&mut socket, status, b"error", None, delay).await
                }
                None => write_response(&mut socket, 404, b"not found", None, delay).await,
            }
        }
        _ => write_response(&mut socket, 405, b"", None, None).await,
    }
}

async fn write_response(
    socket: &mut TcpStream,
    status: u16,
    body: &[u8],
    declared_length: Option<usize>,
    delay: Option<StdDuration>,
) -> Result<()> {
    let head = format!(
        "HTTP/1.1 {status} X\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        declared_length.unwrap_or(body.len())
    );
    socket.write_all(head.as_bytes()).await?;
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    socket.write_all(body).await?;
    socket.shutdown().await.ok();
    Ok(())
}

/// Polls `check` until it holds or about two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(StdDuration::from_millis(20)).await;
    }
    false
}
