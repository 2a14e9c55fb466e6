#![allow(dead_code)]

pub mod upstream;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use cascade::cli::LogFormat;
use cascade::proxy::listener;
use cascade::settings::{CacheSettings, EgressSettings, RulesSettings, ServerSettings, Settings};

/// A cascade proxy running in-process on a loopback port, over a scratch
/// cache directory.
pub struct ProxyHarness {
    pub addr: SocketAddr,
    cache_dir: TempDir,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub fn test_settings(cache_dir: &Path) -> Settings {
    Settings {
        server: ServerSettings {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        cache: CacheSettings {
            directory: cache_dir.to_path_buf(),
            max_size_gb: 1.0,
            // Tests use small bodies; the admission floor is exercised at
            // the storage level.
            min_file_size_kb: 0,
            max_file_size_mb: 64,
            default_ttl: std::time::Duration::from_secs(3600),
            buffer_size_kb: 64,
            respect_headers: false,
        },
        egress: EgressSettings::default(),
        rules: RulesSettings::default(),
        log: LogFormat::Text,
    }
}

impl ProxyHarness {
    pub async fn spawn(mutate: impl FnOnce(&mut Settings)) -> Result<Self> {
        let cache_dir = TempDir::new()?;
        let mut settings = test_settings(cache_dir.path());
        mutate(&mut settings);

        let app = cascade::build_app_context(Arc::new(settings))?;
        let listener_socket = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener_socket.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let _ = listener::serve(listener_socket, app, shutdown_rx).await;
        });

        Ok(Self {
            addr,
            cache_dir,
            shutdown,
            handle,
        })
    }

    pub async fn connect(&self) -> Result<TcpStream> {
        Ok(TcpStream::connect(self.addr).await?)
    }

    pub fn cache_path(&self) -> &Path {
        self.cache_dir.path()
    }

    /// Paths of all cache body/metadata files currently on disk.
    pub fn cache_files(&self) -> Vec<std::path::PathBuf> {
        let mut files = Vec::new();
        let Ok(shards) = std::fs::read_dir(self.cache_path()) else {
            return files;
        };
        for shard in shards.flatten() {
            let Ok(entries) = std::fs::read_dir(shard.path()) else {
                continue;
            };
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy().to_string();
                if name.ends_with(".data") || name.ends_with(".meta") {
                    files.push(entry.path());
                }
            }
        }
        files
    }

    pub fn data_file_count(&self) -> usize {
        self.cache_files()
            .iter()
            .filter(|path| path.to_string_lossy().ends_with(".data"))
            .count()
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        // Tests do not exercise the 30s drain; cut the listener loose.
        self.handle.abort();
        let _ = self.handle.await;
    }
}

pub struct HttpResponse {
    pub status: u16,
    pub head: String,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        let prefix = format!("{}:", name.to_ascii_lowercase());
        self.head
            .lines()
            .find(|line| line.to_ascii_lowercase().starts_with(&prefix))
            .and_then(|line| line.split_once(':'))
            .map(|(_, value)| value.trim())
    }
}

/// Write a raw request and read one `Content-Length`-delimited response.
pub async fn roundtrip(stream: &mut TcpStream, request: &str) -> Result<HttpResponse> {
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;
    read_response(stream).await
}

pub async fn read_response(stream: &mut TcpStream) -> Result<HttpResponse> {
    let mut raw = Vec::new();
    let mut buf = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = find_double_crlf(&raw) {
            break pos;
        }
        let read = stream.read(&mut buf).await?;
        if read == 0 {
            bail!("connection closed before response head completed");
        }
        raw.extend_from_slice(&buf[..read]);
    };

    let head = String::from_utf8_lossy(&raw[..head_end]).to_string();
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .context("missing status code")?;

    let content_length = head
        .lines()
        .find(|line| line.to_ascii_lowercase().starts_with("content-length:"))
        .and_then(|line| line.split_once(':'))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok());

    let mut body = raw[head_end + 4..].to_vec();
    match content_length {
        Some(length) => {
            while body.len() < length {
                let read = stream.read(&mut buf).await?;
                if read == 0 {
                    // Short body: the caller decides whether that is fatal.
                    break;
                }
                body.extend_from_slice(&buf[..read]);
            }
        }
        None => {
            // Read to EOF (Connection: close responses).
            loop {
                let read = stream.read(&mut buf).await?;
                if read == 0 {
                    break;
                }
                body.extend_from_slice(&buf[..read]);
            }
        }
    }

    Ok(HttpResponse { status, head, body })
}

fn find_double_crlf(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|window| window == b"\r\n\r\n")
}
