use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Clone)]
enum Behavior {
    /// Respond 200 with the given extra headers and body, honoring the real
    /// Content-Length.
    Http {
        extra_headers: String,
        body: Arc<Vec<u8>>,
    },
    /// Advertise `advertised` bytes but send only the body, then close.
    ShortBody {
        advertised: usize,
        body: Arc<Vec<u8>>,
    },
    /// Echo raw bytes; used behind CONNECT tunnels.
    Echo,
}

/// Minimal scripted origin server for proxy tests. Counts requests served.
pub struct TestUpstream {
    addr: SocketAddr,
    requests: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl TestUpstream {
    pub async fn http_ok(body: impl Into<Vec<u8>>) -> Result<Self> {
        Self::http_with_headers("", body).await
    }

    pub async fn http_with_headers(
        extra_headers: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> Result<Self> {
        Self::spawn(Behavior::Http {
            extra_headers: extra_headers.into(),
            body: Arc::new(body.into()),
        })
        .await
    }

    pub async fn short_body(advertised: usize, body: impl Into<Vec<u8>>) -> Result<Self> {
        Self::spawn(Behavior::ShortBody {
            advertised,
            body: Arc::new(body.into()),
        })
        .await
    }

    pub async fn echo() -> Result<Self> {
        Self::spawn(Behavior::Echo).await
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    async fn spawn(behavior: Behavior) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = requests.clone();
        let handle = tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => break,
                };
                let behavior = behavior.clone();
                let counter = counter.clone();
                tokio::spawn(async move {
                    let _ = serve(&mut stream, behavior, counter).await;
                });
            }
        });
        Ok(Self {
            addr,
            requests,
            handle,
        })
    }
}

impl Drop for TestUpstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(stream: &mut TcpStream, behavior: Behavior, counter: Arc<AtomicUsize>) -> Result<()> {
    match behavior {
        Behavior::Echo => {
            let mut buf = [0u8; 4096];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(read) => {
                        if stream.write_all(&buf[..read]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        Behavior::Http {
            extra_headers,
            body,
        } => loop {
            if read_request_head(stream).await.is_err() {
                break;
            }
            counter.fetch_add(1, Ordering::SeqCst);
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n{}\r\n",
                body.len(),
                extra_headers
            );
            stream.write_all(head.as_bytes()).await?;
            stream.write_all(&body).await?;
            stream.flush().await?;
        },
        Behavior::ShortBody { advertised, body } => {
            read_request_head(stream).await?;
            counter.fetch_add(1, Ordering::SeqCst);
            let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {advertised}\r\n\r\n");
            stream.write_all(head.as_bytes()).await?;
            stream.write_all(&body).await?;
            stream.flush().await?;
            stream.shutdown().await?;
        }
    }
    Ok(())
}

async fn read_request_head(stream: &mut TcpStream) -> Result<()> {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let read = stream.read(&mut buf).await?;
        if read == 0 {
            anyhow::bail!("client closed");
        }
        data.extend_from_slice(&buf[..read]);
        if data.windows(4).any(|window| window == b"\r\n\r\n") {
            return Ok(());
        }
    }
}
