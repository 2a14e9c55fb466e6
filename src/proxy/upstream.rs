use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, timeout};
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::debug;

use crate::egress::{DIRECT_DIAL_TIMEOUT, EgressDialer};

use super::body::RequestBodyPlan;
use super::codec::HeaderAccumulator;
use super::request::{RequestTarget, Scheme};

pub(crate) const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const UPSTREAM_IO_TIMEOUT: Duration = Duration::from_secs(90);
pub(crate) const REQUEST_TOTAL_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub(crate) const MAX_RESPONSE_HEADER_BYTES: usize = 64 * 1024;

const MAX_IDLE_CONNECTIONS: usize = 1000;
const MAX_IDLE_PER_HOST: usize = 100;
const MAX_CONNS_PER_HOST: usize = 100;
const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(90);

pub(crate) enum UpstreamIo {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Unpin for UpstreamIo {}

impl AsyncRead for UpstreamIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_flush(cx),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub(crate) struct UpstreamKey {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl UpstreamKey {
    pub fn from_target(target: &RequestTarget) -> Self {
        Self {
            scheme: target.scheme,
            host: target.host.clone(),
            port: target.port,
        }
    }
}

pub(crate) struct UpstreamConnection {
    pub stream: UpstreamIo,
    pub host: String,
    pub port: u16,
    /// Slot in the per-host connection budget; held for the connection's
    /// whole lifetime, including while pooled idle.
    _permit: OwnedSemaphorePermit,
}

impl UpstreamConnection {
    /// Dial the origin through the egress dialer, wrapping in TLS for
    /// https targets. HTTP/1.1 only; no h2 ALPN is offered. The caller
    /// reserves `permit` from the pool before dialing.
    pub async fn connect(
        target: &RequestTarget,
        egress: &EgressDialer,
        tls_config: &Arc<rustls::ClientConfig>,
        permit: OwnedSemaphorePermit,
    ) -> Result<Self> {
        let tcp = egress
            .dial(&target.host, target.port, DIRECT_DIAL_TIMEOUT)
            .await?;

        let stream = if target.scheme == Scheme::Https {
            let server_name = ServerName::try_from(target.host.as_str())
                .map_err(|_| anyhow!("invalid upstream host for TLS '{}'", target.host))?
                .to_owned();
            let connector = TlsConnector::from(tls_config.clone());
            let tls = timeout(TLS_HANDSHAKE_TIMEOUT, connector.connect(server_name, tcp))
                .await
                .map_err(|_| anyhow!("TLS handshake with upstream timed out"))?
                .with_context(|| {
                    format!(
                        "failed to establish TLS with upstream {}:{}",
                        target.host, target.port
                    )
                })?;
            UpstreamIo::Tls(Box::new(tls))
        } else {
            UpstreamIo::Plain(tcp)
        };

        Ok(Self {
            stream,
            host: target.host.clone(),
            port: target.port,
            _permit: permit,
        })
    }

    pub async fn shutdown(&mut self, io_timeout: Duration) {
        let _ = timeout(io_timeout, self.stream.shutdown()).await;
    }
}

/// Serialize the upstream request head. Framing headers are re-emitted from
/// the body plan; everything else the client sent (minus hop-by-hop headers)
/// passes through.
pub(crate) fn build_upstream_request(
    method: &http::Method,
    target: &RequestTarget,
    headers: &HeaderAccumulator,
    body_plan: RequestBodyPlan,
) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(256);
    buffer.extend_from_slice(method.as_str().as_bytes());
    buffer.push(b' ');
    buffer.extend_from_slice(target.path.as_bytes());
    buffer.extend_from_slice(b" HTTP/1.1\r\nHost: ");
    buffer.extend_from_slice(target.host_header.as_bytes());
    buffer.extend_from_slice(b"\r\n");

    for line in headers.forward_lines() {
        if line.lower_name() == "host" {
            continue;
        }
        buffer.extend_from_slice(line.name.as_bytes());
        buffer.extend_from_slice(b": ");
        buffer.extend_from_slice(line.value.as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }

    match body_plan {
        RequestBodyPlan::Empty => {}
        RequestBodyPlan::Fixed(length) => {
            buffer.extend_from_slice(format!("Content-Length: {length}\r\n").as_bytes());
        }
        RequestBodyPlan::Chunked => {
            buffer.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
        }
    }

    buffer.extend_from_slice(b"\r\n");
    buffer
}

/// Process-global keep-alive pool and transport resource accounting, shared
/// by every client connection.
///
/// Enforced caps: at most 1000 idle connections overall, at most 100 idle
/// connections per origin, and at most 100 connections per origin in total
/// (in-flight dials and pooled connections alike; `reserve` waits for a free
/// slot). Idle connections older than 90 seconds are closed instead of
/// reused.
pub(crate) struct UpstreamPool {
    state: Mutex<PoolState>,
    max_idle_total: usize,
    max_idle_per_host: usize,
    max_conns_per_host: usize,
    idle_timeout: Duration,
}

#[derive(Default)]
struct PoolState {
    idle: HashMap<UpstreamKey, VecDeque<IdleConnection>>,
    idle_total: usize,
    per_host: HashMap<UpstreamKey, Arc<Semaphore>>,
}

struct IdleConnection {
    conn: UpstreamConnection,
    idled_at: Instant,
}

impl UpstreamPool {
    pub fn new() -> Self {
        Self::with_limits(
            MAX_IDLE_CONNECTIONS,
            MAX_IDLE_PER_HOST,
            MAX_CONNS_PER_HOST,
            IDLE_CONNECTION_TIMEOUT,
        )
    }

    fn with_limits(
        max_idle_total: usize,
        max_idle_per_host: usize,
        max_conns_per_host: usize,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            max_idle_total,
            max_idle_per_host,
            max_conns_per_host,
            idle_timeout,
        }
    }

    /// Reserve a slot in the per-origin connection budget before dialing.
    /// Waits while the origin is at its connection cap; the permit travels
    /// with the connection and frees the slot when the connection drops.
    pub async fn reserve(&self, key: &UpstreamKey) -> Result<OwnedSemaphorePermit> {
        let semaphore = {
            let mut state = self.state.lock();
            state
                .per_host
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(self.max_conns_per_host)))
                .clone()
        };
        semaphore
            .acquire_owned()
            .await
            .map_err(|_| anyhow!("upstream pool closed"))
    }

    /// Pop the most recently idled connection for this origin, discarding
    /// any that have sat idle past the timeout.
    pub fn take_idle(&self, key: &UpstreamKey) -> Option<UpstreamConnection> {
        let now = Instant::now();
        let mut stale = Vec::new();
        let taken = {
            let mut state = self.state.lock();
            let mut taken = None;
            let mut removed = 0usize;
            if let Some(list) = state.idle.get_mut(key) {
                while let Some(entry) = list.pop_back() {
                    removed += 1;
                    if now.duration_since(entry.idled_at) > self.idle_timeout {
                        stale.push(entry.conn);
                        continue;
                    }
                    taken = Some(entry.conn);
                    break;
                }
                if list.is_empty() {
                    state.idle.remove(key);
                }
            }
            state.idle_total = state.idle_total.saturating_sub(removed);
            taken
        };
        for conn in stale {
            spawn_shutdown(conn, "closing idle upstream connection past its timeout");
        }
        taken
    }

    /// Return a reusable connection to the idle set, or close it when the
    /// per-host or global idle bound is already met.
    pub fn release(&self, key: UpstreamKey, conn: UpstreamConnection) {
        {
            let mut state = self.state.lock();
            let per_host = state.idle.get(&key).map(|list| list.len()).unwrap_or(0);
            if per_host < self.max_idle_per_host && state.idle_total < self.max_idle_total {
                state.idle.entry(key).or_default().push_back(IdleConnection {
                    conn,
                    idled_at: Instant::now(),
                });
                state.idle_total += 1;
                return;
            }
        }
        spawn_shutdown(conn, "closing upstream connection over the idle bound");
    }

    #[cfg(test)]
    fn idle_count(&self) -> usize {
        self.state.lock().idle_total
    }
}

fn spawn_shutdown(mut conn: UpstreamConnection, reason: &'static str) {
    tokio::spawn(async move {
        debug!(host = %conn.host, port = conn.port, reason, "dropping upstream connection");
        conn.shutdown(UPSTREAM_IO_TIMEOUT).await;
    });
}
