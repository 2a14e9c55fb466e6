use std::io;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::io_util::write_all_with_timeout;
use crate::util::timeout_with_context;

use super::codec::{HeaderAccumulator, ResponseBodyPlan, read_line_with_timeout};

const MAX_CHUNK_LINE_LENGTH: usize = 8 * 1024;
const RELAY_BUFFER_SIZE: usize = 8 * 1024;

/// Framing of an inbound request body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RequestBodyPlan {
    Empty,
    Fixed(u64),
    Chunked,
}

pub(crate) fn request_body_plan(headers: &HeaderAccumulator) -> RequestBodyPlan {
    if headers.is_chunked() {
        return RequestBodyPlan::Chunked;
    }
    match headers.content_length() {
        Some(0) | None => RequestBodyPlan::Empty,
        Some(length) => RequestBodyPlan::Fixed(length),
    }
}

/// Forward a request body from the client to the upstream, preserving its
/// framing on the wire.
pub(crate) async fn stream_request_body<S, U>(
    client: &mut BufReader<S>,
    upstream: &mut U,
    plan: RequestBodyPlan,
    io_timeout: Duration,
) -> Result<u64>
where
    S: AsyncRead + Unpin,
    U: AsyncWrite + Unpin,
{
    match plan {
        RequestBodyPlan::Empty => Ok(0),
        RequestBodyPlan::Fixed(length) => {
            let mut remaining = length;
            let mut buffer = [0u8; RELAY_BUFFER_SIZE];
            while remaining > 0 {
                let to_read = remaining.min(buffer.len() as u64) as usize;
                let read = timeout_with_context(
                    io_timeout,
                    client.read(&mut buffer[..to_read]),
                    "reading request body from client",
                )
                .await?;
                if read == 0 {
                    bail!("client closed connection mid request body");
                }
                remaining -= read as u64;
                write_all_with_timeout(
                    upstream,
                    &buffer[..read],
                    io_timeout,
                    "forwarding request body upstream",
                )
                .await?;
            }
            Ok(length)
        }
        RequestBodyPlan::Chunked => {
            forward_chunked_raw(client, upstream, io_timeout).await
        }
    }
}

/// Copy a chunked body verbatim, framing included, until the terminal chunk
/// and its trailers have passed through.
async fn forward_chunked_raw<S, U>(
    reader: &mut BufReader<S>,
    writer: &mut U,
    io_timeout: Duration,
) -> Result<u64>
where
    S: AsyncRead + Unpin,
    U: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut line = String::new();
    loop {
        let read =
            read_line_with_timeout(reader, &mut line, io_timeout, MAX_CHUNK_LINE_LENGTH).await?;
        if read == 0 {
            bail!("connection closed while reading chunk size");
        }
        write_all_with_timeout(writer, line.as_bytes(), io_timeout, "forwarding chunk size")
            .await?;
        total += read as u64;

        let chunk_size = parse_chunk_size(&line)?;
        if chunk_size == 0 {
            // Trailer section runs to the first blank line.
            loop {
                let read =
                    read_line_with_timeout(reader, &mut line, io_timeout, MAX_CHUNK_LINE_LENGTH)
                        .await?;
                if read == 0 {
                    bail!("connection closed while reading chunk trailers");
                }
                write_all_with_timeout(
                    writer,
                    line.as_bytes(),
                    io_timeout,
                    "forwarding chunk trailer",
                )
                .await?;
                total += read as u64;
                if line.trim_end_matches(['\r', '\n']).is_empty() {
                    return Ok(total);
                }
            }
        }

        let mut remaining = chunk_size;
        let mut buffer = [0u8; RELAY_BUFFER_SIZE];
        while remaining > 0 {
            let to_read = remaining.min(buffer.len() as u64) as usize;
            let read = timeout_with_context(
                io_timeout,
                reader.read(&mut buffer[..to_read]),
                "reading chunk data",
            )
            .await?;
            if read == 0 {
                bail!("connection closed mid-chunk");
            }
            remaining -= read as u64;
            write_all_with_timeout(writer, &buffer[..read], io_timeout, "forwarding chunk data")
                .await?;
            total += read as u64;
        }

        let mut crlf = [0u8; 2];
        timeout_with_context(
            io_timeout,
            reader.read_exact(&mut crlf),
            "reading chunk terminator",
        )
        .await?;
        if &crlf != b"\r\n" {
            bail!("invalid chunk terminator");
        }
        write_all_with_timeout(writer, &crlf, io_timeout, "forwarding chunk terminator").await?;
        total += 2;
    }
}

/// Relay a response body as decoded payload bytes into `sink`.
///
/// The upstream transfer framing is consumed here; the sink receives exactly
/// the payload (what the client ultimately gets as a body, and what the cache
/// stores). Returns the payload byte count.
pub(crate) async fn relay_response_payload<S, W>(
    upstream: &mut BufReader<S>,
    sink: &mut W,
    plan: ResponseBodyPlan,
    io_timeout: Duration,
) -> Result<u64>
where
    S: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match plan {
        ResponseBodyPlan::Empty => Ok(0),
        ResponseBodyPlan::Fixed(length) => {
            let mut remaining = length;
            let mut buffer = [0u8; RELAY_BUFFER_SIZE];
            while remaining > 0 {
                let to_read = remaining.min(buffer.len() as u64) as usize;
                let read = timeout_with_context(
                    io_timeout,
                    upstream.read(&mut buffer[..to_read]),
                    "reading response body from upstream",
                )
                .await?;
                if read == 0 {
                    bail!("upstream closed connection early while sending response body");
                }
                remaining -= read as u64;
                write_all_with_timeout(
                    sink,
                    &buffer[..read],
                    io_timeout,
                    "writing response body",
                )
                .await?;
            }
            Ok(length)
        }
        ResponseBodyPlan::Chunked => relay_chunked_payload(upstream, sink, io_timeout).await,
        ResponseBodyPlan::UntilClose => {
            let mut total = 0u64;
            let mut buffer = [0u8; RELAY_BUFFER_SIZE];
            loop {
                let read = timeout_with_context(
                    io_timeout,
                    upstream.read(&mut buffer),
                    "reading response body from upstream",
                )
                .await?;
                if read == 0 {
                    return Ok(total);
                }
                write_all_with_timeout(
                    sink,
                    &buffer[..read],
                    io_timeout,
                    "writing response body",
                )
                .await?;
                total += read as u64;
            }
        }
    }
}

/// De-chunk an upstream body, writing payload bytes only. Trailers are
/// consumed and dropped.
async fn relay_chunked_payload<S, W>(
    upstream: &mut BufReader<S>,
    sink: &mut W,
    io_timeout: Duration,
) -> Result<u64>
where
    S: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut line = String::new();
    loop {
        let read =
            read_line_with_timeout(upstream, &mut line, io_timeout, MAX_CHUNK_LINE_LENGTH).await?;
        if read == 0 {
            bail!("upstream closed connection while sending chunk size");
        }
        let chunk_size = parse_chunk_size(&line)?;

        if chunk_size == 0 {
            loop {
                let read =
                    read_line_with_timeout(upstream, &mut line, io_timeout, MAX_CHUNK_LINE_LENGTH)
                        .await?;
                if read == 0 {
                    bail!("upstream closed connection while sending trailers");
                }
                if line.trim_end_matches(['\r', '\n']).is_empty() {
                    return Ok(total);
                }
            }
        }

        let mut remaining = chunk_size;
        let mut buffer = [0u8; RELAY_BUFFER_SIZE];
        while remaining > 0 {
            let to_read = remaining.min(buffer.len() as u64) as usize;
            let read = timeout_with_context(
                io_timeout,
                upstream.read(&mut buffer[..to_read]),
                "reading chunk data from upstream",
            )
            .await?;
            if read == 0 {
                bail!("upstream closed connection mid-chunk");
            }
            remaining -= read as u64;
            write_all_with_timeout(sink, &buffer[..read], io_timeout, "writing response body")
                .await?;
            total += read as u64;
        }

        let mut crlf = [0u8; 2];
        timeout_with_context(
            io_timeout,
            upstream.read_exact(&mut crlf),
            "reading chunk terminator from upstream",
        )
        .await?;
        if &crlf != b"\r\n" {
            bail!("invalid chunk terminator from upstream");
        }
    }
}

fn parse_chunk_size(line: &str) -> Result<u64> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    let size_str = trimmed
        .split_once(';')
        .map(|(size, _)| size)
        .unwrap_or(trimmed)
        .trim();
    u64::from_str_radix(size_str, 16).with_context(|| format!("invalid chunk size '{size_str}'"))
}

/// Re-frames payload writes as chunked transfer coding. Each accepted write
/// becomes one chunk; `finish` emits the terminal chunk.
pub(crate) struct ChunkEncoder<W> {
    inner: W,
    frame: Vec<u8>,
    pos: usize,
    payload_len: usize,
}

impl<W> ChunkEncoder<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            frame: Vec::new(),
            pos: 0,
            payload_len: 0,
        }
    }

    pub async fn finish(&mut self) -> io::Result<()> {
        self.flush().await?;
        self.inner.write_all(b"0\r\n\r\n").await?;
        self.inner.flush().await
    }

    fn poll_drain(&mut self, cx: &mut TaskContext<'_>) -> Poll<io::Result<usize>> {
        while self.pos < self.frame.len() {
            match Pin::new(&mut self.inner).poll_write(cx, &self.frame[self.pos..]) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "chunk sink wrote zero bytes",
                    )));
                }
                Poll::Ready(Ok(n)) => self.pos += n,
                Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                Poll::Pending => return Poll::Pending,
            }
        }
        let written = self.payload_len;
        self.frame.clear();
        self.pos = 0;
        self.payload_len = 0;
        Poll::Ready(Ok(written))
    }
}

impl<W> AsyncWrite for ChunkEncoder<W>
where
    W: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.frame.is_empty() {
            if buf.is_empty() {
                return Poll::Ready(Ok(0));
            }
            this.frame
                .extend_from_slice(format!("{:x}\r\n", buf.len()).as_bytes());
            this.frame.extend_from_slice(buf);
            this.frame.extend_from_slice(b"\r\n");
            this.payload_len = buf.len();
        }
        this.poll_drain(cx)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.frame.is_empty() {
            match this.poll_drain(cx) {
                Poll::Ready(Ok(_)) => {}
                Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.frame.is_empty() {
            match this.poll_drain(cx) {
                Poll::Ready(Ok(_)) => {}
                Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
