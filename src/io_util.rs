use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::util::timeout_with_context;

pub async fn write_all_with_timeout<W: AsyncWrite + Unpin, C: Into<String>>(
    writer: &mut W,
    buf: &[u8],
    timeout: Duration,
    context: C,
) -> Result<()> {
    timeout_with_context(timeout, writer.write_all(buf), context).await
}

/// Copy `reader` to `writer` until EOF, bounding each write by `timeout`.
pub async fn copy_with_write_timeout<R: AsyncRead + Unpin, W: AsyncWrite + Unpin>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    timeout: Duration,
    context: &str,
) -> Result<u64> {
    let mut total = 0u64;
    let mut buffer = vec![0u8; buffer_size];
    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        write_all_with_timeout(writer, &buffer[..read], timeout, context).await?;
        total = total.saturating_add(read as u64);
    }
    Ok(total)
}

/// Duplicates one write stream into two sinks.
///
/// A write is acknowledged only once both sinks have accepted every byte, so
/// the sinks never drift apart. Flush and shutdown propagate to both.
pub struct TeeWriter<W1, W2> {
    primary: W1,
    mirror: W2,
    buf: Vec<u8>,
    primary_pos: usize,
    mirror_pos: usize,
}

impl<W1, W2> TeeWriter<W1, W2> {
    pub fn new(primary: W1, mirror: W2) -> Self {
        Self {
            primary,
            mirror,
            buf: Vec::new(),
            primary_pos: 0,
            mirror_pos: 0,
        }
    }
}

impl<W1, W2> TeeWriter<W1, W2>
where
    W1: AsyncWrite + Unpin,
    W2: AsyncWrite + Unpin,
{
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        loop {
            let mut progressed = false;

            if self.primary_pos < self.buf.len() {
                match Pin::new(&mut self.primary).poll_write(cx, &self.buf[self.primary_pos..]) {
                    Poll::Ready(Ok(0)) => {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "tee primary sink wrote zero bytes",
                        )));
                    }
                    Poll::Ready(Ok(n)) => {
                        self.primary_pos += n;
                        progressed = true;
                    }
                    Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                    Poll::Pending => {}
                }
            }

            if self.mirror_pos < self.buf.len() {
                match Pin::new(&mut self.mirror).poll_write(cx, &self.buf[self.mirror_pos..]) {
                    Poll::Ready(Ok(0)) => {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "tee mirror sink wrote zero bytes",
                        )));
                    }
                    Poll::Ready(Ok(n)) => {
                        self.mirror_pos += n;
                        progressed = true;
                    }
                    Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                    Poll::Pending => {}
                }
            }

            if self.primary_pos == self.buf.len() && self.mirror_pos == self.buf.len() {
                let written = self.buf.len();
                self.buf.clear();
                self.primary_pos = 0;
                self.mirror_pos = 0;
                return Poll::Ready(Ok(written));
            }

            if !progressed {
                return Poll::Pending;
            }
        }
    }
}

impl<W1, W2> AsyncWrite for TeeWriter<W1, W2>
where
    W1: AsyncWrite + Unpin,
    W2: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.buf.is_empty() {
            if buf.is_empty() {
                return Poll::Ready(Ok(0));
            }
            this.buf.extend_from_slice(buf);
        }
        this.poll_drain(cx)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.buf.is_empty() {
            match this.poll_drain(cx) {
                Poll::Ready(Ok(_)) => {}
                Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                Poll::Pending => return Poll::Pending,
            }
        }
        match (
            Pin::new(&mut this.primary).poll_flush(cx),
            Pin::new(&mut this.mirror).poll_flush(cx),
        ) {
            (Poll::Ready(Ok(())), Poll::Ready(Ok(()))) => Poll::Ready(Ok(())),
            (Poll::Ready(Err(err)), _) | (_, Poll::Ready(Err(err))) => Poll::Ready(Err(err)),
            _ => Poll::Pending,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.buf.is_empty() {
            match this.poll_drain(cx) {
                Poll::Ready(Ok(_)) => {}
                Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                Poll::Pending => return Poll::Pending,
            }
        }
        match (
            Pin::new(&mut this.primary).poll_shutdown(cx),
            Pin::new(&mut this.mirror).poll_shutdown(cx),
        ) {
            (Poll::Ready(Ok(())), Poll::Ready(Ok(()))) => Poll::Ready(Ok(())),
            (Poll::Ready(Err(err)), _) | (_, Poll::Ready(Err(err))) => Poll::Ready(Err(err)),
            _ => Poll::Pending,
        }
    }
}

/// A sink wrapper that records the first I/O error and swallows everything
/// after it, acknowledging writes as if they succeeded.
///
/// The cache side of the response tee uses this so a failed cache write never
/// interrupts the bytes still owed to the client.
pub struct BestEffortWriter<W> {
    inner: W,
    error: Option<io::Error>,
}

impl<W> BestEffortWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, error: None }
    }

    pub fn take_error(&mut self) -> Option<io::Error> {
        self.error.take()
    }
}

impl<W> AsyncWrite for BestEffortWriter<W>
where
    W: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.error.is_some() {
            return Poll::Ready(Ok(buf.len()));
        }
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Err(err)) => {
                this.error = Some(err);
                Poll::Ready(Ok(buf.len()))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.error.is_some() {
            return Poll::Ready(Ok(()));
        }
        match Pin::new(&mut this.inner).poll_flush(cx) {
            Poll::Ready(Err(err)) => {
                this.error = Some(err);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.error.is_some() {
            return Poll::Ready(Ok(()));
        }
        match Pin::new(&mut this.inner).poll_shutdown(cx) {
            Poll::Ready(Err(err)) => {
                this.error = Some(err);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    struct ChunkWriter {
        max_chunk: usize,
        data: Vec<u8>,
    }

    impl ChunkWriter {
        fn new(max_chunk: usize) -> Self {
            Self {
                max_chunk,
                data: Vec::new(),
            }
        }
    }

    impl AsyncWrite for ChunkWriter {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let take = buf.len().min(self.max_chunk);
            self.data.extend_from_slice(&buf[..take]);
            Poll::Ready(Ok(take))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    struct FailingWriter;

    impl AsyncWrite for FailingWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn tee_keeps_both_sinks_in_sync() -> io::Result<()> {
        let fast = ChunkWriter::new(1024);
        let slow = ChunkWriter::new(3);
        let mut tee = TeeWriter::new(fast, slow);

        let payload = b"abcdefghijklmnopqrstuvwxyz";
        tee.write_all(payload).await?;

        let TeeWriter {
            primary, mirror, ..
        } = tee;
        assert_eq!(primary.data, payload);
        assert_eq!(mirror.data, payload);
        Ok(())
    }

    #[tokio::test]
    async fn best_effort_swallows_errors_after_first_failure() {
        let mut sink = BestEffortWriter::new(FailingWriter);
        sink.write_all(b"hello").await.expect("first write");
        sink.write_all(b"world").await.expect("second write");
        let err = sink.take_error().expect("recorded error");
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(sink.take_error().is_none());
    }

    #[tokio::test]
    async fn tee_through_best_effort_survives_mirror_failure() -> io::Result<()> {
        let client = ChunkWriter::new(7);
        let mut cache = BestEffortWriter::new(FailingWriter);
        {
            let mut tee = TeeWriter::new(client, &mut cache);
            tee.write_all(b"payload bytes").await?;
            let TeeWriter { primary, .. } = tee;
            assert_eq!(primary.data, b"payload bytes");
        }
        assert!(cache.take_error().is_some());
        Ok(())
    }
}
