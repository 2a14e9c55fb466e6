use std::time::Duration;

use anyhow::Result;
use http::StatusCode;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::io_util::write_all_with_timeout;
use crate::util::timeout_with_context;

/// Write a short self-generated response (403, 502, ...) with a plain-text
/// body. These always close the connection.
pub(crate) async fn send_error_response<S>(
    stream: &mut S,
    status: StatusCode,
    body: &str,
    timeout_dur: Duration,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let reason = status.canonical_reason().unwrap_or("Unknown");
    let header = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nContent-Type: text/plain; charset=utf-8\r\nConnection: close\r\n\r\n",
        status.as_u16(),
        reason,
        body.len()
    );
    write_all_with_timeout(stream, header.as_bytes(), timeout_dur, "writing error response").await?;
    if !body.is_empty() {
        write_all_with_timeout(stream, body.as_bytes(), timeout_dur, "writing error body").await?;
    }
    timeout_with_context(timeout_dur, stream.flush(), "flushing error response").await?;
    Ok(())
}

pub(crate) async fn shutdown_stream<S>(stream: &mut S, timeout_dur: Duration) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    timeout_with_context(
        timeout_dur,
        stream.shutdown(),
        "shutting down client stream",
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn error_response_is_well_formed() -> Result<()> {
        let (mut client, mut server) = tokio::io::duplex(1024);
        send_error_response(
            &mut server,
            StatusCode::FORBIDDEN,
            "CONNECT not allowed\r\n",
            Duration::from_secs(1),
        )
        .await?;
        drop(server);

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await?;
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("HTTP/1.1 403 Forbidden\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("CONNECT not allowed\r\n"));
        Ok(())
    }
}
