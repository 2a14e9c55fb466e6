use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use http::Method;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use super::headers::HeaderAccumulator;
use super::line::read_line_with_timeout;

#[derive(Debug)]
pub(crate) struct RequestHead {
    pub method: Method,
    pub target: String,
    pub headers: HeaderAccumulator,
}

/// Read one HTTP/1.1 request head off a client connection.
///
/// Waits up to `idle_timeout` for the first byte (returning `None` on a
/// clean close, as happens between keep-alive requests), then applies
/// `header_timeout` per line while the head arrives.
pub(crate) async fn read_request_head<S>(
    reader: &mut BufReader<S>,
    idle_timeout: Duration,
    header_timeout: Duration,
    max_header_bytes: usize,
) -> Result<Option<RequestHead>>
where
    S: AsyncRead + Unpin,
{
    let available = match tokio::time::timeout(idle_timeout, reader.fill_buf()).await {
        Ok(Ok(buf)) => buf,
        Ok(Err(err)) => return Err(err).context("waiting for request data"),
        Err(_) => return Ok(None),
    };
    if available.is_empty() {
        return Ok(None);
    }

    let mut request_line = String::new();
    let read = read_line_with_timeout(
        reader,
        &mut request_line,
        header_timeout,
        max_header_bytes,
    )
    .await?;
    if read == 0 {
        return Ok(None);
    }

    let trimmed = request_line.trim_end_matches(['\r', '\n']);
    let mut parts = trimmed.split_whitespace();
    let method_str = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing method"))?;
    let target = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing target"))?;
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing version"))?;
    if parts.next().is_some() {
        bail!("malformed request line: unexpected data");
    }
    match version {
        "HTTP/1.1" => {}
        "HTTP/1.0" => bail!("HTTP/1.0 requests are not supported"),
        other => bail!("invalid HTTP version '{other}'"),
    }

    let method = Method::from_bytes(method_str.as_bytes())
        .with_context(|| format!("invalid method '{method_str}'"))?;
    let target = target.to_string();

    let remaining = max_header_bytes
        .checked_sub(read)
        .filter(|remaining| *remaining > 0)
        .ok_or_else(|| anyhow!("request headers exceed configured limit"))?;
    let mut headers = HeaderAccumulator::new(remaining);
    let mut header_line = String::new();
    loop {
        let read =
            read_line_with_timeout(reader, &mut header_line, header_timeout, remaining).await?;
        if read == 0 {
            bail!("connection closed before end of headers");
        }
        if !headers.push_line(&header_line)? {
            break;
        }
    }

    Ok(Some(RequestHead {
        method,
        target,
        headers,
    }))
}
