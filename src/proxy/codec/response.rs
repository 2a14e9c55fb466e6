use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use http::{Method, StatusCode};
use tokio::io::{AsyncRead, BufReader};

use super::headers::{HeaderLine, is_hop_by_hop};
use super::line::read_line_with_timeout;

/// How the response body reaches the client after the proxy has decoded the
/// upstream framing. The proxy always re-frames: payload bytes are relayed,
/// not raw transfer encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ResponseBodyPlan {
    Empty,
    Fixed(u64),
    Chunked,
    UntilClose,
}

pub(crate) struct ResponseHead {
    pub status_line: String,
    pub status: StatusCode,
    pub headers: Vec<HeaderLine>,
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub connection_close: bool,
}

impl ResponseHead {
    pub fn first_value(&self, lower_name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|line| line.lower_name() == lower_name)
            .map(|line| line.value.as_str())
    }

    /// Serialize the head for the client: end-to-end headers are preserved,
    /// hop-by-hop and framing headers are replaced according to `body_plan`,
    /// and `extra` headers (the `X-Cache` family) are appended.
    pub fn encode(
        &self,
        body_plan: ResponseBodyPlan,
        extra: &[(&str, String)],
        close_connection: bool,
    ) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(256);
        buffer.extend_from_slice(self.status_line.as_bytes());
        buffer.extend_from_slice(b"\r\n");

        for line in &self.headers {
            let lower = line.lower_name();
            if is_hop_by_hop(lower) || lower == "content-length" || lower == "transfer-encoding" {
                continue;
            }
            buffer.extend_from_slice(line.name.as_bytes());
            buffer.extend_from_slice(b": ");
            buffer.extend_from_slice(line.value.as_bytes());
            buffer.extend_from_slice(b"\r\n");
        }

        encode_framing(&mut buffer, body_plan, self.content_length);
        for (name, value) in extra {
            buffer.extend_from_slice(name.as_bytes());
            buffer.extend_from_slice(b": ");
            buffer.extend_from_slice(value.as_bytes());
            buffer.extend_from_slice(b"\r\n");
        }
        if close_connection || matches!(body_plan, ResponseBodyPlan::UntilClose) {
            buffer.extend_from_slice(b"Connection: close\r\n");
        }
        buffer.extend_from_slice(b"\r\n");
        buffer
    }
}

pub(crate) fn encode_framing(
    buffer: &mut Vec<u8>,
    body_plan: ResponseBodyPlan,
    known_length: Option<u64>,
) {
    match body_plan {
        ResponseBodyPlan::Fixed(length) => {
            buffer.extend_from_slice(format!("Content-Length: {length}\r\n").as_bytes());
        }
        ResponseBodyPlan::Chunked => {
            buffer.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
        }
        ResponseBodyPlan::Empty => {
            // HEAD responses keep the advertised length of the body they
            // describe.
            if let Some(length) = known_length {
                buffer.extend_from_slice(format!("Content-Length: {length}\r\n").as_bytes());
            }
        }
        ResponseBodyPlan::UntilClose => {}
    }
}

/// Decide how the upstream response body is delimited on the wire.
pub(crate) fn response_body_plan(method: &Method, head: &ResponseHead) -> ResponseBodyPlan {
    if method == Method::HEAD {
        return ResponseBodyPlan::Empty;
    }
    if head.status.is_informational()
        || head.status == StatusCode::NO_CONTENT
        || head.status == StatusCode::NOT_MODIFIED
    {
        return ResponseBodyPlan::Empty;
    }
    if head.chunked {
        return ResponseBodyPlan::Chunked;
    }
    if let Some(length) = head.content_length {
        if length == 0 {
            return ResponseBodyPlan::Empty;
        }
        return ResponseBodyPlan::Fixed(length);
    }
    ResponseBodyPlan::UntilClose
}

pub(crate) async fn read_response_head<S>(
    reader: &mut BufReader<S>,
    timeout_dur: Duration,
    max_header_bytes: usize,
) -> Result<ResponseHead>
where
    S: AsyncRead + Unpin,
{
    let mut status_line = String::new();
    let read =
        read_line_with_timeout(reader, &mut status_line, timeout_dur, max_header_bytes).await?;
    if read == 0 {
        bail!("upstream closed connection before sending a response");
    }
    let status_line = status_line.trim_end_matches(['\r', '\n']).to_string();

    let mut parts = status_line.splitn(3, ' ');
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("empty response status line"))?;
    if version != "HTTP/1.1" && version != "HTTP/1.0" {
        bail!("unsupported upstream HTTP version '{version}'");
    }
    let status_code = parts
        .next()
        .ok_or_else(|| anyhow!("response status line missing code"))?;
    let status = status_code
        .parse::<u16>()
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .with_context(|| format!("invalid response status '{status_code}'"))?;

    let mut headers = Vec::new();
    let mut content_length = None;
    let mut chunked = false;
    let mut connection_close = version == "HTTP/1.0";
    let mut total_bytes = read;
    let mut line = String::new();
    loop {
        let read = read_line_with_timeout(reader, &mut line, timeout_dur, max_header_bytes).await?;
        if read == 0 {
            bail!("upstream closed connection mid-headers");
        }
        total_bytes += read;
        if total_bytes > max_header_bytes {
            bail!("upstream response headers exceed limit of {max_header_bytes} bytes");
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        let (name, value) = trimmed
            .split_once(':')
            .ok_or_else(|| anyhow!("upstream header missing ':' separator"))?;
        let name = name.trim();
        let value = value.trim();

        match name.to_ascii_lowercase().as_str() {
            "content-length" => {
                content_length = Some(
                    value
                        .parse::<u64>()
                        .map_err(|_| anyhow!("invalid upstream Content-Length '{value}'"))?,
                );
            }
            "transfer-encoding" => {
                if value.to_ascii_lowercase().contains("chunked") {
                    chunked = true;
                }
            }
            "connection" => {
                if value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("close"))
                {
                    connection_close = true;
                }
            }
            _ => {}
        }
        headers.push(HeaderLine::new(name, value));
    }

    Ok(ResponseHead {
        status_line,
        status,
        headers,
        content_length,
        chunked,
        connection_close,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncWriteExt, duplex};

    async fn parse(raw: &str) -> Result<ResponseHead> {
        let (mut tx, rx) = duplex(2048);
        tx.write_all(raw.as_bytes()).await?;
        drop(tx);
        let mut reader = BufReader::new(rx);
        read_response_head(&mut reader, Duration::from_secs(1), 4096).await
    }

    #[tokio::test]
    async fn parses_fixed_length_response() -> Result<()> {
        let head = parse("HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\n")
            .await?;
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(head.content_length, Some(5));
        assert!(!head.chunked);
        assert_eq!(head.first_value("content-type"), Some("text/plain"));
        assert_eq!(
            response_body_plan(&Method::GET, &head),
            ResponseBodyPlan::Fixed(5)
        );
        Ok(())
    }

    #[tokio::test]
    async fn chunked_beats_content_length() -> Result<()> {
        let head =
            parse("HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nContent-Length: 5\r\n\r\n")
                .await?;
        assert_eq!(
            response_body_plan(&Method::GET, &head),
            ResponseBodyPlan::Chunked
        );
        Ok(())
    }

    #[tokio::test]
    async fn head_requests_have_empty_bodies() -> Result<()> {
        let head = parse("HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n").await?;
        assert_eq!(
            response_body_plan(&Method::HEAD, &head),
            ResponseBodyPlan::Empty
        );
        Ok(())
    }

    #[tokio::test]
    async fn missing_length_means_until_close() -> Result<()> {
        let head = parse("HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n").await?;
        assert!(head.connection_close);
        assert_eq!(
            response_body_plan(&Method::GET, &head),
            ResponseBodyPlan::UntilClose
        );
        Ok(())
    }

    #[tokio::test]
    async fn encode_reframes_and_appends_extras() -> Result<()> {
        let head = parse(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nConnection: keep-alive\r\nTransfer-Encoding: chunked\r\n\r\n",
        )
        .await?;
        let encoded = head.encode(
            ResponseBodyPlan::Fixed(11),
            &[("X-Cache", "MISS".to_string())],
            false,
        );
        let text = String::from_utf8(encoded).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: text/plain\r\n"));
        assert!(text.contains("Content-Length: 11\r\n"));
        assert!(text.contains("X-Cache: MISS\r\n"));
        assert!(!text.contains("Transfer-Encoding"));
        assert!(!text.contains("keep-alive"));
        assert!(text.ends_with("\r\n\r\n"));
        Ok(())
    }
}
