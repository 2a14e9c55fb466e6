use std::collections::{BTreeMap, HashSet};

use anyhow::{Result, anyhow, bail};
use http::header::HeaderName;

/// Headers that describe the connection rather than the message and must not
/// travel through the proxy.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "upgrade",
];

#[derive(Clone, Debug)]
pub(crate) struct HeaderLine {
    pub name: String,
    pub value: String,
    lower: String,
}

impl HeaderLine {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let lower = name.to_ascii_lowercase();
        Self {
            name,
            value: value.into(),
            lower,
        }
    }

    pub fn lower_name(&self) -> &str {
        &self.lower
    }
}

pub(crate) fn is_hop_by_hop(lower_name: &str) -> bool {
    HOP_BY_HOP.contains(&lower_name)
}

/// Incrementally parsed request headers with the handful of fields the
/// router cares about pulled out along the way.
#[derive(Debug)]
pub(crate) struct HeaderAccumulator {
    lines: Vec<HeaderLine>,
    connection_tokens: HashSet<String>,
    host: Option<String>,
    content_length: Option<u64>,
    chunked: bool,
    total_bytes: usize,
    max_bytes: usize,
}

impl HeaderAccumulator {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            lines: Vec::new(),
            connection_tokens: HashSet::new(),
            host: None,
            content_length: None,
            chunked: false,
            total_bytes: 0,
            max_bytes,
        }
    }

    /// Feed one raw header line. Returns false once the terminating blank
    /// line has been consumed.
    pub fn push_line(&mut self, line: &str) -> Result<bool> {
        self.total_bytes += line.len();
        if self.total_bytes > self.max_bytes {
            bail!("request headers exceed configured limit of {} bytes", self.max_bytes);
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            return Ok(false);
        }

        let (name, value) = trimmed
            .split_once(':')
            .ok_or_else(|| anyhow!("header missing ':' separator"))?;
        let name = name.trim();
        let value = value.trim();
        if name.is_empty() {
            bail!("header name must not be empty");
        }
        HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| anyhow!("invalid header name '{name}'"))?;

        let lower = name.to_ascii_lowercase();
        match lower.as_str() {
            "host" => {
                if self.host.is_none() {
                    self.host = Some(value.to_string());
                }
            }
            "content-length" => {
                let parsed: u64 = value
                    .parse()
                    .map_err(|_| anyhow!("invalid Content-Length '{value}'"))?;
                if let Some(existing) = self.content_length
                    && existing != parsed
                {
                    bail!("conflicting Content-Length headers");
                }
                self.content_length = Some(parsed);
            }
            "transfer-encoding" => {
                if value.to_ascii_lowercase().contains("chunked") {
                    self.chunked = true;
                }
            }
            "connection" => {
                for token in value.split(',') {
                    let token = token.trim();
                    if !token.is_empty() {
                        self.connection_tokens.insert(token.to_ascii_lowercase());
                    }
                }
            }
            _ => {}
        }

        self.lines.push(HeaderLine::new(name, value));
        Ok(true)
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub fn wants_close(&self) -> bool {
        self.connection_tokens.contains("close")
    }

    pub fn first_value(&self, lower_name: &str) -> Option<&str> {
        self.lines
            .iter()
            .find(|line| line.lower_name() == lower_name)
            .map(|line| line.value.as_str())
    }

    /// Headers safe to forward upstream: hop-by-hop headers, anything named
    /// in `Connection`, and message framing headers are dropped (framing is
    /// re-emitted by the request builder).
    pub fn forward_lines(&self) -> impl Iterator<Item = &HeaderLine> {
        self.lines.iter().filter(|line| {
            let lower = line.lower_name();
            !is_hop_by_hop(lower)
                && lower != "content-length"
                && lower != "transfer-encoding"
                && !self.connection_tokens.contains(lower)
        })
    }
}

/// Collapse response header lines into the flat first-value map the cache
/// sidecar stores. Name casing is preserved as received.
pub(crate) fn first_value_map<'a>(
    lines: impl Iterator<Item = &'a HeaderLine>,
) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    let mut seen = HashSet::new();
    for line in lines {
        if seen.insert(line.lower_name().to_string()) {
            map.insert(line.name.clone(), line.value.clone());
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accumulate(lines: &[&str]) -> HeaderAccumulator {
        let mut headers = HeaderAccumulator::new(4096);
        for line in lines {
            headers.push_line(line).expect("valid header");
        }
        headers.push_line("\r\n").expect("terminator");
        headers
    }

    #[test]
    fn tracks_host_and_framing() {
        let headers = accumulate(&[
            "Host: mirror.example:3142\r\n",
            "Content-Length: 42\r\n",
            "Accept: */*\r\n",
        ]);
        assert_eq!(headers.host(), Some("mirror.example:3142"));
        assert_eq!(headers.content_length(), Some(42));
        assert!(!headers.is_chunked());
        assert!(!headers.wants_close());
    }

    #[test]
    fn forward_lines_drop_hop_by_hop_and_named_tokens() {
        let headers = accumulate(&[
            "Host: mirror.example\r\n",
            "Connection: close, X-Drop-Me\r\n",
            "X-Drop-Me: secret\r\n",
            "Proxy-Authorization: Basic abc\r\n",
            "User-Agent: apt\r\n",
        ]);
        let forwarded: Vec<_> = headers
            .forward_lines()
            .map(|line| line.name.as_str())
            .collect();
        assert!(forwarded.contains(&"Host"));
        assert!(forwarded.contains(&"User-Agent"));
        assert!(!forwarded.contains(&"X-Drop-Me"));
        assert!(!forwarded.contains(&"Proxy-Authorization"));
        assert!(!forwarded.contains(&"Connection"));
        assert!(headers.wants_close());
    }

    #[test]
    fn conflicting_content_length_is_rejected() {
        let mut headers = HeaderAccumulator::new(4096);
        headers.push_line("Content-Length: 10\r\n").unwrap();
        assert!(headers.push_line("Content-Length: 11\r\n").is_err());
    }

    #[test]
    fn first_value_map_keeps_first_of_repeats() {
        let headers = accumulate(&[
            "Set-Cookie: a=1\r\n",
            "Set-Cookie: b=2\r\n",
            "Content-Type: text/plain\r\n",
        ]);
        let map = first_value_map(headers.forward_lines());
        assert_eq!(map.get("Set-Cookie").map(String::as_str), Some("a=1"));
        assert_eq!(map.get("Content-Type").map(String::as_str), Some("text/plain"));
    }

    #[test]
    fn header_size_limit_is_enforced() {
        let mut headers = HeaderAccumulator::new(16);
        let err = headers
            .push_line("X-Long-Header-Name: some-quite-long-value\r\n")
            .expect_err("over the size limit");
        assert!(err.to_string().contains("exceed"));
    }
}
