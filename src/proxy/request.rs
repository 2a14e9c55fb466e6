use anyhow::{Context, Result, anyhow, bail};
use http::Uri;

use crate::util::strip_port;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// A request target resolved to an absolute URL plus the pieces the router
/// needs to reach the origin.
#[derive(Clone, Debug)]
pub(crate) struct RequestTarget {
    /// The absolute URL; input to the cache key and rule matching.
    pub url: String,
    pub scheme: Scheme,
    /// Origin hostname without port.
    pub host: String,
    pub port: u16,
    /// Authority to send in the upstream `Host` header, as received.
    pub host_header: String,
    /// Origin-form path and query for the upstream request line.
    pub path: String,
}

/// Reconstruct the absolute target URL per proxy semantics: an absolute-form
/// request target wins; otherwise the URL is synthesized from the `Host`
/// header and the origin-form path.
pub(crate) fn resolve_target(target: &str, host_header: Option<&str>) -> Result<RequestTarget> {
    if target.starts_with("http://") || target.starts_with("https://") {
        let uri: Uri = target
            .parse()
            .with_context(|| format!("invalid absolute request target '{target}'"))?;
        let scheme = match uri.scheme_str() {
            Some("http") => Scheme::Http,
            Some("https") => Scheme::Https,
            other => bail!("unsupported scheme '{}'", other.unwrap_or_default()),
        };
        let authority = uri
            .authority()
            .ok_or_else(|| anyhow!("absolute request target '{target}' missing authority"))?;
        let host = uri
            .host()
            .ok_or_else(|| anyhow!("absolute request target '{target}' missing host"))?
            .to_string();
        let port = uri.port_u16().unwrap_or_else(|| scheme.default_port());
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        return Ok(RequestTarget {
            url: target.to_string(),
            scheme,
            host,
            port,
            host_header: authority.as_str().to_string(),
            path,
        });
    }

    if !target.starts_with('/') {
        bail!("request target '{target}' is neither absolute nor origin-form");
    }

    let host_header = host_header
        .ok_or_else(|| anyhow!("origin-form request requires a Host header"))?
        .to_string();
    if host_header.is_empty() || host_header.chars().any(char::is_whitespace) {
        bail!("invalid Host header '{host_header}'");
    }

    // The listener only ever sees plaintext HTTP; HTTPS arrives via CONNECT.
    let scheme = Scheme::Http;
    let host = strip_port(&host_header).to_string();
    let port = host_header
        .rsplit_once(':')
        .filter(|(name, _)| !name.is_empty() && *name == host)
        .and_then(|(_, port)| port.parse::<u16>().ok())
        .unwrap_or_else(|| scheme.default_port());

    Ok(RequestTarget {
        url: format!("{}://{}{}", scheme.as_str(), host_header, target),
        scheme,
        host,
        port,
        host_header,
        path: target.to_string(),
    })
}
