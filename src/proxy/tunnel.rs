use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use crate::io_util::write_all_with_timeout;

use super::AppContext;
use super::respond::send_error_response;

pub(crate) const CONNECT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle a CONNECT request: gate the target host against the HTTPS
/// pass-through list, then splice bytes both ways until either side closes.
/// The tunneled stream is opaque; the cache is never consulted.
pub(crate) async fn handle_connect<S>(
    mut client: S,
    peer: SocketAddr,
    target: &str,
    app: &AppContext,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (host, port) = parse_connect_target(target)?;

    if !app.rules.should_allow_https(&host) {
        info!(peer = %peer, target, "CONNECT blocked: host not in https_passthrough");
        send_error_response(
            &mut client,
            StatusCode::FORBIDDEN,
            "CONNECT not allowed for this destination\r\n",
            CONNECT_IO_TIMEOUT,
        )
        .await?;
        return Ok(());
    }

    info!(peer = %peer, target, "CONNECT allowed");

    let mut upstream = match app.egress.dial(&host, port, CONNECT_DIAL_TIMEOUT).await {
        Ok(stream) => stream,
        Err(err) => {
            debug!(peer = %peer, target, error = %err, "CONNECT dial failed");
            send_error_response(
                &mut client,
                StatusCode::BAD_GATEWAY,
                "Failed to connect to destination\r\n",
                CONNECT_IO_TIMEOUT,
            )
            .await?;
            return Ok(());
        }
    };

    write_all_with_timeout(
        &mut client,
        b"HTTP/1.1 200 Connection Established\r\n\r\n",
        CONNECT_IO_TIMEOUT,
        "writing CONNECT response",
    )
    .await?;

    // Raw byte shuffle; ends when either side closes.
    let result = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
    match result {
        Ok((from_client, from_upstream)) => {
            debug!(
                peer = %peer,
                target,
                bytes_out = from_client,
                bytes_in = from_upstream,
                "CONNECT tunnel closed"
            );
        }
        Err(err) => {
            debug!(peer = %peer, target, error = %err, "CONNECT tunnel aborted");
        }
    }

    let _ = client.shutdown().await;
    let _ = upstream.shutdown().await;
    Ok(())
}

/// Split `host[:port]` from a CONNECT request line; the port defaults to 443.
pub(crate) fn parse_connect_target(target: &str) -> Result<(String, u16)> {
    let target = target.trim();
    if target.is_empty() {
        bail!("empty CONNECT target");
    }

    if let Some(rest) = target.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .with_context(|| format!("unterminated IPv6 literal in CONNECT target '{target}'"))?;
        let port = match after {
            "" => 443,
            _ => after
                .strip_prefix(':')
                .with_context(|| format!("malformed CONNECT target '{target}'"))?
                .parse::<u16>()
                .with_context(|| format!("invalid port in CONNECT target '{target}'"))?,
        };
        return Ok((host.to_string(), port));
    }

    match target.rsplit_once(':') {
        Some((host, port)) => {
            if host.is_empty() || host.contains(':') {
                bail!("malformed CONNECT target '{target}'");
            }
            let port = port
                .parse::<u16>()
                .with_context(|| format!("invalid port in CONNECT target '{target}'"))?;
            Ok((host.to_string(), port))
        }
        None => Ok((target.to_string(), 443)),
    }
}
