use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use http::{Method, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::cache::{AdmissionError, CacheBodyReader, CacheEntry, StoreError};
use crate::io_util::{BestEffortWriter, TeeWriter, copy_with_write_timeout, write_all_with_timeout};
use crate::logging::format_rfc3339;
use crate::util::{timeout_with_context, with_deadline};

use super::AppContext;
use super::body::{
    ChunkEncoder, RequestBodyPlan, relay_response_payload, request_body_plan, stream_request_body,
};
use super::codec::{
    HeaderAccumulator, RequestHead, ResponseBodyPlan, ResponseHead, first_value_map, is_hop_by_hop,
    read_request_head, read_response_head, response_body_plan,
};
use super::request::{RequestTarget, resolve_target};
use super::respond::{send_error_response, shutdown_stream};
use super::tunnel;
use super::upstream::{
    MAX_RESPONSE_HEADER_BYTES, REQUEST_TOTAL_TIMEOUT, RESPONSE_HEADER_TIMEOUT, UPSTREAM_IO_TIMEOUT,
    UpstreamConnection, UpstreamKey, build_upstream_request,
};

const KEEPALIVE_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const REQUEST_HEADER_TIMEOUT: Duration = Duration::from_secs(10);
const CLIENT_IO_TIMEOUT: Duration = Duration::from_secs(90);
const MAX_REQUEST_HEADER_BYTES: usize = 32 * 1024;

enum Disposition {
    Continue,
    Close,
}

/// Whether the fetched response is a candidate for cache admission.
#[derive(Clone, Copy, PartialEq, Eq)]
enum CacheMode {
    /// Forward untouched; no `X-Cache` header.
    Bypass,
    /// Cache-eligible path: tag `X-Cache: MISS` and tee into storage when
    /// the response qualifies.
    Attempt,
}

/// Serve one client connection: a keep-alive loop of requests, each routed
/// to the tunnel, pass-through, or cache path.
///
/// `shutdown` closes idle connections at request boundaries during drain;
/// a request already being handled runs to completion.
pub(crate) async fn serve_connection<S>(
    stream: S,
    peer: SocketAddr,
    app: AppContext,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut reader = BufReader::new(stream);

    loop {
        let next_head = tokio::select! {
            head = read_request_head(
                &mut reader,
                KEEPALIVE_IDLE_TIMEOUT,
                REQUEST_HEADER_TIMEOUT,
                MAX_REQUEST_HEADER_BYTES,
            ) => head,
            _ = shutdown.changed() => break,
        };
        let head = match next_head {
            Ok(Some(head)) => head,
            Ok(None) => break,
            Err(err) => {
                warn!(peer = %peer, error = %err, "invalid request");
                let _ = send_error_response(
                    reader.get_mut(),
                    StatusCode::BAD_REQUEST,
                    "invalid request\r\n",
                    CLIENT_IO_TIMEOUT,
                )
                .await;
                break;
            }
        };

        if head.method == Method::CONNECT {
            let stream = reader.into_inner();
            return tunnel::handle_connect(stream, peer, &head.target, &app).await;
        }

        match handle_request(&mut reader, peer, &app, head).await {
            Ok(Disposition::Continue) => continue,
            Ok(Disposition::Close) => break,
            Err(err) => {
                debug!(peer = %peer, error = %err, "request handling failed");
                break;
            }
        }
    }

    let _ = shutdown_stream(reader.get_mut(), CLIENT_IO_TIMEOUT).await;
    Ok(())
}

async fn handle_request<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    app: &AppContext,
    head: RequestHead,
) -> Result<Disposition>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let method = head.method;
    let headers = head.headers;
    let wants_close = headers.wants_close();

    let target = match resolve_target(&head.target, headers.host()) {
        Ok(target) => target,
        Err(err) => {
            warn!(peer = %peer, error = %err, "unresolvable request target");
            send_error_response(
                reader.get_mut(),
                StatusCode::BAD_REQUEST,
                "invalid request target\r\n",
                CLIENT_IO_TIMEOUT,
            )
            .await?;
            return Ok(Disposition::Close);
        }
    };
    let body_plan = request_body_plan(&headers);

    if method != Method::GET && method != Method::HEAD {
        return forward_upstream(
            reader,
            peer,
            app,
            &method,
            &target,
            &headers,
            body_plan,
            wants_close,
            CacheMode::Bypass,
        )
        .await;
    }

    if app.rules.should_passthrough(&target.url) {
        info!(url = %target.url, "passthrough");
        return forward_upstream(
            reader,
            peer,
            app,
            &method,
            &target,
            &headers,
            body_plan,
            wants_close,
            CacheMode::Bypass,
        )
        .await;
    }

    if let Some((entry, body)) = app.storage.get(&target.url).await {
        let age = entry.created_at_time().elapsed().unwrap_or_default();
        info!(url = %target.url, age_secs = age.as_secs(), "cache hit");
        return serve_cached(reader.get_mut(), app, &method, entry, body, wants_close).await;
    }

    info!(url = %target.url, "cache miss");
    forward_upstream(
        reader,
        peer,
        app,
        &method,
        &target,
        &headers,
        body_plan,
        wants_close,
        CacheMode::Attempt,
    )
    .await
}

/// Stream a cached entry to the client. The body handle owns the per-key
/// lock; it is released when the handle drops at the end of this function.
async fn serve_cached<S>(
    client: &mut S,
    app: &AppContext,
    method: &Method,
    entry: CacheEntry,
    mut body: CacheBodyReader,
    wants_close: bool,
) -> Result<Disposition>
where
    S: AsyncWrite + Unpin,
{
    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(b"HTTP/1.1 200 OK\r\n");
    if !entry.content_type.is_empty() {
        head.extend_from_slice(format!("Content-Type: {}\r\n", entry.content_type).as_bytes());
    }
    for (name, value) in &entry.headers {
        let lower = name.to_ascii_lowercase();
        if is_hop_by_hop(&lower)
            || lower == "content-length"
            || lower == "transfer-encoding"
            || lower == "content-type"
        {
            continue;
        }
        head.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    head.extend_from_slice(format!("Content-Length: {}\r\n", entry.size).as_bytes());
    head.extend_from_slice(b"X-Cache: HIT\r\n");
    head.extend_from_slice(
        format!("X-Cache-Created: {}\r\n", format_rfc3339(entry.created_at_time())).as_bytes(),
    );
    if wants_close {
        head.extend_from_slice(b"Connection: close\r\n");
    }
    head.extend_from_slice(b"\r\n");

    write_all_with_timeout(client, &head, CLIENT_IO_TIMEOUT, "writing cached response head")
        .await?;

    if method != Method::HEAD {
        copy_with_write_timeout(
            &mut body,
            client,
            app.settings.buffer_size_bytes(),
            CLIENT_IO_TIMEOUT,
            "writing cached response body",
        )
        .await?;
    }
    timeout_with_context(CLIENT_IO_TIMEOUT, client.flush(), "flushing cached response").await?;

    Ok(if wants_close {
        Disposition::Close
    } else {
        Disposition::Continue
    })
}

/// Forward a request to the origin. With [`CacheMode::Attempt`] the response
/// body is teed through an in-memory pipe into `Storage::put` while it
/// streams to the client.
#[allow(clippy::too_many_arguments)]
async fn forward_upstream<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    app: &AppContext,
    method: &Method,
    target: &RequestTarget,
    headers: &HeaderAccumulator,
    body_plan: RequestBodyPlan,
    wants_close: bool,
    cache_mode: CacheMode,
) -> Result<Disposition>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let key = UpstreamKey::from_target(target);
    let request_bytes = build_upstream_request(method, target, headers, body_plan);
    // A pooled connection may have been closed by the origin; retry once on
    // a fresh one, but only when no request body was consumed.
    let can_retry = matches!(body_plan, RequestBodyPlan::Empty);
    let mut retried = false;

    loop {
        let (mut conn, reused) = match app.pool.take_idle(&key) {
            Some(conn) => (conn, true),
            None => {
                let dial = async {
                    let permit = app.pool.reserve(&key).await?;
                    UpstreamConnection::connect(target, &app.egress, &app.tls, permit).await
                };
                match with_deadline(
                    REQUEST_TOTAL_TIMEOUT,
                    dial,
                    "waiting for an upstream connection slot",
                )
                .await
                {
                    Ok(conn) => (conn, false),
                    Err(err) => {
                        warn!(url = %target.url, error = %err, "upstream connect failed");
                        send_error_response(
                            reader.get_mut(),
                            StatusCode::BAD_GATEWAY,
                            "Failed to fetch resource\r\n",
                            CLIENT_IO_TIMEOUT,
                        )
                        .await?;
                        return Ok(Disposition::Close);
                    }
                }
            }
        };

        let exchange = async {
            write_all_with_timeout(
                &mut conn.stream,
                &request_bytes,
                UPSTREAM_IO_TIMEOUT,
                "sending request to upstream",
            )
            .await?;
            stream_request_body(reader, &mut conn.stream, body_plan, UPSTREAM_IO_TIMEOUT).await?;
            timeout_with_context(
                UPSTREAM_IO_TIMEOUT,
                conn.stream.flush(),
                "flushing request to upstream",
            )
            .await
        };
        if let Err(err) = exchange.await {
            if reused && can_retry && !retried {
                debug!(url = %target.url, error = %err, "pooled connection failed; retrying");
                retried = true;
                continue;
            }
            warn!(url = %target.url, error = %err, "upstream request failed");
            send_error_response(
                reader.get_mut(),
                StatusCode::BAD_GATEWAY,
                "Failed to fetch resource\r\n",
                CLIENT_IO_TIMEOUT,
            )
            .await?;
            return Ok(Disposition::Close);
        }

        let mut upstream_reader = BufReader::new(&mut conn.stream);
        let response_head = match read_response_head(
            &mut upstream_reader,
            RESPONSE_HEADER_TIMEOUT,
            MAX_RESPONSE_HEADER_BYTES,
        )
        .await
        {
            Ok(head) => head,
            Err(err) => {
                if reused && can_retry && !retried {
                    debug!(url = %target.url, error = %err, "pooled connection went stale; retrying");
                    retried = true;
                    continue;
                }
                warn!(url = %target.url, error = %err, "upstream response failed");
                send_error_response(
                    reader.get_mut(),
                    StatusCode::BAD_GATEWAY,
                    "Failed to fetch resource\r\n",
                    CLIENT_IO_TIMEOUT,
                )
                .await?;
                return Ok(Disposition::Close);
            }
        };

        let response_plan = response_body_plan(method, &response_head);
        let client_close = wants_close || matches!(response_plan, ResponseBodyPlan::UntilClose);
        let reuse_upstream =
            !response_head.connection_close && !matches!(response_plan, ResponseBodyPlan::UntilClose);

        let mut ttl = Duration::ZERO;
        let mut should_store = false;
        if cache_mode == CacheMode::Attempt && response_head.status == StatusCode::OK {
            ttl = app
                .rules
                .effective_ttl(&target.url, response_head.first_value("cache-control"));
            should_store = !ttl.is_zero() && !matches!(response_plan, ResponseBodyPlan::Empty);
        }

        let extra_headers: Vec<(&str, String)> = match cache_mode {
            CacheMode::Attempt => vec![("X-Cache", "MISS".to_string())],
            CacheMode::Bypass => Vec::new(),
        };
        let encoded_head = response_head.encode(response_plan, &extra_headers, client_close);
        write_all_with_timeout(
            reader.get_mut(),
            &encoded_head,
            CLIENT_IO_TIMEOUT,
            "writing response head to client",
        )
        .await?;

        let relay_result = if should_store {
            relay_with_cache_tee(
                reader.get_mut(),
                &mut upstream_reader,
                response_plan,
                app,
                target,
                &response_head,
                ttl,
            )
            .await
        } else {
            relay_plain(reader.get_mut(), &mut upstream_reader, response_plan).await
        };
        drop(upstream_reader);

        let copied = match relay_result {
            Ok(copied) => copied,
            Err(err) => {
                debug!(url = %target.url, error = %err, "response relay failed");
                return Err(err);
            }
        };
        timeout_with_context(
            CLIENT_IO_TIMEOUT,
            reader.get_mut().flush(),
            "flushing response to client",
        )
        .await?;
        debug!(url = %target.url, status = %response_head.status, bytes = copied, "forwarded");

        if reuse_upstream {
            app.pool.release(key, conn);
        } else {
            conn.shutdown(UPSTREAM_IO_TIMEOUT).await;
        }

        return Ok(if client_close {
            Disposition::Close
        } else {
            Disposition::Continue
        });
    }
}

/// Relay the response payload straight to the client, re-framing as needed.
async fn relay_plain<C, S>(
    client: &mut C,
    upstream_reader: &mut BufReader<S>,
    plan: ResponseBodyPlan,
) -> Result<u64>
where
    C: AsyncWrite + Unpin,
    S: AsyncRead + Unpin,
{
    match plan {
        ResponseBodyPlan::Chunked => {
            let mut encoder = ChunkEncoder::new(client);
            let copied = with_deadline(
                REQUEST_TOTAL_TIMEOUT,
                relay_response_payload(upstream_reader, &mut encoder, plan, UPSTREAM_IO_TIMEOUT),
                "relaying response body",
            )
            .await?;
            encoder.finish().await.context("finishing chunked body")?;
            Ok(copied)
        }
        _ => {
            with_deadline(
                REQUEST_TOTAL_TIMEOUT,
                relay_response_payload(upstream_reader, client, plan, UPSTREAM_IO_TIMEOUT),
                "relaying response body",
            )
            .await
        }
    }
}

/// The tee: one upstream read serves the client and feeds `Storage::put`
/// through an in-memory pipe.
///
/// The client side of the tee is authoritative; cache-side write failures are
/// swallowed by a best-effort wrapper and logged once the relay ends. Closing
/// the pipe writer after the relay gives the storage task its EOF, and its
/// admission check (byte count vs `Content-Length`) rejects short streams.
async fn relay_with_cache_tee<C, S>(
    client: &mut C,
    upstream_reader: &mut BufReader<S>,
    plan: ResponseBodyPlan,
    app: &AppContext,
    target: &RequestTarget,
    response_head: &ResponseHead,
    ttl: Duration,
) -> Result<u64>
where
    C: AsyncWrite + Unpin,
    S: AsyncRead + Unpin,
{
    let content_type = response_head
        .first_value("content-type")
        .unwrap_or_default()
        .to_string();
    let stored_headers = first_value_map(response_head.headers.iter());
    let expected_size = response_head.content_length;

    let (pipe_writer, pipe_reader) = tokio::io::duplex(app.settings.buffer_size_bytes());
    let storage = app.storage.clone();
    let url = target.url.clone();
    let put_task = tokio::spawn(async move {
        storage
            .put(&url, &content_type, stored_headers, ttl, pipe_reader, expected_size)
            .await
    });

    let mut cache_sink = BestEffortWriter::new(pipe_writer);
    let relay_result = match plan {
        ResponseBodyPlan::Chunked => {
            let mut encoder = ChunkEncoder::new(&mut *client);
            let result = {
                let mut tee = TeeWriter::new(&mut encoder, &mut cache_sink);
                with_deadline(
                    REQUEST_TOTAL_TIMEOUT,
                    relay_response_payload(upstream_reader, &mut tee, plan, UPSTREAM_IO_TIMEOUT),
                    "relaying response body",
                )
                .await
            };
            match result {
                Ok(copied) => encoder
                    .finish()
                    .await
                    .context("finishing chunked body")
                    .map(|()| copied),
                Err(err) => Err(err),
            }
        }
        _ => {
            let mut tee = TeeWriter::new(&mut *client, &mut cache_sink);
            with_deadline(
                REQUEST_TOTAL_TIMEOUT,
                relay_response_payload(upstream_reader, &mut tee, plan, UPSTREAM_IO_TIMEOUT),
                "relaying response body",
            )
            .await
        }
    };

    if let Some(err) = cache_sink.take_error() {
        debug!(url = %target.url, error = %err, "cache pipe write failed");
    }
    // EOF for the storage task; errors here only mean the task is gone.
    let _ = cache_sink.shutdown().await;
    drop(cache_sink);

    let put_result = put_task.await;
    log_put_outcome(&target.url, ttl, put_result);

    relay_result
}

fn log_put_outcome(
    url: &str,
    ttl: Duration,
    result: Result<Result<u64, StoreError>, tokio::task::JoinError>,
) {
    match result {
        Ok(Ok(size)) => {
            info!(url, ttl_secs = ttl.as_secs(), size, "cache stored");
        }
        Ok(Err(StoreError::Rejected(rejection))) => match rejection {
            AdmissionError::Empty | AdmissionError::SizeMismatch { .. } => {
                warn!(url, reason = %rejection, "cache admission rejected");
            }
            AdmissionError::TooSmall { .. } | AdmissionError::TooLarge { .. } => {
                info!(url, reason = %rejection, "cache admission skipped");
            }
        },
        Ok(Err(StoreError::Io(err))) => {
            warn!(url, error = %err, "cache store failed");
        }
        Err(err) => {
            warn!(url, error = %err, "cache store task failed");
        }
    }
}

