//! Component E: streaming reverse proxy (§4.E).
//!
//! One state machine per inbound request: buffer the body -> select a
//! channel -> dispatch upstream -> classify the response -> either
//! stream it down, back off and retry, or give up with a JSON error
//! envelope.

use crate::channel::Channel;
use crate::config::GatewayConfig;
use crate::error::ErrorKind;
use crate::logger::{EventBus, Level};
use crate::proxy::context::{full_body, BoxBody, RequestContext};
use crate::retry;
use crate::router::Router;
use arc_swap::ArcSwap;
use bytes::Bytes;
use http::header::{AUTHORIZATION, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderName, HeaderValue, StatusCode};
use http_body_util::{BodyExt, Limited};
use hyper::body::Incoming;
use hyper::{Request, Response};
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;

/// Body larger than this is rejected with 413 rather than buffered for a
/// retry (§5 "Resource limits").
const MAX_BUFFERED_BODY_BYTES: usize = 10 * 1024 * 1024;
/// Time allotted to read the full request body when buffering it.
const BODY_READ_TIMEOUT: Duration = Duration::from_secs(15);
/// Time allotted for the upstream to accept the connection and start
/// sending response headers.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything the proxy handler needs pulled out of `GatewayState` so it
/// doesn't depend on the whole server module — a narrow, cloneable deps
/// bundle handed to every connection the same way the teacher gateway
/// hands handlers a slice of its application state.
#[derive(Clone)]
pub struct ProxyDeps {
    pub router: Arc<Router>,
    pub config: Arc<ArcSwap<GatewayConfig>>,
    pub bus: EventBus,
}

pub async fn handle_request(
    req: Request<Incoming>,
    peer_addr: SocketAddr,
    deps: &ProxyDeps,
) -> Response<BoxBody> {
    let request_id = new_request_id();
    let method = req.method().to_string();
    let uri_path = req.uri().path().to_string();
    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let mut ctx = RequestContext::new(request_id, host, uri_path.clone(), method, peer_addr.ip());
    metrics::gauge!("gateway_http_requests_in_flight").increment(1.0);

    let (parts, body) = req.into_parts();
    let retry_cfg = deps.config.load().settings.retry.clone();
    let max_attempts = retry::max_attempts(&retry_cfg);

    // BUFFERING: always buffer, under the same §5 size/timeout guards,
    // even with retries disabled (`maxRetries: 0`) — those guards are a
    // property of every request, not of the retry loop, and a
    // single-attempt config still has to forward the body it received
    // rather than substitute an empty one.
    let buffered_body: Bytes = match read_limited_body(body).await {
        Ok(b) => b,
        Err(BodyReadError::TooLarge) => {
            return ctx.error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "request body exceeds the maximum allowed size",
                ErrorKind::ProxyError,
            );
        }
        Err(BodyReadError::TimedOut) => {
            return ctx.error_response(
                StatusCode::REQUEST_TIMEOUT,
                "timed out reading request body",
                ErrorKind::ProxyError,
            );
        }
        Err(BodyReadError::Malformed) => {
            return ctx.error_response(
                StatusCode::BAD_REQUEST,
                "failed to read request body",
                ErrorKind::ProxyError,
            );
        }
    };

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or(uri_path);

    loop {
        ctx.attempt += 1;

        let Some(resolution) = deps.router.resolve(&ctx.uri_path, &ctx.excluded_channels) else {
            return ctx.error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "no channel available",
                ErrorKind::ProxyError,
            );
        };
        let channel = resolution.channel;
        ctx.channel_name = channel.name().to_string();

        let Some(key) = channel.pick_key() else {
            ctx.excluded_channels.push(channel.name().to_string());
            if ctx.attempt >= max_attempts {
                return ctx.error_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "no channel available",
                    ErrorKind::ProxyError,
                );
            }
            continue;
        };

        let upstream_req = match build_upstream_request(&parts, buffered_body.clone(), &channel, &path_and_query, &key)
        {
            Ok(r) => r,
            Err(_) => {
                return ctx.error_response(
                    StatusCode::BAD_GATEWAY,
                    "failed to build upstream request",
                    ErrorKind::ProxyError,
                );
            }
        };

        ctx.upstream_start = Some(Instant::now());
        let attempt_start = Instant::now();
        let outcome = match timeout(UPSTREAM_TIMEOUT, channel.http_client().request(upstream_req)).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("upstream timed out".to_string()),
        };

        match outcome {
            Ok(upstream_resp) => {
                let status = upstream_resp.status().as_u16();
                let latency_ms = attempt_start.elapsed().as_millis() as u64;

                // Upstream dispatch contract (§4.E): only this fixed status
                // set is buffered for classification; everything else
                // streams straight through as a successful dispatch, even a
                // plain 404 — the buffer/stream split is not the same axis
                // as the configurable `retryOn` policy.
                if !is_buffered_status(status) {
                    channel.mark_key_success(&key);
                    channel.record_success(latency_ms);
                    ctx.finalize_metrics(status);
                    log_access(&deps.bus, &ctx, status, latency_ms);
                    return build_downstream_response(upstream_resp);
                }

                let retry_after = upstream_resp
                    .headers()
                    .get(http::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(retry::parse_retry_after);
                let (parts, body) = upstream_resp.into_parts();
                let buffered = collect_response_body(body).await.unwrap_or_default();

                // CLASSIFY. 401/403/429 mark the credential bad; 429 is a
                // rate limit rather than a credential failure but is dealt
                // with the same way: rotate keys on the same channel.
                if retry::is_key_failure(status) || status == 429 {
                    channel.mark_key_failed(&key);
                }
                if retry::is_channel_failure(status) {
                    channel.record_failure(&format!("status {status}"));
                    ctx.excluded_channels.push(channel.name().to_string());
                    metrics::counter!("gateway_channel_failover_total", "channel" => channel.name().to_string())
                        .increment(1);
                }

                // A key failure always warrants rotating to another
                // credential regardless of the configured retryable-status
                // list; otherwise the configured policy decides.
                let should_retry = retry::is_key_failure(status) || retry::should_retry(status, &retry_cfg);
                if !should_retry || ctx.attempt >= max_attempts {
                    ctx.finalize_metrics(status);
                    log_access(&deps.bus, &ctx, status, latency_ms);
                    return build_buffered_response(parts, buffered);
                }

                // BACKOFF. A client disconnect mid-wait cancels this sleep
                // for free: this whole function is polled as part of the
                // connection task `run_proxy_server` spawned for the
                // socket, so the task (and everything it's polling) is
                // dropped as soon as hyper's connection driver notices the
                // peer is gone (§5 "in-progress retry backoff is
                // cancelled").
                let wait = retry_after.unwrap_or_else(|| retry::delay(ctx.attempt, &retry_cfg));
                metrics::counter!("gateway_retry_total", "channel" => channel.name().to_string()).increment(1);
                tokio::time::sleep(wait).await;
            }
            Err(err) => {
                channel.record_failure(&err);
                ctx.excluded_channels.push(channel.name().to_string());
                deps.bus.log(Level::Warn, "retry", format!("channel '{}' transport error: {err}", channel.name()));

                if ctx.attempt >= max_attempts {
                    return ctx.error_response(
                        StatusCode::BAD_GATEWAY,
                        "upstream request failed",
                        ErrorKind::UpstreamError,
                    );
                }
                tokio::time::sleep(retry::delay(ctx.attempt, &retry_cfg)).await;
            }
        }
    }
}

enum BodyReadError {
    TooLarge,
    TimedOut,
    Malformed,
}

async fn read_limited_body(body: Incoming) -> Result<Bytes, BodyReadError> {
    let limited = Limited::new(body, MAX_BUFFERED_BODY_BYTES);
    let collected = timeout(BODY_READ_TIMEOUT, limited.collect())
        .await
        .map_err(|_| BodyReadError::TimedOut)?;
    match collected {
        Ok(c) => Ok(c.to_bytes()),
        Err(e) => {
            if e.downcast_ref::<http_body_util::LengthLimitError>().is_some() {
                Err(BodyReadError::TooLarge)
            } else {
                Err(BodyReadError::Malformed)
            }
        }
    }
}

fn build_upstream_request(
    parts: &http::request::Parts,
    body: Bytes,
    channel: &Channel,
    path_and_query: &str,
    key: &str,
) -> Result<Request<BoxBody>, http::Error> {
    let mut uri_string = String::with_capacity(channel.target().len() + path_and_query.len());
    uri_string.push_str(channel.target().trim_end_matches('/'));
    uri_string.push_str(path_and_query);

    let mut headers = parts.headers.clone();
    strip_proxy_headers(&mut headers);

    if let Ok(target_uri) = channel.target().parse::<http::Uri>() {
        if let Some(authority) = target_uri.authority() {
            if let Ok(v) = HeaderValue::from_str(authority.as_str()) {
                headers.insert(HOST, v);
            }
        }
    }
    if let Ok(v) = HeaderValue::from_str(&format!("Bearer {key}")) {
        headers.insert(AUTHORIZATION, v);
    }

    let body = full_body(body);

    let mut builder = Request::builder().method(&parts.method).uri(uri_string);
    *builder.headers_mut().expect("builder not yet finalized") = headers;
    builder.body(body)
}

/// Strips hop-by-hop and identity-revealing headers before forwarding
/// (§4.E): connection, keep-alive, transfer-encoding, upgrade,
/// proxy-connection, proxy-authorization, every `x-forwarded-*`,
/// x-real-ip, via, forwarded, authorization (replaced with the selected
/// credential), and content-length (recomputed by the client).
fn strip_proxy_headers(headers: &mut http::HeaderMap) {
    let fixed: &[HeaderName] = &[
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        TRANSFER_ENCODING,
        HeaderName::from_static("upgrade"),
        HeaderName::from_static("proxy-connection"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("x-real-ip"),
        HeaderName::from_static("via"),
        HeaderName::from_static("forwarded"),
        AUTHORIZATION,
        CONTENT_LENGTH,
    ];
    for h in fixed {
        headers.remove(h);
    }
    let xfwd: Vec<HeaderName> = headers.keys().filter(|k| k.as_str().starts_with("x-forwarded-")).cloned().collect();
    for h in xfwd {
        headers.remove(h);
    }
}

/// The fixed set of statuses the upstream dispatch contract buffers in
/// full for classification (§4.E) — independent of the configurable
/// `retryOn` policy, which only governs whether a buffered status is
/// actually retried or forwarded as-is.
fn is_buffered_status(status: u16) -> bool {
    matches!(status, 401 | 403 | 429 | 502 | 503 | 504)
}

async fn collect_response_body(body: Incoming) -> Result<Bytes, hyper::Error> {
    Ok(body.collect().await?.to_bytes())
}

fn build_buffered_response(parts: http::response::Parts, body: Bytes) -> Response<BoxBody> {
    Response::from_parts(parts, full_body(body))
}

fn build_downstream_response(upstream_resp: Response<Incoming>) -> Response<BoxBody> {
    let (mut parts, body) = upstream_resp.into_parts();
    if is_sse(&parts.headers) {
        parts.headers.insert(http::header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    }
    Response::from_parts(parts, body.boxed())
}

fn is_sse(headers: &http::HeaderMap) -> bool {
    headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("text/event-stream"))
        .unwrap_or(false)
}

fn log_access(bus: &EventBus, ctx: &RequestContext, status: u16, upstream_latency_ms: u64) {
    bus.log(
        Level::Info,
        "request",
        format!(
            "{} {} channel={} status={} total_ms={} upstream_ms={}",
            ctx.method,
            ctx.uri_path,
            ctx.channel_name,
            status,
            ctx.start.elapsed().as_millis(),
            upstream_latency_ms,
        ),
    );
}

fn new_request_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_proxy_headers_removes_hop_and_identity_headers() {
        let mut headers = http::HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer old"));
        headers.insert(HeaderName::from_static("x-forwarded-for"), HeaderValue::from_static("1.2.3.4"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("10"));
        strip_proxy_headers(&mut headers);
        assert!(headers.get(CONNECTION).is_none());
        assert!(headers.get(AUTHORIZATION).is_none());
        assert!(headers.get(HeaderName::from_static("x-forwarded-for")).is_none());
        assert!(headers.get(CONTENT_LENGTH).is_none());
    }

    #[test]
    fn is_sse_detects_event_stream_content_type() {
        let mut headers = http::HeaderMap::new();
        headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream; charset=utf-8"));
        assert!(is_sse(&headers));
    }

    #[test]
    fn is_sse_false_for_json() {
        let mut headers = http::HeaderMap::new();
        headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        assert!(!is_sse(&headers));
    }

    #[test]
    fn request_id_is_hex_and_unique_enough() {
        let a = new_request_id();
        let b = new_request_id();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }
}
