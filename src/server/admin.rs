//! Management API (§4.H): JSON control-plane routes plus an SSE log tail,
//! served on its own listener independent of the proxy ingress.

use super::GatewayState;
use crate::logger::LogRecord;
use crate::proxy::{empty_body, full_body, BoxBody};
use bytes::Bytes;
use http_body_util::{BodyExt, Limited, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::{Request, Response, StatusCode};
use std::time::Duration;
use tokio::sync::broadcast;

/// Mutation request bodies (toggle, add key) are tiny JSON objects; cap
/// well below the proxy's 10 MiB buffering limit.
const MAX_ADMIN_BODY_BYTES: usize = 1024 * 1024;
const SSE_REPLAY_COUNT: usize = 30;
const SSE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

pub async fn handle_admin(
    req: Request<Incoming>,
    state: GatewayState,
) -> Result<Response<BoxBody>, hyper::Error> {
    let path = req.uri().path().to_string();

    // `/api/logs` accepts a `?token=` query param fallback so a browser
    // EventSource (which can't set an Authorization header) can still
    // authenticate; every other route under `/api/` is Bearer-gated the
    // same way.
    if path.starts_with("/api/") && !is_authorized(&req, &state) {
        return Ok(json_response(StatusCode::UNAUTHORIZED, r#"{"error":"unauthorized"}"#));
    }

    let method = req.method().clone();
    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();

    match (method.as_str(), segments.as_slice()) {
        ("GET", ["api", "status"]) => Ok(handle_status(&state)),
        ("GET", ["api", "channels"]) => Ok(handle_channels(&state)),
        ("GET", ["api", "stats"]) => Ok(handle_stats(&state)),
        ("POST", ["api", "channels", name, "toggle"]) => Ok(handle_toggle(&state, name)),
        ("POST", ["api", "channels", name, "keys"]) => {
            let body = read_admin_body(req.into_body()).await;
            Ok(handle_add_key(&state, name, body))
        }
        ("DELETE", ["api", "channels", name, "keys", idx]) => Ok(handle_remove_key(&state, name, idx)),
        ("GET", ["api", "logs", "recent"]) => Ok(handle_logs_recent(&state)),
        ("GET", ["api", "logs"]) => Ok(handle_logs_sse(&state)),
        ("POST", ["api", "config", "reload"]) => Ok(handle_config_reload(&state)),
        ("GET", ["api", "metrics"]) => Ok(handle_metrics(&state)),
        _ => Ok(json_response(StatusCode::NOT_FOUND, r#"{"error":"not found"}"#)),
    }
}

fn is_authorized(req: &Request<Incoming>, state: &GatewayState) -> bool {
    let Some(expected) = state.config.load().ui_auth_token.clone() else {
        return true;
    };
    if let Some(header) = req.headers().get(http::header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(token) = header.strip_prefix("Bearer ") {
            if token == expected {
                return true;
            }
        }
    }
    req.uri()
        .query()
        .and_then(|q| url_query_param(q, "token"))
        .map(|t| t == expected)
        .unwrap_or(false)
}

fn url_query_param(query: &str, key: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let mut it = pair.splitn(2, '=');
        let k = it.next()?;
        let v = it.next().unwrap_or("");
        (k == key).then(|| v.to_string())
    })
}

fn handle_status(state: &GatewayState) -> Response<BoxBody> {
    let mut total = 0u32;
    let mut healthy = 0u32;
    state.channels.for_each(|_, ch| {
        total += 1;
        if ch.health() == crate::channel::HealthState::Healthy {
            healthy += 1;
        }
    });
    let body = serde_json::json!({
        "status": "running",
        "uptimeSecs": state.uptime_secs(),
        "channels": {"healthy": healthy, "total": total},
        "version": env!("CARGO_PKG_VERSION"),
    });
    json_response(StatusCode::OK, &body.to_string())
}

fn handle_channels(state: &GatewayState) -> Response<BoxBody> {
    json_response(StatusCode::OK, &state.channels.to_json().to_string())
}

fn handle_stats(state: &GatewayState) -> Response<BoxBody> {
    let mut channels = Vec::new();
    let mut total_requests = 0u64;
    let mut total_success = 0u64;
    let mut total_fail = 0u64;
    state.channels.for_each(|_, ch| {
        let json = ch.to_json();
        let req = json["stats"]["totalRequests"].as_u64().unwrap_or(0);
        let ok = json["stats"]["successCount"].as_u64().unwrap_or(0);
        let fail = json["stats"]["failCount"].as_u64().unwrap_or(0);
        total_requests += req;
        total_success += ok;
        total_fail += fail;
        channels.push(serde_json::json!({
            "name": ch.name(),
            "totalRequests": req,
            "successCount": ok,
            "failCount": fail,
            "successRate": success_rate(ok, req),
        }));
    });
    let body = serde_json::json!({
        "totalRequests": total_requests,
        "successCount": total_success,
        "failCount": total_fail,
        "successRate": success_rate(total_success, total_requests),
        "channels": channels,
    });
    json_response(StatusCode::OK, &body.to_string())
}

fn success_rate(ok: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        ok as f64 / total as f64
    }
}

fn handle_toggle(state: &GatewayState, name: &str) -> Response<BoxBody> {
    let Some(channel) = state.channels.get(name) else {
        return json_response(StatusCode::NOT_FOUND, r#"{"error":"channel not found"}"#);
    };
    // Idempotent flip over the channel's `enabled` flag, which otherwise
    // only ever changes via a config reload.
    channel.set_enabled(!channel.is_enabled());
    json_response(StatusCode::OK, &channel.to_json().to_string())
}

fn handle_add_key(state: &GatewayState, name: &str, body: Option<Bytes>) -> Response<BoxBody> {
    let Some(channel) = state.channels.get(name) else {
        return json_response(StatusCode::NOT_FOUND, r#"{"error":"channel not found"}"#);
    };
    let Some(body) = body else {
        return json_response(StatusCode::BAD_REQUEST, r#"{"error":"missing request body"}"#);
    };
    let key = serde_json::from_slice::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("key").and_then(|k| k.as_str()).map(|s| s.to_string()));
    let Some(key) = key else {
        return json_response(StatusCode::BAD_REQUEST, r#"{"error":"expected a {\"key\": \"...\"} body"}"#);
    };
    channel.add_key(key);
    json_response(StatusCode::OK, &channel.to_json().to_string())
}

fn handle_remove_key(state: &GatewayState, name: &str, idx: &str) -> Response<BoxBody> {
    let Some(channel) = state.channels.get(name) else {
        return json_response(StatusCode::NOT_FOUND, r#"{"error":"channel not found"}"#);
    };
    let Ok(index) = idx.parse::<usize>() else {
        return json_response(StatusCode::BAD_REQUEST, r#"{"error":"invalid key index"}"#);
    };
    if !channel.remove_key(index) {
        return json_response(StatusCode::BAD_REQUEST, r#"{"error":"key index out of range"}"#);
    }
    json_response(StatusCode::OK, &channel.to_json().to_string())
}

fn handle_logs_recent(state: &GatewayState) -> Response<BoxBody> {
    let body = serde_json::to_string(&state.bus.recent_n(50)).unwrap_or_else(|_| "[]".to_string());
    json_response(StatusCode::OK, &body)
}

fn handle_config_reload(state: &GatewayState) -> Response<BoxBody> {
    let path = state.config_path.clone();
    match crate::config::GatewayConfig::reload(&path) {
        Ok(cfg) => match state.reload(cfg) {
            Ok(()) => {
                metrics::counter!("gateway_config_reloads_total", "result" => "ok").increment(1);
                state.bus.info("config", "configuration reloaded via admin API");
                json_response(StatusCode::OK, r#"{"status":"reloaded"}"#)
            }
            Err(e) => {
                metrics::counter!("gateway_config_reloads_total", "result" => "error").increment(1);
                json_response(StatusCode::BAD_REQUEST, &format!(r#"{{"error":"{e}"}}"#))
            }
        },
        Err(e) => {
            metrics::counter!("gateway_config_reloads_total", "result" => "error").increment(1);
            json_response(StatusCode::BAD_REQUEST, &format!(r#"{{"error":"{e}"}}"#))
        }
    }
}

fn handle_metrics(state: &GatewayState) -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
        .body(full_body(state.metrics.render()))
        .unwrap()
}

/// Replays the last `SSE_REPLAY_COUNT` log records, then tails the live
/// event bus, interleaving a `:heartbeat` comment line every
/// `SSE_HEARTBEAT_INTERVAL` so an idle stream between the client and this
/// server doesn't get timed out by something in between.
fn handle_logs_sse(state: &GatewayState) -> Response<BoxBody> {
    struct SseState {
        replay: std::collections::VecDeque<LogRecord>,
        rx: broadcast::Receiver<LogRecord>,
        heartbeat: tokio::time::Interval,
    }

    let initial = SseState {
        replay: state.bus.recent_n(SSE_REPLAY_COUNT).into(),
        rx: state.bus.subscribe(),
        heartbeat: tokio::time::interval(SSE_HEARTBEAT_INTERVAL),
    };

    let stream = futures_util::stream::unfold(initial, |mut st| async move {
        if let Some(record) = st.replay.pop_front() {
            return Some((Ok::<_, hyper::Error>(Frame::data(sse_chunk(&record))), st));
        }
        loop {
            tokio::select! {
                received = st.rx.recv() => {
                    match received {
                        Ok(record) => return Some((Ok(Frame::data(sse_chunk(&record))), st)),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
                _ = st.heartbeat.tick() => {
                    return Some((Ok(Frame::data(Bytes::from_static(b":heartbeat\n\n"))), st));
                }
            }
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .body(StreamBody::new(stream).boxed())
        .unwrap()
}

fn sse_chunk(record: &LogRecord) -> Bytes {
    let json = serde_json::to_string(record).unwrap_or_else(|_| "{}".to_string());
    Bytes::from(format!("data: {json}\n\n"))
}

async fn read_admin_body(body: Incoming) -> Option<Bytes> {
    let limited = Limited::new(body, MAX_ADMIN_BODY_BYTES);
    limited.collect().await.ok().map(|c| c.to_bytes())
}

fn json_response(status: StatusCode, body: &str) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(if body.is_empty() { empty_body() } else { full_body(body.to_string()) })
        .unwrap()
}
