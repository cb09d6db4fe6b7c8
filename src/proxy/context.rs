use crate::error::{error_envelope, ErrorKind};
use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use std::net::IpAddr;
use std::time::Instant;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// In-flight request context (§3). Carries everything the retry loop
/// needs to reconstruct the request on each attempt, plus the bookkeeping
/// needed to emit one access-log line and one set of metrics no matter
/// which phase the request exits from.
///
/// There is no `client_disconnected` flag here: this struct's owning
/// future (`proxy::handle_request`) is polled directly as part of the
/// hyper connection task that owns the socket (`server::run_proxy_server`
/// spawns one task per connection and drives `handle_request` inside
/// it). When hyper's connection driver detects the peer went away it
/// drops that task, which drops every future it's polling — including a
/// backoff `tokio::time::sleep` mid-wait — so disconnect cancellation
/// falls out of ordinary `Drop` semantics rather than a polled flag.
pub struct RequestContext {
    pub request_id: String,
    pub host: String,
    pub uri_path: String,
    pub method: String,
    pub client_ip: IpAddr,
    pub start: Instant,

    pub channel_name: String,
    pub upstream_start: Option<Instant>,
    pub attempt: u32,
    pub excluded_channels: Vec<String>,
}

impl RequestContext {
    pub fn new(
        request_id: String,
        host: String,
        uri_path: String,
        method: String,
        client_ip: IpAddr,
    ) -> Self {
        Self {
            request_id,
            host,
            uri_path,
            method,
            client_ip,
            start: Instant::now(),
            channel_name: String::new(),
            upstream_start: None,
            attempt: 0,
            excluded_channels: Vec::new(),
        }
    }

    /// Builds the §7 JSON error envelope and records the same metrics a
    /// forwarded response would get — the single exit point for every
    /// synthesized error response.
    pub fn error_response(
        &self,
        status: StatusCode,
        msg: &str,
        kind: ErrorKind,
    ) -> hyper::Response<BoxBody> {
        self.finalize_metrics(status.as_u16());

        hyper::Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(full_body(error_envelope(msg, kind)))
            .unwrap()
    }

    pub fn finalize_metrics(&self, resp_status: u16) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(resp_status);

        metrics::counter!(
            "gateway_http_requests_total",
            "channel" => self.channel_name.clone(),
            "method" => self.method.clone(),
            "status_code" => status_str.to_owned(),
        )
        .increment(1);

        metrics::histogram!(
            "gateway_http_request_duration_seconds",
            "channel" => self.channel_name.clone(),
        )
        .record(self.start.elapsed().as_secs_f64());

        if let Some(upstream_start) = self.upstream_start {
            metrics::histogram!(
                "gateway_upstream_request_duration_seconds",
                "channel" => self.channel_name.clone(),
            )
            .record(upstream_start.elapsed().as_secs_f64());
        }

        metrics::gauge!("gateway_http_requests_in_flight").decrement(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_has_envelope_shape() {
        let ctx = RequestContext::new(
            "req-1".into(),
            "host".into(),
            "/v1/chat".into(),
            "POST".into(),
            "127.0.0.1".parse().unwrap(),
        );
        let resp = ctx.error_response(StatusCode::SERVICE_UNAVAILABLE, "no channel", ErrorKind::ProxyError);
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
