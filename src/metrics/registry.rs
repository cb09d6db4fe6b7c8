use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

static RECORDER: OnceLock<PrometheusHandle> = OnceLock::new();

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Histogram bucket boundaries for response body size (bytes).
const SIZE_BUCKETS: &[f64] = &[
    100.0, 500.0, 1000.0, 5000.0, 10000.0, 50000.0, 100000.0, 500000.0, 1000000.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`, `gauge!`,
/// `histogram!`) can be used anywhere in the codebase. The `PrometheusHandle`
/// is retained solely for rendering `/api/metrics`.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions, or return a handle to the one already installed.
    /// Idempotent so that constructing more than one `GatewayState` in
    /// the same process (hot-reload tests, multiple integration tests in
    /// one binary) doesn't try to install the global recorder twice.
    pub fn install() -> Self {
        let handle = RECORDER.get_or_init(Self::install_once).clone();
        Self { handle }
    }

    fn install_once() -> PrometheusHandle {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Full(
                    "gateway_http_response_size_bytes".to_string(),
                ),
                SIZE_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        describe_counter!(
            "gateway_http_requests_total",
            Unit::Count,
            "Total HTTP requests processed"
        );
        describe_histogram!(
            "gateway_http_request_duration_seconds",
            Unit::Seconds,
            "Total request duration from client perspective"
        );
        describe_histogram!(
            "gateway_upstream_request_duration_seconds",
            Unit::Seconds,
            "Upstream request duration (time spent waiting on the selected channel)"
        );
        describe_gauge!(
            "gateway_http_requests_in_flight",
            Unit::Count,
            "Number of requests currently being processed"
        );
        describe_histogram!(
            "gateway_http_response_size_bytes",
            Unit::Bytes,
            "Response body size in bytes"
        );

        describe_gauge!(
            "gateway_channel_health",
            Unit::Count,
            "Channel health: 1=healthy 0=unhealthy"
        );
        describe_counter!(
            "gateway_health_check_total",
            Unit::Count,
            "Total active health check attempts"
        );
        describe_gauge!(
            "gateway_channel_keys_alive",
            Unit::Count,
            "Number of alive credentials in a channel's pool"
        );

        describe_counter!(
            "gateway_retry_total",
            Unit::Count,
            "Total retry attempts across all channels"
        );
        describe_counter!(
            "gateway_key_rotation_total",
            Unit::Count,
            "Total credential rotations within a channel"
        );
        describe_counter!(
            "gateway_channel_failover_total",
            Unit::Count,
            "Total failovers from one channel to another"
        );

        describe_gauge!(
            "gateway_connections_active",
            Unit::Count,
            "Number of active downstream connections"
        );
        describe_counter!(
            "gateway_connections_total",
            Unit::Count,
            "Total connections accepted"
        );

        describe_counter!(
            "gateway_config_reloads_total",
            Unit::Count,
            "Config reload events"
        );
        describe_gauge!(
            "gateway_config_channels_total",
            Unit::Count,
            "Number of channels currently loaded"
        );

        describe_gauge!(
            "gateway_tunnel_connected",
            Unit::Count,
            "SSH reverse tunnel connection state: 1=connected 0=disconnected"
        );
        describe_counter!(
            "gateway_tunnel_reconnect_total",
            Unit::Count,
            "Total SSH tunnel reconnect attempts"
        );

        handle
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
