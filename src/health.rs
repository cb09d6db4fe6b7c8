//! Component F: health prober (§4.F).
//!
//! One active probe per channel per interval. A channel with a `tunnel`
//! advert is probed on the local forward port (the tunnel's far end),
//! with the origin's `Host` header attached, so CDN-fronted origins that
//! route on `Host` behave the same whether reached directly or through
//! the tunnel (Open Question 3).

use crate::channel::ChannelStore;
use crate::logger::EventBus;
use futures_util::stream::{self, StreamExt};
use std::time::Duration;

const PROBE_CONCURRENCY: usize = 32;

pub fn build_health_check_client() -> reqwest::Client {
    // HTTP/1.1 only, matching the main dispatch client — HTTP/2
    // origination to upstreams is an explicit non-goal (§1).
    reqwest::Client::builder()
        .http1_only()
        .timeout(Duration::from_secs(10))
        .no_proxy()
        .build()
        .expect("failed to build health check client")
}

/// Runs a single round of active health checks across all channels that
/// declare a `health_check`. The caller owns scheduling (an interval
/// loop in bootstrap, one tick per channel's minimum `interval_ms` — in
/// practice a single shared tick, since per-channel intervals are a
/// Non-goal).
pub async fn run_health_checks(channels: &ChannelStore, client: &reqwest::Client, bus: &EventBus) {
    let mut tasks = Vec::new();
    channels.for_each(|_name, channel| {
        if channel.config().health_check.is_some() {
            tasks.push(channel.clone());
        }
    });

    stream::iter(tasks)
        .map(|channel| {
            let client = client.clone();
            let bus = bus.clone();
            async move {
                check_one_channel(&client, &channel, &bus).await;
            }
        })
        .buffer_unordered(PROBE_CONCURRENCY)
        .collect::<()>()
        .await;
}

async fn check_one_channel(
    client: &reqwest::Client,
    channel: &crate::channel::Channel,
    bus: &EventBus,
) {
    let hc = match &channel.config().health_check {
        Some(hc) => hc,
        None => return,
    };

    let (url, host_header) = match &channel.config().tunnel {
        Some(t) if t.enabled => {
            let origin_host = host_from_target(channel.target());
            (
                format!("http://127.0.0.1:{}{}", t.local_port, hc.path),
                Some(origin_host),
            )
        }
        _ => (format!("{}{}", channel.target(), hc.path), None),
    };

    let mut req = client.get(&url).timeout(Duration::from_millis(hc.timeout_ms));
    if let Some(host) = &host_header {
        req = req.header(reqwest::header::HOST, host.as_str());
    }
    if let Some(key) = channel.first_alive_key() {
        req = req.bearer_auth(key);
    }

    let ok = matches!(req.send().await, Ok(resp) if resp.status().as_u16() < 400);

    if let Some(new_state) = channel.note_probe_result(ok) {
        bus.log(
            crate::logger::Level::Info,
            "health",
            format!(
                "channel '{}' transitioned to {}",
                channel.name(),
                new_state.as_str()
            ),
        );
        metrics::gauge!(
            "gateway_channel_health",
            "channel" => channel.name().to_string(),
        )
        .set(if new_state == crate::channel::HealthState::Healthy {
            1.0
        } else {
            0.0
        });
    }

    metrics::counter!(
        "gateway_health_check_total",
        "channel" => channel.name().to_string(),
        "result" => if ok { "success" } else { "failure" },
    )
    .increment(1);
}

fn host_from_target(target: &str) -> String {
    target
        .split("://")
        .nth(1)
        .unwrap_or(target)
        .split('/')
        .next()
        .unwrap_or(target)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_from_target_strips_scheme_and_path() {
        assert_eq!(host_from_target("https://api.example.com/v1"), "api.example.com");
        assert_eq!(host_from_target("http://127.0.0.1:4000"), "127.0.0.1:4000");
    }
}
