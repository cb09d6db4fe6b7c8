//! Cross-module behavior between the router (component C) and channel
//! state (component B): selection, exclusion-driven failover, and the
//! invariants §8 calls universal.

use keyrelay_gateway::channel::ChannelStore;
use keyrelay_gateway::config::{ChannelConfig, KeyStrategy, RouteGroupConfig, RouteStrategy};
use keyrelay_gateway::router::Router;

fn channel_cfg(name: &str, keys: &[&str], weight: u32, fallback: bool) -> ChannelConfig {
    ChannelConfig {
        name: name.to_string(),
        target: format!("http://{name}.invalid"),
        keys: keys.iter().map(|s| s.to_string()).collect(),
        key_strategy: KeyStrategy::RoundRobin,
        weight,
        fallback,
        enabled: true,
        tunnel: None,
        health_check: None,
    }
}

#[test]
fn failover_excludes_failed_channel_and_lands_on_fallback() {
    let store = ChannelStore::new();
    store.upsert(channel_cfg("primary", &["k1"], 10, false));
    store.upsert(channel_cfg("backup", &["k2"], 1, true));

    let routes = vec![RouteGroupConfig {
        path: "/v1/**".to_string(),
        channels: vec!["primary".to_string(), "backup".to_string()],
        strategy: RouteStrategy::Priority,
    }];
    let router = Router::new(store.clone(), &routes).unwrap();

    // First attempt: no exclusions, resolves to the higher-weight primary.
    let first = router.resolve("/v1/chat/completions", &[]).unwrap();
    assert_eq!(first.channel.name(), "primary");

    // Simulate a channel-level failure (502) on primary: record the
    // failure and exclude it, the same bookkeeping the proxy handler
    // does on a channel-failure classification.
    first.channel.record_failure("status 502");
    let mut excluded: Vec<String> = Vec::new();
    assert_eq!(excluded.len(), 0);
    excluded.push("primary".to_string());

    let second = router.resolve("/v1/chat/completions", &excluded).unwrap();
    assert_eq!(second.channel.name(), "backup");

    // §8 universal invariant: the excluded set strictly grows across a
    // retry sequence for one request — it never shrinks or repeats.
    assert_eq!(excluded.len(), 1);
    assert!(excluded.contains(&"primary".to_string()));

    let json = store.get("primary").unwrap().to_json();
    assert_eq!(json["stats"]["failCount"], 1);
    assert_eq!(json["stats"]["totalRequests"], 1);
}

#[test]
fn exhausting_every_credential_on_a_channel_leaves_it_unavailable() {
    let store = ChannelStore::new();
    store.upsert(channel_cfg("solo", &["only-key"], 10, false));
    let router = Router::new(store.clone(), &[]).unwrap();

    let channel = store.get("solo").unwrap();
    for _ in 0..3 {
        channel.mark_key_failed("only-key");
    }

    // No alive credentials left: the channel fails `isAvailable` and the
    // router has nothing to fall back to (no fallback channel declared
    // and no other candidate), matching the "zero alive credentials ->
    // immediate unavailability" boundary behavior in §8.
    assert!(!channel.is_available());
    assert!(router.resolve("/anything", &[]).is_none());
}

#[test]
fn stats_invariant_holds_across_mixed_outcomes() {
    let store = ChannelStore::new();
    store.upsert(channel_cfg("mixed", &["k1", "k2"], 10, false));
    let channel = store.get("mixed").unwrap();

    channel.record_success(42);
    channel.record_failure("boom");
    channel.record_success(10);

    let json = channel.to_json();
    let total = json["stats"]["totalRequests"].as_u64().unwrap();
    let success = json["stats"]["successCount"].as_u64().unwrap();
    let fail = json["stats"]["failCount"].as_u64().unwrap();
    assert_eq!(success + fail, total);
    assert_eq!(total, 3);
}

#[test]
fn toggle_toggle_restores_enabled_state() {
    let store = ChannelStore::new();
    store.upsert(channel_cfg("a", &["k"], 1, false));
    let channel = store.get("a").unwrap();

    let initial = channel.is_enabled();
    channel.set_enabled(!channel.is_enabled());
    channel.set_enabled(!channel.is_enabled());
    assert_eq!(channel.is_enabled(), initial);
}

#[test]
fn add_key_then_remove_last_restores_pool() {
    let store = ChannelStore::new();
    store.upsert(channel_cfg("a", &["k1"], 1, false));
    let channel = store.get("a").unwrap();

    channel.add_key("k2".to_string());
    assert!(channel.remove_key(1));

    // Back to a single-key pool; picking repeatedly always returns k1.
    for _ in 0..3 {
        assert_eq!(channel.pick_key().unwrap(), "k1");
    }
}

#[test]
fn hot_reload_replaces_channel_set_without_migrating_stats() {
    let store = ChannelStore::new();
    store.upsert(channel_cfg("a", &["k1"], 1, false));
    store.get("a").unwrap().record_success(5);

    let new_channels = vec![channel_cfg("a", &["k1-new"], 1, false)];
    store.replace_all(&new_channels);

    let reloaded = store.get("a").unwrap();
    let json = reloaded.to_json();
    assert_eq!(json["stats"]["totalRequests"], 0, "reload must not carry over old stats");
}
