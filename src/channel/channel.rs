use crate::config::{ChannelConfig, KeyStrategy};
use crate::proxy::context::BoxBody;
use dashmap::DashMap;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rand::Rng;
use std::sync::atomic::{
    AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering,
};
use std::sync::{Arc, RwLock};
use std::time::Duration;

const POOL_MAX_IDLE_PER_HOST: usize = 16;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Health state of a channel as tracked by the prober (§4.F). `Unknown`
/// is the initial state before the first probe completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HealthState {
    Unknown = 0,
    Healthy = 1,
    Unhealthy = 2,
}

impl HealthState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => HealthState::Healthy,
            2 => HealthState::Unhealthy,
            _ => HealthState::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HealthState::Unknown => "unknown",
            HealthState::Healthy => "healthy",
            HealthState::Unhealthy => "unhealthy",
        }
    }
}

/// One credential in a channel's pool. `alive` is flipped by
/// `mark_key_failed`/`mark_key_success`; a dead key is skipped by
/// selection but stays in the pool so it can recover.
struct Credential {
    value: String,
    alive: AtomicBool,
    consecutive_failures: AtomicU32,
}

/// Ordered pool of credentials plus the cursor state needed to rotate
/// through them. Mutation (add/remove) takes the write lock; selection
/// only needs a read lock and a fetch_add on the cursor.
struct CredentialPool {
    strategy: KeyStrategy,
    entries: RwLock<Vec<Credential>>,
    cursor: AtomicUsize,
}

impl CredentialPool {
    fn new(keys: &[String], strategy: KeyStrategy) -> Self {
        let entries = keys
            .iter()
            .map(|k| Credential {
                value: k.clone(),
                alive: AtomicBool::new(true),
                consecutive_failures: AtomicU32::new(0),
            })
            .collect();
        Self {
            strategy,
            entries: RwLock::new(entries),
            cursor: AtomicUsize::new(0),
        }
    }

    fn pick(&self) -> Option<String> {
        let entries = self.entries.read().unwrap();
        if entries.is_empty() {
            return None;
        }
        let alive_idx: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, c)| c.alive.load(Ordering::Relaxed))
            .map(|(i, _)| i)
            .collect();
        if alive_idx.is_empty() {
            return None;
        }
        let chosen = match self.strategy {
            KeyStrategy::Random => {
                let pick = rand::thread_rng().gen_range(0..alive_idx.len());
                alive_idx[pick]
            }
            KeyStrategy::RoundRobin => {
                let n = self.cursor.fetch_add(1, Ordering::Relaxed) % alive_idx.len();
                alive_idx[n]
            }
        };
        Some(entries[chosen].value.clone())
    }

    /// Three consecutive failures disable the credential (§3 invariant);
    /// below that it stays alive so a single blip doesn't burn a key.
    fn mark_failed(&self, value: &str) {
        let entries = self.entries.read().unwrap();
        if let Some(c) = entries.iter().find(|c| c.value == value) {
            let failures = c.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
            if failures >= 3 {
                c.alive.store(false, Ordering::Relaxed);
            }
        }
    }

    fn mark_success(&self, value: &str) {
        let entries = self.entries.read().unwrap();
        if let Some(c) = entries.iter().find(|c| c.value == value) {
            c.alive.store(true, Ordering::Relaxed);
            c.consecutive_failures.store(0, Ordering::Relaxed);
        }
    }

    fn add(&self, value: String) {
        let mut entries = self.entries.write().unwrap();
        entries.push(Credential {
            value,
            alive: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
        });
    }

    /// Removes the credential at `index`. Per the pool invariant, removing
    /// an entry at or past the round-robin cursor resets the cursor to 0
    /// rather than leaving it pointing past the (now shorter) vector.
    fn remove(&self, index: usize) -> bool {
        let mut entries = self.entries.write().unwrap();
        if index >= entries.len() {
            return false;
        }
        entries.remove(index);
        if self.cursor.load(Ordering::Relaxed) >= index {
            self.cursor.store(0, Ordering::Relaxed);
        }
        true
    }

    /// First alive credential in pool order, without touching the cursor.
    /// Used by the health prober (§4.F), which attaches a Bearer header
    /// but must not perturb the round-robin rotation real traffic relies on.
    fn first_alive(&self) -> Option<String> {
        self.entries
            .read()
            .unwrap()
            .iter()
            .find(|c| c.alive.load(Ordering::Relaxed))
            .map(|c| c.value.clone())
    }

    fn has_alive(&self) -> bool {
        self.entries
            .read()
            .unwrap()
            .iter()
            .any(|c| c.alive.load(Ordering::Relaxed))
    }

    fn to_json(&self) -> serde_json::Value {
        let entries = self.entries.read().unwrap();
        serde_json::json!(entries
            .iter()
            .map(|c| serde_json::json!({
                "value": mask_key(&c.value),
                "alive": c.alive.load(Ordering::Relaxed),
                "consecutiveFailures": c.consecutive_failures.load(Ordering::Relaxed),
            }))
            .collect::<Vec<_>>())
    }
}

fn mask_key(value: &str) -> String {
    if value.len() <= 8 {
        "***".to_string()
    } else {
        format!("{}***{}", &value[..4], &value[value.len() - 4..])
    }
}

/// Runtime representation of a configured upstream AI provider. Owns its
/// own HTTP client, credential pool, health state, and running stats —
/// the live counterpart of `ChannelConfig`.
pub struct Channel {
    config: Arc<ChannelConfig>,
    target: Arc<str>,
    http_client: Client<HttpsConnector<HttpConnector>, BoxBody>,
    credentials: CredentialPool,

    /// Runtime override of `config.enabled`, flipped by the admin API's
    /// toggle route (§4.H). Starts at the config value; a reload rebuilds
    /// the channel from scratch and so resets it.
    enabled: AtomicBool,

    health: AtomicU8,
    last_latency_ms: AtomicU64,
    consecutive_fails: AtomicU32,
    consecutive_successes: AtomicU32,

    total_requests: AtomicU64,
    success_count: AtomicU64,
    fail_count: AtomicU64,
    last_request_at_ms: AtomicI64,
    last_error: RwLock<Option<String>>,
}

impl Channel {
    pub fn new(config: ChannelConfig) -> Self {
        let target: Arc<str> = Arc::from(config.target.as_str());
        let credentials = CredentialPool::new(&config.keys, config.key_strategy);
        let http_client = build_channel_http_client();
        let enabled = AtomicBool::new(config.enabled);
        Self {
            config: Arc::new(config),
            target,
            http_client,
            credentials,
            enabled,
            health: AtomicU8::new(HealthState::Unknown as u8),
            last_latency_ms: AtomicU64::new(0),
            consecutive_fails: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            total_requests: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            fail_count: AtomicU64::new(0),
            last_request_at_ms: AtomicI64::new(0),
            last_error: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn http_client(&self) -> &Client<HttpsConnector<HttpConnector>, BoxBody> {
        &self.http_client
    }

    pub fn weight(&self) -> u32 {
        self.config.weight
    }

    pub fn is_fallback(&self) -> bool {
        self.config.fallback
    }

    /// Administrative enabled state (§4.H toggle). Distinct from
    /// `config.enabled`, which is only the value loaded at startup/reload —
    /// this is the live override an operator can flip at runtime.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// `true` when the channel is administratively enabled, not marked
    /// unhealthy by the health prober or consecutive-failure tracking,
    /// and has at least one alive credential — exactly §3's definition of
    /// "available for routing" (`enabled ∧ health ≠ unhealthy ∧
    /// aliveKeys > 0`).
    pub fn is_available(&self) -> bool {
        self.is_enabled() && self.health() != HealthState::Unhealthy && self.credentials.has_alive()
    }

    pub fn health(&self) -> HealthState {
        HealthState::from_u8(self.health.load(Ordering::Relaxed))
    }

    pub fn last_latency_ms(&self) -> u64 {
        self.last_latency_ms.load(Ordering::Relaxed)
    }

    // ---- Credential pool ----

    pub fn pick_key(&self) -> Option<String> {
        self.credentials.pick()
    }

    pub fn first_alive_key(&self) -> Option<String> {
        self.credentials.first_alive()
    }

    pub fn mark_key_failed(&self, value: &str) {
        self.credentials.mark_failed(value);
    }

    pub fn mark_key_success(&self, value: &str) {
        self.credentials.mark_success(value);
    }

    pub fn add_key(&self, value: String) {
        self.credentials.add(value);
    }

    pub fn remove_key(&self, index: usize) -> bool {
        self.credentials.remove(index)
    }

    // ---- Request outcome bookkeeping (§4.B) ----

    /// §4.B: increments totals, stores latency, resets `consecutiveFails`
    /// and promotes health to healthy. Shares the consecutive-failure
    /// counter with the health prober (§3 lists a single such counter per
    /// channel) — a good proxied response counts the same as a good probe.
    pub fn record_success(&self, latency_ms: u64) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.success_count.fetch_add(1, Ordering::Relaxed);
        self.last_latency_ms.store(latency_ms, Ordering::Relaxed);
        self.last_request_at_ms.store(now_ms(), Ordering::Relaxed);
        *self.last_error.write().unwrap() = None;
        self.consecutive_fails.store(0, Ordering::Relaxed);
        self.health.store(HealthState::Healthy as u8, Ordering::Relaxed);
    }

    /// §4.B: increments totals and `consecutiveFails`; at 3 demotes health
    /// to unhealthy.
    pub fn record_failure(&self, error: &str) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.fail_count.fetch_add(1, Ordering::Relaxed);
        self.last_request_at_ms.store(now_ms(), Ordering::Relaxed);
        *self.last_error.write().unwrap() = Some(error.to_string());
        let fails = self.consecutive_fails.fetch_add(1, Ordering::Relaxed) + 1;
        if fails >= 3 {
            self.health.store(HealthState::Unhealthy as u8, Ordering::Relaxed);
        }
    }

    /// Applies the 3-consecutive-failure / 1-success health-check
    /// transition rule (§4.F). Returns `Some(new_state)` only when the
    /// state actually changed, so the prober can emit a `health` event
    /// exactly on the transition boundary.
    pub fn note_probe_result(&self, ok: bool) -> Option<HealthState> {
        let current = self.health();
        if ok {
            self.consecutive_fails.store(0, Ordering::Relaxed);
            let successes = self.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;
            if current != HealthState::Healthy && successes >= 1 {
                self.health
                    .store(HealthState::Healthy as u8, Ordering::Relaxed);
                return Some(HealthState::Healthy);
            }
        } else {
            self.consecutive_successes.store(0, Ordering::Relaxed);
            let fails = self.consecutive_fails.fetch_add(1, Ordering::Relaxed) + 1;
            if current != HealthState::Unhealthy && fails >= 3 {
                self.health
                    .store(HealthState::Unhealthy as u8, Ordering::Relaxed);
                return Some(HealthState::Unhealthy);
            }
        }
        None
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name(),
            "target": self.target(),
            "enabled": self.is_enabled(),
            "weight": self.config.weight,
            "fallback": self.config.fallback,
            "health": self.health().as_str(),
            "lastLatencyMs": self.last_latency_ms(),
            "keys": self.credentials.to_json(),
            "stats": {
                "totalRequests": self.total_requests.load(Ordering::Relaxed),
                "successCount": self.success_count.load(Ordering::Relaxed),
                "failCount": self.fail_count.load(Ordering::Relaxed),
                "lastRequestAt": self.last_request_at_ms.load(Ordering::Relaxed),
                "lastError": self.last_error.read().unwrap().clone(),
            },
        })
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn build_channel_http_client() -> Client<HttpsConnector<HttpConnector>, BoxBody> {
    let mut http = HttpConnector::new();
    http.set_nodelay(true);
    http.set_keepalive(Some(POOL_IDLE_TIMEOUT));
    http.set_connect_timeout(Some(CONNECT_TIMEOUT));
    http.enforce_http(false);

    // HTTP/1.1 only: HTTP/2 origination to upstreams is an explicit
    // non-goal (§1).
    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .wrap_connector(http);

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .build(https)
}

/// Central registry of all live channels. Thread-safe, cheaply cloneable —
/// the same `Arc<DashMap<..>>`-backed shape the teacher gateway uses for
/// its cluster store.
#[derive(Clone)]
pub struct ChannelStore {
    channels: Arc<DashMap<String, Arc<Channel>>>,
}

impl Default for ChannelStore {
    fn default() -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
        }
    }
}

impl ChannelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels.get(name).map(|e| e.value().clone())
    }

    pub fn upsert(&self, config: ChannelConfig) {
        self.channels
            .insert(config.name.clone(), Arc::new(Channel::new(config)));
    }

    pub fn remove(&self, name: &str) -> bool {
        self.channels.remove(name).is_some()
    }

    pub fn for_each(&self, mut f: impl FnMut(&str, &Arc<Channel>)) {
        for entry in self.channels.iter() {
            f(entry.key(), entry.value());
        }
    }

    pub fn init_from_configs(&self, channels: &[ChannelConfig]) {
        for config in channels {
            self.upsert(config.clone());
        }
    }

    /// Hot-reload replacement (§5): clears every existing entry and
    /// rebuilds fresh `Channel`s from `channels`. Credentials and stats
    /// are not migrated from like-named channels — a reload is a
    /// replacement, as documented in §5.
    pub fn replace_all(&self, channels: &[ChannelConfig]) {
        self.channels.clear();
        self.init_from_configs(channels);
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut out = Vec::new();
        self.for_each(|_, ch| out.push(ch.to_json()));
        serde_json::json!(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(name: &str, keys: &[&str], strategy: KeyStrategy) -> ChannelConfig {
        ChannelConfig {
            name: name.to_string(),
            target: "http://example.invalid".to_string(),
            keys: keys.iter().map(|s| s.to_string()).collect(),
            key_strategy: strategy,
            weight: 1,
            fallback: false,
            enabled: true,
            tunnel: None,
            health_check: None,
        }
    }

    #[test]
    fn round_robin_cycles_through_all_keys() {
        let channel = Channel::new(cfg("a", &["k1", "k2", "k3"], KeyStrategy::RoundRobin));
        let mut seen = std::collections::HashSet::new();
        for _ in 0..6 {
            seen.insert(channel.pick_key().unwrap());
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn dead_key_is_skipped() {
        let channel = Channel::new(cfg("a", &["k1", "k2"], KeyStrategy::RoundRobin));
        for _ in 0..3 {
            channel.mark_key_failed("k1");
        }
        for _ in 0..4 {
            assert_eq!(channel.pick_key().unwrap(), "k2");
        }
    }

    #[test]
    fn all_keys_dead_yields_none() {
        let channel = Channel::new(cfg("a", &["k1"], KeyStrategy::RoundRobin));
        for _ in 0..3 {
            channel.mark_key_failed("k1");
        }
        assert!(channel.pick_key().is_none());
        assert!(!channel.is_available());
    }

    #[test]
    fn mark_success_revives_key() {
        let channel = Channel::new(cfg("a", &["k1"], KeyStrategy::RoundRobin));
        for _ in 0..3 {
            channel.mark_key_failed("k1");
        }
        assert!(channel.pick_key().is_none());
        channel.mark_key_success("k1");
        assert_eq!(channel.pick_key().unwrap(), "k1");
    }

    #[test]
    fn removing_key_at_cursor_resets_cursor() {
        let channel = Channel::new(cfg("a", &["k1", "k2", "k3"], KeyStrategy::RoundRobin));
        channel.pick_key();
        channel.pick_key();
        assert!(channel.remove_key(1));
        // cursor must have been reset to 0, not left pointing past the
        // shortened vector.
        let first = channel.pick_key().unwrap();
        assert!(first == "k1" || first == "k3");
    }

    #[test]
    fn unhealthy_channel_is_not_available_even_with_alive_keys() {
        let channel = Channel::new(cfg("a", &["k1"], KeyStrategy::RoundRobin));
        assert!(channel.is_available());
        channel.record_failure("boom");
        channel.record_failure("boom");
        channel.record_failure("boom");
        assert_eq!(channel.health(), HealthState::Unhealthy);
        // k1 is still alive (record_failure doesn't touch key liveness),
        // but §3 excludes an unhealthy channel from routing regardless.
        assert!(channel.pick_key().is_some());
        assert!(!channel.is_available());
    }

    #[test]
    fn health_transitions_on_threshold_not_every_failure() {
        let channel = Channel::new(cfg("a", &["k1"], KeyStrategy::RoundRobin));
        assert!(channel.note_probe_result(false).is_none());
        assert!(channel.note_probe_result(false).is_none());
        assert_eq!(channel.note_probe_result(false), Some(HealthState::Unhealthy));
        // further failures don't re-emit the transition.
        assert!(channel.note_probe_result(false).is_none());
        assert_eq!(channel.note_probe_result(true), Some(HealthState::Healthy));
    }

    #[test]
    fn record_success_and_failure_update_stats() {
        let channel = Channel::new(cfg("a", &["k1"], KeyStrategy::RoundRobin));
        channel.record_success(120);
        channel.record_failure("boom");
        let json = channel.to_json();
        assert_eq!(json["stats"]["totalRequests"], 2);
        assert_eq!(json["stats"]["successCount"], 1);
        assert_eq!(json["stats"]["failCount"], 1);
        assert_eq!(json["stats"]["lastError"], "boom");
    }

    #[test]
    fn masked_key_never_exposes_full_value() {
        let channel = Channel::new(cfg("a", &["sk-abcdefgh12345678"], KeyStrategy::RoundRobin));
        let json = channel.to_json();
        let masked = json["keys"][0]["value"].as_str().unwrap();
        assert!(!masked.contains("abcdefgh1234"));
    }

    #[test]
    fn store_roundtrip() {
        let store = ChannelStore::new();
        store.upsert(cfg("a", &["k1"], KeyStrategy::RoundRobin));
        assert!(store.get("a").is_some());
        assert!(store.remove("a"));
        assert!(store.get("a").is_none());
    }
}
