use serde::{Deserialize, Deserializer, Serialize};

/// Deserialize a `T` that implements `Default` — treats YAML `null` the
/// same as a missing field (returns `T::default()`).  Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Top-level gateway configuration, loaded from the YAML file named by
/// `--config` / `TUNNEL_CONFIG` / `AI_TUNNEL_CONFIG`. Wire format is
/// camelCase throughout (§6) — only the in-memory field names are
/// snake_case Rust convention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub ssh: Option<SshConfig>,

    pub channels: Vec<ChannelConfig>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub routes: Vec<RouteGroupConfig>,

    #[serde(default)]
    pub settings: SettingsConfig,

    #[serde(default)]
    pub ui_auth_token: Option<String>,

    /// Legacy top-level form; converted into `channels` by
    /// [`crate::config::migrate_legacy_sites`] immediately after load.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub sites: Vec<LegacySiteConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            ssh: None,
            channels: Vec::new(),
            routes: Vec::new(),
            settings: SettingsConfig::default(),
            ui_auth_token: None,
            sites: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub ui: UiConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            ui: UiConfig::default(),
        }
    }
}

/// Proxy ingress binds loopback-only by default (§4.E) — the port has no
/// auth of its own, so exposing it beyond localhost is an explicit
/// operator choice, not the out-of-the-box behavior.
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9000
}

/// Management API (§4.H) bind config. Named `ui` in the wire format
/// because it is also where the (out-of-scope) Web UI is served from —
/// the JSON/SSE routes underneath are this crate's concern either way.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_ui_port")]
    pub port: u16,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_ui_port(),
        }
    }
}

fn default_ui_port() -> u16 {
    3000
}

/// SSH target this gateway reverse-tunnels its channels through. Optional —
/// a gateway with no tunneled channels has no need of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshConfig {
    pub host: String,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    pub username: String,

    /// `~`-relative paths are expanded against the home directory at load
    /// time, not here — keeping this struct a plain data carrier.
    #[serde(default)]
    pub private_key_path: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

/// A single upstream AI provider: one HTTP origin plus a pool of
/// credentials to rotate across it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfig {
    pub name: String,

    /// Base origin URL, e.g. `https://api.openai.com`.
    pub target: String,

    pub keys: Vec<String>,

    #[serde(default = "default_key_strategy")]
    pub key_strategy: KeyStrategy,

    #[serde(default = "default_weight")]
    pub weight: u32,

    #[serde(default)]
    pub fallback: bool,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub tunnel: Option<TunnelAdvertConfig>,

    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
}

fn default_key_strategy() -> KeyStrategy {
    KeyStrategy::RoundRobin
}

fn default_weight() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyStrategy {
    RoundRobin,
    Random,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelAdvertConfig {
    #[serde(default)]
    pub enabled: bool,

    pub local_port: u16,

    pub remote_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
    #[serde(default = "default_hc_path")]
    pub path: String,

    #[serde(default = "default_hc_interval_ms")]
    pub interval_ms: u64,

    #[serde(default = "default_hc_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            path: default_hc_path(),
            interval_ms: default_hc_interval_ms(),
            timeout_ms: default_hc_timeout_ms(),
        }
    }
}

fn default_hc_path() -> String {
    "/health".to_string()
}

fn default_hc_interval_ms() -> u64 {
    30_000
}

fn default_hc_timeout_ms() -> u64 {
    5_000
}

/// A named group of routes that share a candidate channel list and a
/// selection strategy. Optional — with no `routes:` entries every request
/// falls through to a synthetic catch-all group spanning every enabled
/// channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteGroupConfig {
    pub path: String,

    pub channels: Vec<String>,

    #[serde(default = "default_strategy")]
    pub strategy: RouteStrategy,
}

fn default_strategy() -> RouteStrategy {
    RouteStrategy::Priority
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RouteStrategy {
    Priority,
    RoundRobin,
    LowestLatency,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsConfig {
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval: u64,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub hot_reload: bool,

    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: default_reconnect_interval_ms(),
            log_level: default_log_level(),
            hot_reload: false,
            retry: RetryConfig::default(),
        }
    }
}

fn default_reconnect_interval_ms() -> u64 {
    5_000
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_on")]
    pub retry_on: Vec<u16>,

    #[serde(default = "default_backoff")]
    pub backoff: BackoffKind,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_on: default_retry_on(),
            backoff: default_backoff(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_on() -> Vec<u16> {
    vec![429, 502, 503, 504]
}

fn default_backoff() -> BackoffKind {
    BackoffKind::Exponential
}

fn default_base_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    8_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Exponential,
    Fixed,
}

/// Pre-migration shape. `name`/`url`/`key` map onto a single-credential
/// `ChannelConfig`; anything unrecognized is dropped rather than guessed at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacySiteConfig {
    pub name: String,
    pub url: String,
    pub key: String,
    #[serde(default)]
    pub weight: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_minimal_defaults() {
        let yaml = "name: openai\ntarget: https://api.openai.com\nkeys: [sk-a]\n";
        let ch: ChannelConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(ch.name, "openai");
        assert_eq!(ch.key_strategy, KeyStrategy::RoundRobin);
        assert_eq!(ch.weight, 1);
        assert!(!ch.fallback);
        assert!(ch.enabled);
        assert!(ch.tunnel.is_none());
        assert!(ch.health_check.is_none());
    }

    #[test]
    fn channel_with_tunnel_camel_case() {
        // §6's wire format is camelCase throughout.
        let yaml = "name: local\ntarget: http://127.0.0.1:4000\nkeys: [k]\ntunnel:\n  enabled: true\n  localPort: 4000\n  remotePort: 14000\n";
        let ch: ChannelConfig = serde_yaml::from_str(yaml).unwrap();
        let t = ch.tunnel.unwrap();
        assert!(t.enabled);
        assert_eq!(t.local_port, 4000);
        assert_eq!(t.remote_port, 14000);
    }

    #[test]
    fn channel_snake_case_keys_are_rejected() {
        let yaml = "name: local\ntarget: http://127.0.0.1:4000\nkeys: [k]\ntunnel:\n  enabled: true\n  local_port: 4000\n  remote_port: 14000\n";
        let res: Result<ChannelConfig, _> = serde_yaml::from_str(yaml);
        assert!(res.is_err(), "snake_case keys should not parse once the struct is camelCase");
    }

    #[test]
    fn key_strategy_and_route_strategy_use_kebab_case() {
        let yaml = "name: a\ntarget: http://x\nkeys: [k]\nkeyStrategy: round-robin\n";
        let ch: ChannelConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(ch.key_strategy, KeyStrategy::RoundRobin);

        let yaml = "path: \"/v1/**\"\nchannels: [a]\nstrategy: lowest-latency\n";
        let rg: RouteGroupConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rg.strategy, RouteStrategy::LowestLatency);
    }

    #[test]
    fn settings_accept_camel_case_fields() {
        let yaml = "reconnectInterval: 1000\nlogLevel: debug\nhotReload: true\nretry:\n  maxRetries: 5\n  retryOn: [429]\n  backoff: fixed\n  baseDelayMs: 10\n  maxDelayMs: 100\n";
        let settings: SettingsConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(settings.reconnect_interval, 1000);
        assert_eq!(settings.log_level, "debug");
        assert!(settings.hot_reload);
        assert_eq!(settings.retry.max_retries, 5);
        assert_eq!(settings.retry.retry_on, vec![429]);
        assert_eq!(settings.retry.backoff, BackoffKind::Fixed);
        assert_eq!(settings.retry.base_delay_ms, 10);
        assert_eq!(settings.retry.max_delay_ms, 100);
    }

    #[test]
    fn retry_defaults() {
        let retry = RetryConfig::default();
        assert_eq!(retry.max_retries, 2);
        assert_eq!(retry.retry_on, vec![429, 502, 503, 504]);
        assert_eq!(retry.backoff, BackoffKind::Exponential);
        assert_eq!(retry.base_delay_ms, 250);
        assert_eq!(retry.max_delay_ms, 8_000);
    }

    #[test]
    fn route_group_strategy_default() {
        let yaml = "path: \"/v1/**\"\nchannels: [openai]\n";
        let rg: RouteGroupConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rg.strategy, RouteStrategy::Priority);
    }

    #[test]
    fn gateway_config_requires_channels() {
        let yaml = "channels:\n  - name: a\n    target: http://x\n    keys: [k]\n";
        let cfg: GatewayConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.channels.len(), 1);
        assert!(cfg.routes.is_empty());
        assert!(!cfg.settings.hot_reload);
    }

    #[test]
    fn legacy_sites_parse_without_affecting_channels_directly() {
        let yaml = "sites:\n  - name: old\n    url: http://old\n    key: sk-old\nchannels: []\n";
        let cfg: GatewayConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.sites.len(), 1);
        assert!(cfg.channels.is_empty());
    }
}
