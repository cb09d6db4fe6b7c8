pub mod types;

pub use types::*;

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

impl GatewayConfig {
    /// Resolve the config path: explicit `--config` flag wins, then
    /// `TUNNEL_CONFIG`, then `AI_TUNNEL_CONFIG`, then the `config.yaml`
    /// default — the same override order the teacher gateway uses for its
    /// own infra env vars, just collapsed onto a single path variable.
    pub fn resolve_path(cli_path: Option<PathBuf>) -> PathBuf {
        if let Some(p) = cli_path {
            return p;
        }
        if let Ok(p) = std::env::var("TUNNEL_CONFIG") {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("AI_TUNNEL_CONFIG") {
            return PathBuf::from(p);
        }
        PathBuf::from("config.yaml")
    }

    /// Load configuration from a YAML file and validate it. A missing
    /// channel name, target, or empty key list fails startup outright —
    /// there is no sensible default to run a gateway with zero channels.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let mut config: GatewayConfig =
            serde_yaml::from_str(&content).context("parsing config YAML")?;

        migrate_legacy_sites(&mut config);
        config.validate()?;
        tracing::info!(channels = config.channels.len(), "loaded gateway configuration");
        Ok(config)
    }

    /// Re-load for the hot-reload path (§5). On any error the caller keeps
    /// running the previous config — this function only ever returns a
    /// config it is confident is valid, or an error to log and discard.
    pub fn reload(path: &Path) -> Result<Self> {
        Self::load(path)
    }

    pub fn validate(&self) -> Result<()> {
        if self.channels.is_empty() {
            bail!("config-invalid: no channels defined");
        }
        for ch in &self.channels {
            if ch.name.trim().is_empty() {
                bail!("config-invalid: channel with empty name");
            }
            if ch.target.trim().is_empty() {
                bail!("config-invalid: channel '{}' has empty target", ch.name);
            }
            if ch.keys.is_empty() {
                bail!("config-invalid: channel '{}' has no keys", ch.name);
            }
        }
        let mut seen = std::collections::HashSet::new();
        for ch in &self.channels {
            if !seen.insert(ch.name.as_str()) {
                bail!("config-invalid: duplicate channel name '{}'", ch.name);
            }
        }
        for group in &self.routes {
            for name in &group.channels {
                if !self.channels.iter().any(|c| &c.name == name) {
                    bail!(
                        "config-invalid: route group '{}' references unknown channel '{}'",
                        group.path,
                        name
                    );
                }
            }
        }
        Ok(())
    }
}

/// Converts the legacy `sites:` array into `channels:` entries, appending
/// them (legacy sites never collide with an already-named channel in
/// practice, but an explicit `channels:` entry always wins on name clash).
/// Kept as a standalone, independently testable step rather than inlined
/// into `Deserialize`, so the conversion itself stays auditable.
pub fn migrate_legacy_sites(config: &mut GatewayConfig) {
    if config.sites.is_empty() {
        return;
    }
    let existing: std::collections::HashSet<String> =
        config.channels.iter().map(|c| c.name.clone()).collect();
    for site in config.sites.drain(..) {
        if existing.contains(&site.name) {
            continue;
        }
        config.channels.push(ChannelConfig {
            name: site.name,
            target: site.url,
            keys: vec![site.key],
            key_strategy: KeyStrategy::RoundRobin,
            weight: site.weight.unwrap_or(1),
            fallback: false,
            enabled: true,
            tunnel: None,
            health_check: None,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_empty_channels() {
        let cfg = GatewayConfig::default();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_missing_target() {
        let mut cfg = GatewayConfig::default();
        cfg.channels.push(ChannelConfig {
            name: "a".into(),
            target: "".into(),
            keys: vec!["k".into()],
            key_strategy: KeyStrategy::RoundRobin,
            weight: 1,
            fallback: false,
            enabled: true,
            tunnel: None,
            health_check: None,
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_names() {
        let mut cfg = GatewayConfig::default();
        for _ in 0..2 {
            cfg.channels.push(ChannelConfig {
                name: "dup".into(),
                target: "http://x".into(),
                keys: vec!["k".into()],
                key_strategy: KeyStrategy::RoundRobin,
                weight: 1,
                fallback: false,
                enabled: true,
                tunnel: None,
                health_check: None,
            });
        }
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_route_to_unknown_channel() {
        let mut cfg = GatewayConfig::default();
        cfg.channels.push(ChannelConfig {
            name: "a".into(),
            target: "http://x".into(),
            keys: vec!["k".into()],
            key_strategy: KeyStrategy::RoundRobin,
            weight: 1,
            fallback: false,
            enabled: true,
            tunnel: None,
            health_check: None,
        });
        cfg.routes.push(RouteGroupConfig {
            path: "/v1/**".into(),
            channels: vec!["missing".into()],
            strategy: RouteStrategy::Priority,
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn migrate_legacy_sites_converts_and_dedups() {
        let mut cfg = GatewayConfig::default();
        cfg.channels.push(ChannelConfig {
            name: "kept".into(),
            target: "http://kept".into(),
            keys: vec!["k".into()],
            key_strategy: KeyStrategy::RoundRobin,
            weight: 1,
            fallback: false,
            enabled: true,
            tunnel: None,
            health_check: None,
        });
        cfg.sites.push(LegacySiteConfig {
            name: "kept".into(),
            url: "http://shadowed".into(),
            key: "sk-shadow".into(),
            weight: None,
        });
        cfg.sites.push(LegacySiteConfig {
            name: "legacy".into(),
            url: "http://legacy".into(),
            key: "sk-legacy".into(),
            weight: Some(5),
        });
        migrate_legacy_sites(&mut cfg);
        assert!(cfg.sites.is_empty());
        assert_eq!(cfg.channels.len(), 2);
        let kept = cfg.channels.iter().find(|c| c.name == "kept").unwrap();
        assert_eq!(kept.target, "http://kept");
        let legacy = cfg.channels.iter().find(|c| c.name == "legacy").unwrap();
        assert_eq!(legacy.target, "http://legacy");
        assert_eq!(legacy.weight, 5);
    }

    #[test]
    fn resolve_path_prefers_cli_arg() {
        let p = GatewayConfig::resolve_path(Some(PathBuf::from("/tmp/custom.yaml")));
        assert_eq!(p, PathBuf::from("/tmp/custom.yaml"));
    }
}
