//! Component C: router engine (§4.C).
//!
//! Route groups bind a request path pattern to a candidate channel list
//! and a selection strategy. There is no host/domain partitioning here
//! (the teacher's radix-tree host router had no counterpart in this
//! spec) — paths are matched against `globset` patterns in declaration
//! order, first match wins, and a synthetic catch-all group spanning
//! every enabled channel backs any path nothing else matches.

use crate::channel::{Channel, ChannelStore};
use crate::config::{RouteGroupConfig, RouteStrategy};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const CATCH_ALL: &str = "*";

struct CompiledGroup {
    path: String,
    matcher: GlobSet,
    channels: Vec<String>,
    strategy: RouteStrategy,
}

/// Hot-reloadable route table. Rebuilt wholesale on every config change
/// and swapped in behind an `ArcSwap` — readers never block a writer and
/// never see a partially-updated table, the same pattern the teacher uses
/// for its host route table.
pub struct RouteTable {
    groups: Vec<CompiledGroup>,
}

impl RouteTable {
    fn build(routes: &[RouteGroupConfig]) -> anyhow::Result<Self> {
        let mut groups = Vec::with_capacity(routes.len());
        for r in routes {
            let mut builder = GlobSetBuilder::new();
            builder.add(
                GlobBuilder::new(&r.path)
                    .literal_separator(true)
                    .build()?,
            );
            // `prefix/**` must also match the bare `prefix` itself (§3:
            // "matches `prefix` or any descendant"); globset's `**`
            // requires the literal `/` before it, so add the bare prefix
            // as a second alternative in the same set.
            if let Some(bare) = r.path.strip_suffix("/**") {
                builder.add(GlobBuilder::new(bare).literal_separator(true).build()?);
            }
            groups.push(CompiledGroup {
                path: r.path.clone(),
                matcher: builder.build()?,
                channels: r.channels.clone(),
                strategy: r.strategy,
            });
        }
        Ok(Self { groups })
    }

    fn resolve_group(&self, path: &str) -> Option<&CompiledGroup> {
        self.groups.iter().find(|g| g.matcher.is_match(path))
    }
}

/// Routing engine: the compiled table plus the per-group round-robin
/// cursors needed for `RouteStrategy::RoundRobin`. Cursors are keyed by
/// group path (its "pool identity") so a config reload that leaves a
/// group's channel list unchanged doesn't reset its rotation.
pub struct Router {
    table: ArcSwap<RouteTable>,
    cursors: DashMap<String, AtomicUsize>,
    channels: ChannelStore,
}

/// Outcome of a successful resolution: the chosen channel plus the full
/// ordered candidate list the caller can fail over through.
pub struct Resolution {
    pub channel: Arc<Channel>,
    pub candidates: Vec<Arc<Channel>>,
}

impl Router {
    pub fn new(channels: ChannelStore, routes: &[RouteGroupConfig]) -> anyhow::Result<Self> {
        Ok(Self {
            table: ArcSwap::new(Arc::new(RouteTable::build(routes)?)),
            cursors: DashMap::new(),
            channels,
        })
    }

    /// Atomically swaps in a route table built from the new config. On a
    /// glob-compile error the caller keeps the previous table (hot-reload
    /// keep-previous-on-error semantics, §7).
    pub fn update(&self, routes: &[RouteGroupConfig]) -> anyhow::Result<()> {
        let table = RouteTable::build(routes)?;
        self.table.store(Arc::new(table));
        Ok(())
    }

    fn candidate_names(&self, path: &str) -> (String, Vec<String>, RouteStrategy) {
        let table = self.table.load();
        match table.resolve_group(path) {
            Some(g) => (g.path.clone(), g.channels.clone(), g.strategy),
            None => {
                let mut all = Vec::new();
                self.channels.for_each(|name, ch| {
                    if ch.is_enabled() {
                        all.push(name.to_string());
                    }
                });
                (CATCH_ALL.to_string(), all, RouteStrategy::Priority)
            }
        }
    }

    /// Resolves `path` to a channel, honoring the group's strategy and
    /// excluding any name in `excluded` (already-tried channels during a
    /// retry loop's failover, §4.E).
    pub fn resolve(&self, path: &str, excluded: &[String]) -> Option<Resolution> {
        let (pool_key, names, strategy) = self.candidate_names(path);
        let not_excluded: Vec<Arc<Channel>> = names
            .iter()
            .filter(|n| !excluded.iter().any(|e| e == *n))
            .filter_map(|n| self.channels.get(n))
            .collect();

        let mut candidates: Vec<Arc<Channel>> =
            not_excluded.iter().filter(|c| c.is_available()).cloned().collect();

        // §4.C step 3: nothing fully available — fall back to the degraded
        // pool of enabled+fallback channels (last-resort operation) before
        // giving up entirely.
        if candidates.is_empty() {
            candidates = not_excluded
                .iter()
                .filter(|c| c.is_enabled() && c.is_fallback())
                .cloned()
                .collect();
        }

        if candidates.is_empty() {
            return None;
        }

        let chosen = match strategy {
            RouteStrategy::Priority => select_priority(&candidates),
            RouteStrategy::RoundRobin => select_round_robin(&candidates, &self.cursors, &pool_key),
            RouteStrategy::LowestLatency => select_lowest_latency(&candidates),
        };

        candidates.retain(|c| !Arc::ptr_eq(c, &chosen));
        candidates.insert(0, chosen.clone());

        Some(Resolution {
            channel: chosen,
            candidates,
        })
    }
}

/// Non-fallback channels first (by descending weight), fallback channels
/// only once every non-fallback candidate is excluded.
fn select_priority(candidates: &[Arc<Channel>]) -> Arc<Channel> {
    let primary = candidates.iter().filter(|c| !c.is_fallback()).max_by_key(|c| c.weight());
    primary
        .or_else(|| candidates.iter().max_by_key(|c| c.weight()))
        .cloned()
        .expect("candidates is non-empty")
}

fn select_round_robin(
    candidates: &[Arc<Channel>],
    cursors: &DashMap<String, AtomicUsize>,
    pool_key: &str,
) -> Arc<Channel> {
    let cursor = cursors
        .entry(pool_key.to_string())
        .or_insert_with(|| AtomicUsize::new(0));
    let idx = cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
    candidates[idx].clone()
}

fn select_lowest_latency(candidates: &[Arc<Channel>]) -> Arc<Channel> {
    candidates
        .iter()
        .min_by_key(|c| c.last_latency_ms())
        .cloned()
        .expect("candidates is non-empty")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChannelConfig, KeyStrategy};

    fn channel_cfg(name: &str, weight: u32, fallback: bool) -> ChannelConfig {
        ChannelConfig {
            name: name.to_string(),
            target: "http://example.invalid".to_string(),
            keys: vec!["k".to_string()],
            key_strategy: KeyStrategy::RoundRobin,
            weight,
            fallback,
            enabled: true,
            tunnel: None,
            health_check: None,
        }
    }

    fn store_with(channels: &[(&str, u32, bool)]) -> ChannelStore {
        let store = ChannelStore::new();
        for (name, weight, fallback) in channels {
            store.upsert(channel_cfg(name, *weight, *fallback));
        }
        store
    }

    #[test]
    fn catch_all_covers_every_enabled_channel_with_no_routes() {
        let store = store_with(&[("a", 1, false), ("b", 1, false)]);
        let router = Router::new(store, &[]).unwrap();
        let resolution = router.resolve("/anything", &[]).unwrap();
        assert_eq!(resolution.candidates.len(), 2);
    }

    #[test]
    fn priority_strategy_prefers_higher_weight_non_fallback() {
        let store = store_with(&[("low", 1, false), ("high", 10, false), ("fb", 1, true)]);
        let routes = vec![RouteGroupConfig {
            path: "/v1/**".to_string(),
            channels: vec!["low".into(), "high".into(), "fb".into()],
            strategy: RouteStrategy::Priority,
        }];
        let router = Router::new(store, &routes).unwrap();
        let resolution = router.resolve("/v1/chat", &[]).unwrap();
        assert_eq!(resolution.channel.name(), "high");
    }

    #[test]
    fn priority_falls_back_when_non_fallback_excluded() {
        let store = store_with(&[("high", 10, false), ("fb", 1, true)]);
        let routes = vec![RouteGroupConfig {
            path: "/v1/**".to_string(),
            channels: vec!["high".into(), "fb".into()],
            strategy: RouteStrategy::Priority,
        }];
        let router = Router::new(store, &routes).unwrap();
        let resolution = router.resolve("/v1/chat", &["high".to_string()]).unwrap();
        assert_eq!(resolution.channel.name(), "fb");
    }

    #[test]
    fn round_robin_rotates_across_calls() {
        let store = store_with(&[("a", 1, false), ("b", 1, false)]);
        let routes = vec![RouteGroupConfig {
            path: "/v1/**".to_string(),
            channels: vec!["a".into(), "b".into()],
            strategy: RouteStrategy::RoundRobin,
        }];
        let router = Router::new(store, &routes).unwrap();
        let first = router.resolve("/v1/x", &[]).unwrap().channel.name().to_string();
        let second = router.resolve("/v1/x", &[]).unwrap().channel.name().to_string();
        assert_ne!(first, second);
    }

    #[test]
    fn glob_prefix_double_star_matches_nested_paths() {
        let store = store_with(&[("a", 1, false)]);
        let routes = vec![RouteGroupConfig {
            path: "/v1/**".to_string(),
            channels: vec!["a".into()],
            strategy: RouteStrategy::Priority,
        }];
        let router = Router::new(store, &routes).unwrap();
        assert!(router.resolve("/v1/chat/completions", &[]).is_some());
    }

    #[test]
    fn glob_prefix_double_star_matches_bare_prefix_too() {
        let store = store_with(&[("a", 1, false)]);
        let routes = vec![RouteGroupConfig {
            path: "/v1/**".to_string(),
            channels: vec!["a".into()],
            strategy: RouteStrategy::Priority,
        }];
        let router = Router::new(store, &routes).unwrap();
        assert!(router.resolve("/v1", &[]).is_some());
    }

    #[test]
    fn no_available_candidates_returns_none() {
        let store = ChannelStore::new();
        let router = Router::new(store, &[]).unwrap();
        assert!(router.resolve("/v1/x", &[]).is_none());
    }

    #[test]
    fn update_swaps_table_atomically() {
        let store = store_with(&[("a", 1, false), ("b", 1, false)]);
        let router = Router::new(store, &[]).unwrap();
        let new_routes = vec![RouteGroupConfig {
            path: "/only-a/**".to_string(),
            channels: vec!["a".into()],
            strategy: RouteStrategy::Priority,
        }];
        router.update(&new_routes).unwrap();
        let resolution = router.resolve("/only-a/x", &[]).unwrap();
        assert_eq!(resolution.candidates.len(), 1);
        assert_eq!(resolution.channel.name(), "a");
    }
}
