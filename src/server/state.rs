use crate::channel::ChannelStore;
use crate::config::GatewayConfig;
use crate::logger::EventBus;
use crate::metrics::Metrics;
use crate::router::Router;
use crate::tunnel::TunnelManager;
use anyhow::Result;
use arc_swap::ArcSwap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Shared gateway state, cheaply cloneable. Every subsystem (proxy, admin
/// API, health prober, hot-reload watcher) reaches the live channel map
/// and route table through here rather than owning a copy.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<ArcSwap<GatewayConfig>>,
    pub config_path: PathBuf,
    pub channels: ChannelStore,
    pub router: Arc<Router>,
    pub bus: EventBus,
    pub metrics: Metrics,
    pub health_client: reqwest::Client,
    pub tunnel: Arc<RwLock<Option<Arc<TunnelManager>>>>,
    pub start_time: Instant,
}

impl GatewayState {
    pub fn new(config: GatewayConfig, config_path: PathBuf) -> Result<Self> {
        let bus = EventBus::new(&config.settings.log_level);
        let channels = ChannelStore::new();
        channels.init_from_configs(&config.channels);
        let router = Arc::new(Router::new(channels.clone(), &config.routes)?);
        let metrics = Metrics::install();
        metrics::gauge!("gateway_config_channels_total").set(config.channels.len() as f64);

        Ok(Self {
            config: Arc::new(ArcSwap::new(Arc::new(config))),
            config_path,
            channels,
            router,
            bus,
            metrics,
            health_client: crate::health::build_health_check_client(),
            tunnel: Arc::new(RwLock::new(None)),
            start_time: Instant::now(),
        })
    }

    /// Hot reload (§5 "Hot reload"): builds a fresh channel map and route
    /// table from `new_config` and atomically swaps them in. Requests
    /// already dispatching against the old channel objects (held as
    /// `Arc<Channel>` by their in-flight `Resolution`) complete against
    /// that old state; nothing here can retroactively affect them. Stats
    /// and credential liveness are not migrated — a reload is a
    /// replacement, not a merge (§5).
    pub fn reload(&self, new_config: GatewayConfig) -> Result<()> {
        self.router.update(&new_config.routes)?;
        self.channels.replace_all(&new_config.channels);
        metrics::gauge!("gateway_config_channels_total").set(new_config.channels.len() as f64);
        self.config.store(Arc::new(new_config));
        Ok(())
    }

    pub fn proxy_deps(&self) -> crate::proxy::ProxyDeps {
        crate::proxy::ProxyDeps {
            router: self.router.clone(),
            config: self.config.clone(),
            bus: self.bus.clone(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
