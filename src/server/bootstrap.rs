use crate::config::GatewayConfig;
use crate::server::{self, GatewayState};
use crate::tunnel::TunnelManager;
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Cadence of both the config hot-reload poll and the health prober tick —
/// one shared interval loop shape, not two independently-tuned ones.
const HOT_RELOAD_POLL_INTERVAL: Duration = Duration::from_secs(5);
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: Option<PathBuf>,
}

/// Gateway lifecycle: init -> load -> serve -> watch -> shutdown.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    let config_path = GatewayConfig::resolve_path(args.config_path);
    let config = GatewayConfig::load(&config_path)?;
    let state = GatewayState::new(config.clone(), config_path.clone())?;

    let shutdown = Arc::new(Notify::new());

    start_health_check_loop(&state, &shutdown);
    if config.settings.hot_reload {
        start_hot_reload_loop(&state, &shutdown);
    }

    let tunnel = start_tunnel_manager(&state, &config).await;

    let admin_listen = format!("{}:{}", config.server.ui.host, config.server.ui.port);
    if config.server.ui.enabled {
        let admin_state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = server::run_admin_server(&admin_listen, admin_state).await {
                tracing::error!("server: admin failed, error={}", e);
            }
        });
    }

    let listen = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("server: starting gateway, listen={}", listen);

    let proxy_handle = tokio::spawn({
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(&listen, state, shutdown).await }
    });

    wait_for_shutdown(&shutdown).await;

    if let Some(tunnel) = tunnel {
        tunnel.shutdown().await;
    }

    if let Err(e) = proxy_handle.await {
        tracing::error!("server: proxy task error: {}", e);
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

/// Collects every channel's tunnel advert and, if any are enabled and an
/// `ssh:` block is configured, starts a single `TunnelManager` covering
/// all of them — today's schema has one SSH target per gateway (§6), so
/// there is exactly one manager regardless of how many channels tunnel
/// through it.
async fn start_tunnel_manager(state: &GatewayState, config: &GatewayConfig) -> Option<Arc<TunnelManager>> {
    let adverts: Vec<_> = config
        .channels
        .iter()
        .filter_map(|c| c.tunnel.clone())
        .filter(|t| t.enabled)
        .collect();
    if adverts.is_empty() {
        return None;
    }
    let Some(ssh) = config.ssh.clone() else {
        tracing::warn!("tunnel: channels advertise tunnels but no ssh: block is configured, skipping");
        return None;
    };

    let reconnect_interval = Duration::from_millis(config.settings.reconnect_interval);
    let manager = TunnelManager::new(ssh, reconnect_interval);
    manager.clone().run(adverts);
    *state.tunnel.write().await = Some(manager.clone());
    Some(manager)
}

fn start_health_check_loop(state: &GatewayState, shutdown: &Arc<Notify>) {
    let channels = state.channels.clone();
    let client = state.health_client.clone();
    let bus = state.bus.clone();
    let shutdown = shutdown.clone();

    tokio::spawn(async move {
        loop {
            if sleep_or_shutdown(HEALTH_CHECK_INTERVAL, &shutdown).await {
                return;
            }
            crate::health::run_health_checks(&channels, &client, &bus).await;
        }
    });
}

/// Polls `config_path`'s mtime on `HOT_RELOAD_POLL_INTERVAL` and reloads
/// when it changes. On a bad reload the previous config keeps running and
/// the failure is logged — a hot reload never takes the gateway down.
fn start_hot_reload_loop(state: &GatewayState, shutdown: &Arc<Notify>) {
    let state = state.clone();
    let shutdown = shutdown.clone();
    let path = state.config_path.clone();

    tokio::spawn(async move {
        let mut last_modified = file_mtime(&path);
        loop {
            if sleep_or_shutdown(HOT_RELOAD_POLL_INTERVAL, &shutdown).await {
                return;
            }
            let modified = file_mtime(&path);
            if modified == last_modified {
                continue;
            }
            last_modified = modified;

            match GatewayConfig::reload(&path) {
                Ok(cfg) => match state.reload(cfg) {
                    Ok(()) => {
                        metrics::counter!("gateway_config_reloads_total", "result" => "ok").increment(1);
                        state.bus.info("config", "configuration hot-reloaded");
                    }
                    Err(e) => {
                        metrics::counter!("gateway_config_reloads_total", "result" => "error").increment(1);
                        state.bus.error("config", format!("hot reload rejected: {e}"));
                    }
                },
                Err(e) => {
                    metrics::counter!("gateway_config_reloads_total", "result" => "error").increment(1);
                    state.bus.error("config", format!("hot reload failed to parse config: {e}"));
                }
            }
        }
    });
}

fn file_mtime(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Sleep for `duration`, but return `true` immediately if shutdown is
/// signalled. Returns `false` if the full duration elapsed normally.
async fn sleep_or_shutdown(duration: Duration, shutdown: &Notify) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.notified() => true,
    }
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }

    shutdown.notify_waiters();
}
