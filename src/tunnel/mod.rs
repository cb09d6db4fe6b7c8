//! Component G: SSH reverse-tunnel manager (§4.G).
//!
//! For every channel that advertises `tunnel.enabled`, this module keeps
//! an SSH session open to the configured jump host and asks it to forward
//! `remote_port` back to `127.0.0.1:local_port` on this machine — the
//! usual "reverse tunnel so a NAT'd local service is reachable from the
//! gateway's public side" shape. One session is shared across every
//! tunnel advert on the same host/port/user triple.

use crate::config::{SshConfig, TunnelAdvertConfig};
use russh::client::{self, Handle};
use russh::{Channel, ChannelMsg};
use russh_keys::{load_secret_key, PrivateKeyWithHashAlg};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const KEEPALIVE_MISS_LIMIT: u32 = 3;
const FORCE_DESTROY_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("ssh connect failed: {0}")]
    Connect(String),
    #[error("ssh auth failed: {0}")]
    Auth(String),
    #[error("remote forward request failed: {0}")]
    Forward(String),
}

/// Maps a requested remote port (the `tcpip_forward` port) to the local
/// port it should relay to, so an inbound `forwarded-tcpip` channel open
/// knows where to dial.
struct ClientHandler {
    port_map: HashMap<u32, u16>,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    /// No host-key pinning is configured (§6 has no `knownHosts` field) —
    /// accepted unconditionally, the same trust-on-first-use stance the
    /// gateway's TLS layer takes for `tls_verify: false` upstreams.
    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    /// The far end opened a channel for a connection to one of our
    /// `tcpip_forward`ed ports. Relays it to the local port the matching
    /// channel advert named; a port with no mapping is dropped.
    async fn channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        _connected_address: &str,
        connected_port: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let Some(local_port) = self.port_map.get(&connected_port).copied() else {
            tracing::warn!(connected_port, "ssh tunnel: no local port mapped for forwarded connection, dropping");
            return Ok(());
        };
        tokio::spawn(async move {
            if let Err(e) = relay_channel_to_local(channel, local_port).await {
                tracing::warn!(error = %e, local_port, "ssh tunnel: relay to local port failed");
            }
        });
        Ok(())
    }
}

/// Pumps one inbound `forwarded-tcpip` channel against a freshly-dialed
/// local TCP connection until either side closes.
async fn relay_channel_to_local(mut channel: Channel<client::Msg>, local_port: u16) -> anyhow::Result<()> {
    let mut local = TcpStream::connect(("127.0.0.1", local_port)).await?;
    let (mut local_read, mut local_write) = local.split();
    let mut buf = [0u8; 8192];

    loop {
        tokio::select! {
            msg = channel.wait() => {
                match msg {
                    Some(ChannelMsg::Data { data }) => local_write.write_all(&data).await?,
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                    _ => {}
                }
            }
            n = local_read.read(&mut buf) => {
                let n = n?;
                if n == 0 {
                    let _ = channel.eof().await;
                    break;
                }
                channel.data(&buf[..n]).await?;
            }
        }
    }
    Ok(())
}

/// Best-effort cleanup run after a reconnect, before re-requesting forwards
/// (§4.G): the remote side may not have noticed the old session's listeners
/// died yet, so a stale `tcpip_forward` can still be bound when we ask for a
/// fresh one on the same port. Runs `fuser -k` for each forwarded port over
/// an exec channel and ignores every error — this is a nicety, not a
/// precondition, and `tcpip_forward` below still fails loudly if the port
/// really is stuck.
async fn cleanup_stale_listeners(handle: &Handle<ClientHandler>, adverts: &[TunnelAdvertConfig]) {
    for advert in adverts.iter().filter(|a| a.enabled) {
        let Ok(mut channel) = handle.channel_open_session().await else {
            continue;
        };
        let cmd = format!("fuser -k -n tcp {} 2>/dev/null; true", advert.remote_port);
        if channel.exec(true, cmd.as_str()).await.is_err() {
            continue;
        }
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | Some(ChannelMsg::ExitStatus { .. }) | None => {
                    break;
                }
                _ => {}
            }
        }
    }
}

/// Manages the SSH session(s) backing every tunneled channel. Reconnects
/// on drop with `settings.reconnectInterval` spacing and tears everything
/// down on `shutdown()`.
pub struct TunnelManager {
    config: SshConfig,
    reconnect_interval: Duration,
    destroyed: Arc<AtomicBool>,
    session: Mutex<Option<Arc<Handle<ClientHandler>>>>,
}

impl TunnelManager {
    pub fn new(config: SshConfig, reconnect_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            config,
            reconnect_interval,
            destroyed: Arc::new(AtomicBool::new(false)),
            session: Mutex::new(None),
        })
    }

    /// Spawns the background task that keeps the session connected and
    /// registers `adverts` (one `tcpip_forward` request per entry). Runs
    /// until `shutdown()` is called.
    pub fn run(self: Arc<Self>, adverts: Vec<TunnelAdvertConfig>) {
        tokio::spawn(async move {
            let mut is_reconnect = false;
            while !self.destroyed.load(Ordering::Relaxed) {
                match self.connect_and_serve(&adverts, is_reconnect).await {
                    Ok(()) => {}
                    Err(err) => {
                        tracing::warn!(error = %err, "ssh tunnel session ended, reconnecting");
                    }
                }
                if self.destroyed.load(Ordering::Relaxed) {
                    break;
                }
                sleep(self.reconnect_interval).await;
                is_reconnect = true;
            }
        });
    }

    async fn connect_and_serve(&self, adverts: &[TunnelAdvertConfig], is_reconnect: bool) -> anyhow::Result<()> {
        let handle = self.connect(adverts).await?;
        let handle = Arc::new(handle);
        *self.session.lock().await = Some(handle.clone());

        if is_reconnect {
            cleanup_stale_listeners(&handle, adverts).await;
        }

        for advert in adverts {
            if !advert.enabled {
                continue;
            }
            handle
                .tcpip_forward("127.0.0.1", advert.remote_port as u32)
                .await
                .map_err(|e| TunnelError::Forward(e.to_string()))?;
        }

        let keepalive_handle = handle.clone();
        let destroyed = self.destroyed.clone();
        let mut misses = 0u32;
        loop {
            if destroyed.load(Ordering::Relaxed) {
                break;
            }
            sleep(KEEPALIVE_INTERVAL).await;
            match keepalive_handle.channel_open_session().await {
                Ok(_) => misses = 0,
                Err(_) => {
                    misses += 1;
                    if misses >= KEEPALIVE_MISS_LIMIT {
                        anyhow::bail!("missed {misses} consecutive keepalives");
                    }
                }
            }
        }
        Ok(())
    }

    async fn connect(&self, adverts: &[TunnelAdvertConfig]) -> anyhow::Result<Handle<ClientHandler>> {
        let addr = (self.config.host.as_str(), self.config.port);
        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| TunnelError::Connect(e.to_string()))?;

        let port_map = adverts
            .iter()
            .filter(|a| a.enabled)
            .map(|a| (a.remote_port as u32, a.local_port))
            .collect();
        let handler = ClientHandler { port_map };

        let ssh_config = Arc::new(client::Config::default());
        let mut handle = client::connect_stream(ssh_config, tcp, handler)
            .await
            .map_err(|e| TunnelError::Connect(e.to_string()))?;

        if let Some(path) = &self.config.private_key_path {
            let expanded = expand_home(path);
            let key = load_secret_key(&expanded, None)
                .map_err(|e| TunnelError::Auth(e.to_string()))?;
            let ok = handle
                .authenticate_publickey(
                    &self.config.username,
                    PrivateKeyWithHashAlg::new(Arc::new(key), None),
                )
                .await
                .map_err(|e| TunnelError::Auth(e.to_string()))?;
            if !ok.success() {
                anyhow::bail!(TunnelError::Auth("public key rejected".to_string()));
            }
        } else if let Some(password) = &self.config.password {
            let ok = handle
                .authenticate_password(&self.config.username, password)
                .await
                .map_err(|e| TunnelError::Auth(e.to_string()))?;
            if !ok.success() {
                anyhow::bail!(TunnelError::Auth("password rejected".to_string()));
            }
        } else {
            anyhow::bail!(TunnelError::Auth(
                "no private_key_path or password configured".to_string()
            ));
        }

        Ok(handle)
    }

    /// Sets the destroyed flag, cancels any pending reconnect by letting
    /// the run loop observe it on its next wake, and drops the session —
    /// russh closes the underlying connection on `Handle` drop. Gives the
    /// session a short grace window before the caller moves on, matching
    /// the bounded drain the rest of the gateway uses at shutdown.
    pub async fn shutdown(&self) {
        self.destroyed.store(true, Ordering::Relaxed);
        if let Some(handle) = self.session.lock().await.take() {
            drop(handle);
        }
        sleep(FORCE_DESTROY_GRACE).await;
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_home_rewrites_tilde_prefix() {
        let expanded = expand_home("~/.ssh/id_ed25519");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expanded, home.join(".ssh/id_ed25519"));
        }
    }

    #[test]
    fn expand_home_leaves_absolute_paths_untouched() {
        assert_eq!(expand_home("/etc/ssh/key"), PathBuf::from("/etc/ssh/key"));
    }
}
