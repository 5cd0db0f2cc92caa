//! One connected client: its control channel, its tunnels, its site name.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;

use crate::channel::{ChannelError, ChannelState, CommandHandler, ControlChannel};
use crate::config::Config;
use crate::protocol::TunnelType;
use crate::proxy::server::ServerProxy;
use crate::registry::Registry;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unsupported tunnel type {0:?}")]
    UnsupportedTunnelType(TunnelType),
    #[error("no free port pair after {attempts} attempts")]
    NoFreePorts { attempts: u32 },
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

pub struct Session {
    channel: Arc<ControlChannel>,
    tunnels: Registry<ServerProxy>,
    cfg: Config,
    site: Mutex<String>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(cfg: Config) -> Arc<Session> {
        let channel = ControlChannel::new(cfg.bufsize);
        Arc::new(Session {
            channel,
            tunnels: Registry::new(),
            cfg,
            site: Mutex::new(String::new()),
        })
    }

    pub fn channel(&self) -> &Arc<ControlChannel> {
        &self.channel
    }

    pub fn tunnels(&self) -> &Registry<ServerProxy> {
        &self.tunnels
    }

    pub async fn site(&self) -> String {
        self.site.lock().await.clone()
    }

    /// Drive the session's control channel over `stream` until it fails.
    pub async fn run<S>(self: &Arc<Self>, stream: S) -> Result<(), ChannelError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut handler = ServerHandler {
            session: self.clone(),
        };
        self.channel.run(stream, &mut handler).await
    }

    /// Stand up a tunnel for this session and tell the client to dial in.
    ///
    /// Returns the tunnel id. The relay itself runs (and outlives an eventual
    /// control-channel teardown) on its own task.
    pub async fn create_tunnel(
        self: &Arc<Self>,
        advertise_host: &str,
        tunnel_type: TunnelType,
        client_host: &str,
        client_port: u16,
    ) -> Result<u64, SessionError> {
        if tunnel_type != TunnelType::Tcp {
            return Err(SessionError::UnsupportedTunnelType(tunnel_type));
        }

        let proxy = self
            .allocate_relay_with(|up, dn| {
                ServerProxy::bind(up, dn, self.cfg.bufsize, self.channel.session_id())
            })
            .await?;

        let id = self.tunnels.allocate(proxy.clone()).await;
        proxy.set_tunnel_id(id);

        let port_up = proxy.port_up();
        let port_dn = proxy.port_dn();
        tracing::info!(
            session = self.channel.session_id(),
            tunnel = id,
            port_up,
            port_dn,
            "session: tunnel allocated"
        );

        self.channel.send_tunnel_req(
            advertise_host,
            port_up,
            client_host,
            client_port,
            tunnel_type.as_u8(),
            id,
        )?;

        let session = self.clone();
        tokio::spawn(async move {
            let _ = proxy.run().await;
            session.tunnels.remove(id).await;
        });

        Ok(id)
    }

    /// Bind a relay on a random port pair, retrying with a fresh pair on any
    /// bind failure. Both ports are regenerated together so a stuck port on
    /// one side cannot pin the other.
    pub(crate) async fn allocate_relay_with<F, Fut>(
        &self,
        mut bind: F,
    ) -> Result<Arc<ServerProxy>, SessionError>
    where
        F: FnMut(u16, u16) -> Fut,
        Fut: Future<Output = std::io::Result<ServerProxy>>,
    {
        let attempts = self.cfg.bind_retries;
        for attempt in 1..=attempts {
            let up = self.tunnels.random_port(&self.cfg.tunnel_ports).await;
            let dn = self.tunnels.random_port(&self.cfg.admin_ports).await;
            match bind(up, dn).await {
                Ok(proxy) => return Ok(Arc::new(proxy)),
                Err(err) => {
                    tracing::debug!(
                        session = self.channel.session_id(),
                        attempt,
                        port_up = up,
                        port_dn = dn,
                        err = %err,
                        "session: port pair unavailable"
                    );
                }
            }
        }
        Err(SessionError::NoFreePorts { attempts })
    }
}

struct ServerHandler {
    session: Arc<Session>,
}

#[async_trait]
impl CommandHandler for ServerHandler {
    async fn on_connect(&mut self, ch: &Arc<ControlChannel>, site_name: String) {
        *self.session.site.lock().await = site_name.clone();
        ch.advance(ChannelState::Connected);
        tracing::info!(
            session = ch.session_id(),
            site = %site_name,
            "session: client connected"
        );
        if let Err(err) = ch.send_assign(ch.session_id()) {
            tracing::warn!(session = ch.session_id(), err = %err, "session: assign failed");
        }
    }

    async fn on_ping(&mut self, ch: &Arc<ControlChannel>, message: String) {
        tracing::trace!(session = ch.session_id(), msg = %message, "session: ping");
        if let Err(err) = ch.send_pong("PONG") {
            tracing::warn!(session = ch.session_id(), err = %err, "session: pong failed");
        }
    }

    async fn on_tunnel_res(
        &mut self,
        ch: &Arc<ControlChannel>,
        tunnel_id: u64,
        success: bool,
        message: String,
    ) {
        tracing::debug!(
            session = ch.session_id(),
            tunnel = tunnel_id,
            success,
            msg = %message,
            "session: tunnel result"
        );
    }
}
