//! Tunnel client: keeps one control channel to the server alive and dials
//! out relays when asked.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::sleep;

use crate::channel::{ChannelState, CommandHandler, ControlChannel};
use crate::config::Config;
use crate::protocol::TunnelType;
use crate::proxy::client::ClientProxy;
use crate::registry::Registry;
use crate::resolver;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub site_name: String,
    pub server_host: String,
    pub server_port: u16,
}

pub struct Client {
    opts: ClientOptions,
    cfg: Config,
    tunnels: Arc<Registry<ClientProxy>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("opts", &self.opts)
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn new(cfg: Config, opts: ClientOptions) -> Client {
        Client {
            opts,
            cfg,
            tunnels: Arc::new(Registry::new()),
        }
    }

    pub fn tunnels(&self) -> &Arc<Registry<ClientProxy>> {
        &self.tunnels
    }

    /// Connect, stay connected, reconnect. Never returns except through
    /// cancellation.
    pub async fn run(&self) -> anyhow::Result<()> {
        let backoff = self.cfg.reconnect_backoff;
        loop {
            match self.run_once().await {
                Ok(()) => tracing::info!("client: control channel closed"),
                Err(err) => tracing::warn!(err = %err, "client: control channel lost"),
            }
            tracing::info!(
                backoff = %humantime::format_duration(backoff),
                "client: reconnecting"
            );
            let mut left = backoff.as_secs();
            while left > 0 {
                tracing::info!(seconds = left, "client: reconnecting");
                sleep(std::time::Duration::from_secs(1)).await;
                left -= 1;
            }
        }
    }

    async fn run_once(&self) -> anyhow::Result<()> {
        let addrs = resolver::resolve(&self.opts.server_host, self.opts.server_port).await?;
        let stream = resolver::connect_any(&addrs).await?;
        tracing::info!(
            server = %format_args!("{}:{}", self.opts.server_host, self.opts.server_port),
            site = %self.opts.site_name,
            "client: connected"
        );

        let channel = ControlChannel::new(self.cfg.bufsize);
        channel.send_connect(&self.opts.site_name)?;

        let mut handler = ClientHandler {
            tunnels: self.tunnels.clone(),
            cfg: self.cfg.clone(),
        };
        channel.run(stream, &mut handler).await?;
        Ok(())
    }
}

pub(crate) struct ClientHandler {
    tunnels: Arc<Registry<ClientProxy>>,
    cfg: Config,
}

#[async_trait]
impl CommandHandler for ClientHandler {
    async fn on_assign(&mut self, ch: &Arc<ControlChannel>, session_id: u64) {
        ch.set_session_id(session_id);
        ch.advance(ChannelState::Connected);
        tracing::info!(session = session_id, "client: session assigned");
        if let Err(err) = ch.send_ping("PING") {
            tracing::warn!(session = session_id, err = %err, "client: ping failed");
        }
    }

    async fn on_pong(&mut self, ch: &Arc<ControlChannel>, message: String) {
        tracing::trace!(session = ch.session_id(), msg = %message, "client: pong");
        let ch = ch.clone();
        let interval = self.cfg.heartbeat_interval;
        tokio::spawn(async move {
            sleep(interval).await;
            if ch.state() == ChannelState::Connected {
                if let Err(err) = ch.send_ping("PING") {
                    tracing::debug!(session = ch.session_id(), err = %err, "client: ping failed");
                }
            }
        });
    }

    async fn on_tunnel_req(
        &mut self,
        ch: &Arc<ControlChannel>,
        server_host: String,
        server_port: u16,
        client_host: String,
        client_port: u16,
        tunnel_type: u8,
        tunnel_id: u64,
    ) {
        match TunnelType::try_from(tunnel_type) {
            Ok(TunnelType::Tcp) => {}
            Ok(TunnelType::Udp) => {
                tracing::warn!(
                    session = ch.session_id(),
                    tunnel = tunnel_id,
                    "client: udp tunnels are not supported"
                );
                return;
            }
            Err(err) => {
                tracing::warn!(
                    session = ch.session_id(),
                    tunnel = tunnel_id,
                    err = %err,
                    "client: rejecting tunnel request"
                );
                return;
            }
        }

        tracing::info!(
            session = ch.session_id(),
            tunnel = tunnel_id,
            server = %format_args!("{server_host}:{server_port}"),
            target = %format_args!("{client_host}:{client_port}"),
            "client: tunnel requested"
        );

        let proxy = Arc::new(ClientProxy::new(
            ch.session_id(),
            server_host,
            server_port,
            client_host,
            client_port,
            self.cfg.bufsize,
        ));

        // The server's tunnel id names the tunnel on the wire; locally the
        // registry hands out its own key.
        let local_id = self.tunnels.allocate(proxy.clone()).await;
        proxy.set_tunnel_id(tunnel_id);

        let tunnels = self.tunnels.clone();
        tokio::spawn(async move {
            let _ = proxy.run().await;
            tunnels.remove(local_id).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, FrameDecoder};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    async fn read_one_command(io: &mut DuplexStream) -> Command {
        let mut decoder = FrameDecoder::new();
        let mut chunk = [0u8; 256];
        loop {
            if let Some(raw) = decoder.next_frame().unwrap() {
                return Command::decode(&raw).unwrap();
            }
            let n = io.read(&mut chunk).await.unwrap();
            assert!(n > 0, "peer closed before a full frame arrived");
            decoder.extend(&chunk[..n]);
        }
    }

    #[tokio::test]
    async fn assign_triggers_first_ping() {
        let ch = ControlChannel::new(1024);
        let (mut near, far) = tokio::io::duplex(4096);

        let ch2 = ch.clone();
        tokio::spawn(async move {
            let mut handler = ClientHandler {
                tunnels: Arc::new(Registry::new()),
                cfg: Config::default(),
            };
            let _ = ch2.run(far, &mut handler).await;
        });

        let assign = Command::Assign { session_id: 8 };
        near.write_all(&assign.encode().unwrap()).await.unwrap();

        assert_eq!(
            read_one_command(&mut near).await,
            Command::Ping {
                message: "PING".into()
            }
        );
        assert_eq!(ch.session_id(), 8);
        assert_eq!(ch.state(), ChannelState::Connected);
    }

    // The heartbeat only observes its own PINGs going out: a peer that stops
    // answering is never declared dead, the channel just idles until TCP
    // reports a hard failure. Passing this test requires a read deadline on
    // the control channel, which it does not have yet.
    #[tokio::test]
    #[ignore = "no read deadline: a silent peer is never detected"]
    async fn silent_server_fails_the_channel() {
        let ch = ControlChannel::new(1024);
        let (mut near, far) = tokio::io::duplex(4096);

        let ch2 = ch.clone();
        let task = tokio::spawn(async move {
            let mut handler = ClientHandler {
                tunnels: Arc::new(Registry::new()),
                cfg: Config {
                    heartbeat_interval: std::time::Duration::from_millis(10),
                    ..Config::default()
                },
            };
            ch2.run(far, &mut handler).await
        });

        let assign = Command::Assign { session_id: 8 };
        near.write_all(&assign.encode().unwrap()).await.unwrap();
        let _ = read_one_command(&mut near).await;

        // Never answer the PING; the channel should notice within a few
        // heartbeat intervals.
        let res = tokio::time::timeout(std::time::Duration::from_millis(200), task)
            .await
            .expect("channel should fail on a silent peer");
        assert!(res.unwrap().is_err());
    }
}
