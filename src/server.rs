//! Control-plane server: accepts clients and hands out tunnels on request.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpListener;

use crate::channel::ChannelState;
use crate::config::Config;
use crate::protocol::TunnelType;
use crate::registry::Registry;
use crate::session::{Session, SessionError};

pub struct Server {
    cfg: Config,
    sessions: Registry<Session>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").finish_non_exhaustive()
    }
}

impl Server {
    pub fn new(cfg: Config) -> Arc<Server> {
        Arc::new(Server {
            cfg,
            sessions: Registry::new(),
        })
    }

    pub fn sessions(&self) -> &Registry<Session> {
        &self.sessions
    }

    /// Accept control connections forever. Each session lives on its own
    /// task and is dropped from the registry when its channel fails; relays
    /// it spawned keep pumping on their own tasks.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let session = Session::new(self.cfg.clone());
            let sid = self.sessions.allocate(session.clone()).await;
            session.channel().set_session_id(sid);
            tracing::info!(session = sid, peer = %peer, "server: control connection");

            let server = self.clone();
            tokio::spawn(async move {
                let res = session.run(stream).await;
                server.sessions.remove(sid).await;
                match res {
                    Ok(()) => tracing::info!(session = sid, "server: session ended"),
                    Err(err) => {
                        tracing::info!(session = sid, err = %err, "server: session lost")
                    }
                }
            });
        }
    }

    /// Open a tunnel on behalf of an operator.
    pub async fn create_tunnel(
        &self,
        session_id: u64,
        advertise_host: &str,
        tunnel_type: TunnelType,
        client_host: &str,
        client_port: u16,
    ) -> Result<u64, ServerError> {
        let session = self
            .sessions
            .get(session_id)
            .await
            .ok_or(ServerError::UnknownSession(session_id))?;
        Ok(session
            .create_tunnel(advertise_host, tunnel_type, client_host, client_port)
            .await?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("unknown session {0}")]
    UnknownSession(u64),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Read operator input line by line; every line asks each connected session
/// for a new tunnel to the configured target. Returns `Ok` on input EOF.
pub async fn operator_loop<R>(
    server: Arc<Server>,
    input: R,
    advertise_host: String,
    target_host: String,
    target_port: u16,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(input).lines();
    while let Some(_line) = lines.next_line().await? {
        let ids = server.sessions().ids().await;
        if ids.is_empty() {
            tracing::info!("server: no connected sessions");
            continue;
        }
        for sid in ids {
            let Some(session) = server.sessions().get(sid).await else {
                continue;
            };
            if session.channel().state() != ChannelState::Connected {
                continue;
            }
            match session
                .create_tunnel(&advertise_host, TunnelType::Tcp, &target_host, target_port)
                .await
            {
                Ok(id) => {
                    tracing::info!(session = sid, tunnel = id, "server: tunnel requested")
                }
                Err(err) => {
                    tracing::warn!(session = sid, err = %err, "server: tunnel request failed")
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortRange;
    use crate::protocol::{Command, FrameDecoder};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    #[tokio::test]
    async fn unknown_session_is_reported() {
        let server = Server::new(Config::default());
        let res = server
            .create_tunnel(12345, "10.0.0.1", TunnelType::Tcp, "127.0.0.1", 22)
            .await;
        assert!(matches!(res, Err(ServerError::UnknownSession(12345))));
    }

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
    async fn operator_eof_leaves_sessions_serving() {
        let mut cfg = Config::default();
        // OS-assigned ports keep the test off real ranges.
        cfg.admin_ports = PortRange { begin: 0, end: 0 };
        cfg.tunnel_ports = PortRange { begin: 0, end: 0 };

        let server = Server::new(cfg.clone());
        let session = Session::new(cfg);
        let sid = server.sessions().allocate(session.clone()).await;
        session.channel().set_session_id(sid);

        let (mut near, far) = tokio::io::duplex(4096);
        {
            let session = session.clone();
            tokio::spawn(async move {
                let _ = session.run(far).await;
            });
        }

        let connect = Command::Connect {
            site_name: "ops".into(),
        };
        near.write_all(&connect.encode().unwrap()).await.unwrap();
        assert_eq!(
            read_one_command(&mut near).await,
            Command::Assign { session_id: sid }
        );

        // One operator line, then EOF.
        let (mut op, op_input) = tokio::io::duplex(64);
        op.write_all(b"\n").await.unwrap();
        drop(op);

        operator_loop(
            server.clone(),
            op_input,
            "127.0.0.1".into(),
            "127.0.0.1".into(),
            2222,
        )
        .await
        .unwrap();

        // The line produced a tunnel; EOF ended the loop without touching
        // the session.
        assert!(matches!(
            read_one_command(&mut near).await,
            Command::TunnelReq { .. }
        ));
        assert_eq!(session.tunnels().len().await, 1);
        assert!(server.sessions().get(sid).await.is_some());
        assert_eq!(session.channel().state(), ChannelState::Connected);
    }
}
