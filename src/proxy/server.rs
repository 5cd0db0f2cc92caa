//! Server-side relay: a bound port pair waiting for both ends of a tunnel.
//!
//! `port_up` faces the tunnel client and must be accepted first; `port_dn`
//! faces the administrator. An admin who connects early just sits in the
//! listener backlog until the client shows up, so nothing written early is
//! lost.

use std::io;
use std::sync::OnceLock;

use tokio::net::TcpListener;

use super::{ProxyState, StateCell, pump};

#[derive(Debug)]
pub struct ServerProxy {
    session_id: u64,
    tunnel_id: OnceLock<u64>,
    ln_up: TcpListener,
    ln_dn: TcpListener,
    port_up: u16,
    port_dn: u16,
    bufsize: usize,
    state: StateCell,
}

impl ServerProxy {
    /// Bind both listeners. Either bind failing fails the whole pair; the
    /// caller retries with a fresh pair of ports.
    pub async fn bind(
        port_up: u16,
        port_dn: u16,
        bufsize: usize,
        session_id: u64,
    ) -> io::Result<ServerProxy> {
        let ln_up = TcpListener::bind(("0.0.0.0", port_up)).await?;
        let ln_dn = TcpListener::bind(("0.0.0.0", port_dn)).await?;
        let port_up = ln_up.local_addr()?.port();
        let port_dn = ln_dn.local_addr()?.port();
        Ok(ServerProxy {
            session_id,
            tunnel_id: OnceLock::new(),
            ln_up,
            ln_dn,
            port_up,
            port_dn,
            bufsize,
            state: StateCell::new(),
        })
    }

    pub fn set_tunnel_id(&self, id: u64) {
        let _ = self.tunnel_id.set(id);
    }

    pub fn tunnel_id(&self) -> u64 {
        self.tunnel_id.get().copied().unwrap_or(0)
    }

    pub fn port_up(&self) -> u16 {
        self.port_up
    }

    pub fn port_dn(&self) -> u16 {
        self.port_dn
    }

    pub fn state(&self) -> ProxyState {
        self.state.get()
    }

    /// Accept the tunnel side, then the admin side, then pump until either
    /// closes.
    pub async fn run(&self) -> io::Result<(u64, u64)> {
        let res = self.accept_and_pump().await;
        match &res {
            Ok((up_bytes, dn_bytes)) => {
                self.state.advance(ProxyState::Closed);
                tracing::info!(
                    session = self.session_id,
                    tunnel = self.tunnel_id(),
                    up_bytes,
                    dn_bytes,
                    "relay: closed"
                );
            }
            Err(err) => {
                self.state.advance(ProxyState::Failed);
                tracing::warn!(
                    session = self.session_id,
                    tunnel = self.tunnel_id(),
                    err = %err,
                    "relay: failed"
                );
            }
        }
        res
    }

    async fn accept_and_pump(&self) -> io::Result<(u64, u64)> {
        self.state.advance(ProxyState::AwaitingUpstream);
        let (up, up_peer) = self.ln_up.accept().await?;
        tracing::debug!(
            session = self.session_id,
            tunnel = self.tunnel_id(),
            peer = %up_peer,
            "relay: upstream accepted"
        );

        self.state.advance(ProxyState::AwaitingDownstream);
        let (dn, dn_peer) = self.ln_dn.accept().await?;
        tracing::debug!(
            session = self.session_id,
            tunnel = self.tunnel_id(),
            peer = %dn_peer,
            "relay: downstream accepted"
        );

        self.state.advance(ProxyState::Pumping);
        pump(up, dn, self.bufsize).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn upstream_is_accepted_before_downstream() {
        let proxy = Arc::new(ServerProxy::bind(0, 0, 1024, 7).await.unwrap());
        proxy.set_tunnel_id(99);
        let port_up = proxy.port_up();
        let port_dn = proxy.port_dn();
        assert_ne!(port_up, port_dn);

        let p = proxy.clone();
        tokio::spawn(async move {
            let _ = p.run().await;
        });

        // Admin connects first and writes immediately.
        let mut admin = TcpStream::connect(("127.0.0.1", port_dn)).await.unwrap();
        admin.write_all(b"early").await.unwrap();

        // The relay must not touch the admin side yet.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(proxy.state(), ProxyState::AwaitingUpstream);

        // Once the tunnel client arrives, the early bytes flow through.
        let mut client = TcpStream::connect(("127.0.0.1", port_up)).await.unwrap();
        let mut got = [0u8; 5];
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"early");

        // And the reverse direction works too.
        client.write_all(b"reply").await.unwrap();
        let mut got = [0u8; 5];
        admin.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"reply");
    }
}
