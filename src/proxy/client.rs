//! Client-side relay: dials the server's tunnel port, then lazily dials the
//! local target.
//!
//! The target connection is deferred until the first upstream bytes arrive.
//! The server accepts the tunnel side before any admin exists, so connecting
//! the target eagerly would open (and possibly time out) local connections
//! for tunnels nobody ever uses.

use std::io;
use std::sync::OnceLock;

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;

use super::{ProxyState, StateCell, pump};
use crate::resolver;

#[derive(Debug)]
pub struct ClientProxy {
    session_id: u64,
    tunnel_id: OnceLock<u64>,
    server_host: String,
    server_port: u16,
    target_host: String,
    target_port: u16,
    bufsize: usize,
    state: StateCell,
}

impl ClientProxy {
    pub fn new(
        session_id: u64,
        server_host: String,
        server_port: u16,
        target_host: String,
        target_port: u16,
        bufsize: usize,
    ) -> ClientProxy {
        ClientProxy {
            session_id,
            tunnel_id: OnceLock::new(),
            server_host,
            server_port,
            target_host,
            target_port,
            bufsize,
            state: StateCell::new(),
        }
    }

    pub fn set_tunnel_id(&self, id: u64) {
        let _ = self.tunnel_id.set(id);
    }

    pub fn tunnel_id(&self) -> u64 {
        self.tunnel_id.get().copied().unwrap_or(0)
    }

    pub fn state(&self) -> ProxyState {
        self.state.get()
    }

    /// Connect upstream, wait for its first bytes, then bring up the target
    /// and pump.
    pub async fn run(&self) -> io::Result<(u64, u64)> {
        let res = self.connect_and_pump().await;
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

    async fn connect_and_pump(&self) -> io::Result<(u64, u64)> {
        self.state.advance(ProxyState::AwaitingUpstream);
        let addrs = resolver::resolve(&self.server_host, self.server_port).await?;
        let mut up = resolver::connect_any(&addrs).await?;
        tracing::debug!(
            session = self.session_id,
            tunnel = self.tunnel_id(),
            server = %format_args!("{}:{}", self.server_host, self.server_port),
            "relay: upstream connected"
        );

        // No admin showed up yet; hold off on the target until the server
        // relays something.
        self.state.advance(ProxyState::AwaitingDownstream);
        let mut first = vec![0u8; self.bufsize];
        let n = up.read(&mut first).await?;
        if n == 0 {
            // Tunnel torn down before any admin connected.
            return Ok((0, 0));
        }

        let addrs = resolver::resolve(&self.target_host, self.target_port).await?;
        let mut dn = resolver::connect_any(&addrs).await?;
        dn.write_all(&first[..n]).await?;
        tracing::debug!(
            session = self.session_id,
            tunnel = self.tunnel_id(),
            target = %format_args!("{}:{}", self.target_host, self.target_port),
            "relay: target connected"
        );

        self.state.advance(ProxyState::Pumping);
        let (a, b) = pump(up, dn, self.bufsize).await?;
        Ok((a + n as u64, b))
    }
}
