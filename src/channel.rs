//! Control channel: one persistent framed-command connection.
//!
//! The channel owns exactly one stream. Outbound commands are queued and
//! written by the run loop; inbound bytes are decoded incrementally and each
//! complete frame is dispatched to the role's [`CommandHandler`] before the
//! next read is issued, so dispatch within one channel is strictly
//! sequential.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc};

use crate::protocol::{Command, FrameDecoder, ProtocolError};

/// Channel lifecycle. Transitions are forward-only; `Failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ChannelState {
    Init = 0,
    Connecting = 1,
    Connected = 2,
    Failed = 3,
}

impl ChannelState {
    fn from_u8(v: u8) -> ChannelState {
        match v {
            0 => ChannelState::Init,
            1 => ChannelState::Connecting,
            2 => ChannelState::Connected,
            _ => ChannelState::Failed,
        }
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("peer closed the control channel")]
    Closed,
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("control channel is down")]
    Down,
    #[error("control channel is already running")]
    Busy,
}

/// Per-tag command handlers, overridden per role. Defaults ignore the
/// command, matching tags the role never receives.
#[async_trait]
pub trait CommandHandler: Send {
    async fn on_connect(&mut self, ch: &Arc<ControlChannel>, site_name: String) {
        let _ = (ch, site_name);
    }

    async fn on_assign(&mut self, ch: &Arc<ControlChannel>, session_id: u64) {
        let _ = (ch, session_id);
    }

    async fn on_ping(&mut self, ch: &Arc<ControlChannel>, message: String) {
        let _ = (ch, message);
    }

    async fn on_pong(&mut self, ch: &Arc<ControlChannel>, message: String) {
        let _ = (ch, message);
    }

    #[allow(clippy::too_many_arguments)]
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
        let _ = (
            ch,
            server_host,
            server_port,
            client_host,
            client_port,
            tunnel_type,
            tunnel_id,
        );
    }

    async fn on_tunnel_res(
        &mut self,
        ch: &Arc<ControlChannel>,
        tunnel_id: u64,
        success: bool,
        message: String,
    ) {
        let _ = (ch, tunnel_id, success, message);
    }
}

pub struct ControlChannel {
    session_id: AtomicU64,
    state: AtomicU8,
    bufsize: usize,
    tx: mpsc::UnboundedSender<Command>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("session_id", &self.session_id())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ControlChannel {
    pub fn new(bufsize: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            session_id: AtomicU64::new(0),
            state: AtomicU8::new(ChannelState::Init as u8),
            bufsize,
            tx,
            rx: Mutex::new(Some(rx)),
        })
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Move the state forward. Regressions are ignored, which keeps `Failed`
    /// terminal. Returns whether the state actually changed.
    pub fn advance(&self, next: ChannelState) -> bool {
        self.state.fetch_max(next as u8, Ordering::SeqCst) < next as u8
    }

    pub fn session_id(&self) -> u64 {
        self.session_id.load(Ordering::SeqCst)
    }

    pub fn set_session_id(&self, id: u64) {
        self.session_id.store(id, Ordering::SeqCst);
    }

    /// Queue a command for the run loop to write.
    pub fn send(&self, cmd: Command) -> Result<(), ChannelError> {
        self.tx.send(cmd).map_err(|_| ChannelError::Down)
    }

    pub fn send_connect(&self, site_name: &str) -> Result<(), ChannelError> {
        self.send(Command::Connect {
            site_name: site_name.to_string(),
        })
    }

    pub fn send_assign(&self, session_id: u64) -> Result<(), ChannelError> {
        self.send(Command::Assign { session_id })
    }

    pub fn send_ping(&self, message: &str) -> Result<(), ChannelError> {
        self.send(Command::Ping {
            message: message.to_string(),
        })
    }

    pub fn send_pong(&self, message: &str) -> Result<(), ChannelError> {
        self.send(Command::Pong {
            message: message.to_string(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn send_tunnel_req(
        &self,
        server_host: &str,
        server_port: u16,
        client_host: &str,
        client_port: u16,
        tunnel_type: u8,
        tunnel_id: u64,
    ) -> Result<(), ChannelError> {
        self.send(Command::TunnelReq {
            server_host: server_host.to_string(),
            server_port,
            client_host: client_host.to_string(),
            client_port,
            tunnel_type,
            tunnel_id,
        })
    }

    pub fn send_tunnel_res(
        &self,
        tunnel_id: u64,
        success: bool,
        message: &str,
    ) -> Result<(), ChannelError> {
        self.send(Command::TunnelRes {
            tunnel_id,
            success,
            message: message.to_string(),
        })
    }

    /// Drive the channel over `stream` until it fails.
    ///
    /// The returned error is the teardown reason; the caller owns the
    /// consequences (removing the session, scheduling a reconnect). The
    /// state is `Failed` by the time this returns.
    pub async fn run<S>(
        self: &Arc<Self>,
        stream: S,
        handler: &mut (dyn CommandHandler + Send),
    ) -> Result<(), ChannelError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut rx = self
            .rx
            .lock()
            .await
            .take()
            .ok_or(ChannelError::Busy)?;

        self.advance(ChannelState::Connecting);

        let res = self.drive(stream, &mut rx, handler).await;
        self.advance(ChannelState::Failed);
        res
    }

    async fn drive<S>(
        self: &Arc<Self>,
        stream: S,
        rx: &mut mpsc::UnboundedReceiver<Command>,
        handler: &mut (dyn CommandHandler + Send),
    ) -> Result<(), ChannelError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut rd, mut wr) = tokio::io::split(stream);
        let mut decoder = FrameDecoder::new();
        let mut chunk = vec![0u8; self.bufsize];

        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else {
                        return Ok(());
                    };
                    match cmd.encode() {
                        Ok(frame) => wr.write_all(&frame).await?,
                        Err(err) => {
                            tracing::warn!(
                                session = self.session_id(),
                                err = %err,
                                "dropping unencodable command"
                            );
                        }
                    }
                }
                n = rd.read(&mut chunk) => {
                    let n = n?;
                    if n == 0 {
                        return Err(ChannelError::Closed);
                    }
                    decoder.extend(&chunk[..n]);
                    while let Some(raw) = decoder.next_frame()? {
                        match Command::decode(&raw) {
                            Ok(cmd) => self.dispatch(cmd, handler).await,
                            Err(err) => {
                                tracing::warn!(
                                    session = self.session_id(),
                                    tag = raw.tag,
                                    err = %err,
                                    "dropping malformed frame"
                                );
                            }
                        }
                    }
                }
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, cmd: Command, handler: &mut (dyn CommandHandler + Send)) {
        match cmd {
            Command::Connect { site_name } => handler.on_connect(self, site_name).await,
            Command::Assign { session_id } => handler.on_assign(self, session_id).await,
            Command::Ping { message } => handler.on_ping(self, message).await,
            Command::Pong { message } => handler.on_pong(self, message).await,
            Command::TunnelReq {
                server_host,
                server_port,
                client_host,
                client_port,
                tunnel_type,
                tunnel_id,
            } => {
                handler
                    .on_tunnel_req(
                        self,
                        server_host,
                        server_port,
                        client_host,
                        client_port,
                        tunnel_type,
                        tunnel_id,
                    )
                    .await
            }
            Command::TunnelRes {
                tunnel_id,
                success,
                message,
            } => handler.on_tunnel_res(self, tunnel_id, success, message).await,
        }
    }
}
