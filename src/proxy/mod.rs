//! Data-plane relays.
//!
//! A relay has two ends and one job: shuttle bytes both ways until one side
//! goes quiet. The server end ([`server::ServerProxy`]) listens on a port
//! pair; the client end ([`client::ClientProxy`]) dials both the server's
//! tunnel port and the local target.

pub mod client;
pub mod server;

use std::io;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Relay lifecycle, forward-only like the control channel's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ProxyState {
    Init = 0,
    AwaitingUpstream = 1,
    AwaitingDownstream = 2,
    Pumping = 3,
    Closed = 4,
    Failed = 5,
}

impl ProxyState {
    fn from_u8(v: u8) -> ProxyState {
        match v {
            0 => ProxyState::Init,
            1 => ProxyState::AwaitingUpstream,
            2 => ProxyState::AwaitingDownstream,
            3 => ProxyState::Pumping,
            4 => ProxyState::Closed,
            _ => ProxyState::Failed,
        }
    }
}

/// Observable state cell shared by both relay flavors.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(ProxyState::Init as u8))
    }

    pub fn get(&self) -> ProxyState {
        ProxyState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn advance(&self, next: ProxyState) -> bool {
        self.0.fetch_max(next as u8, Ordering::SeqCst) < next as u8
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Pump bytes between `up` and `dn` until both directions hit EOF or either
/// errors. Returns the byte totals (up-to-dn, dn-to-up).
pub async fn pump<A, B>(up: A, dn: B, bufsize: usize) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (up_rd, up_wr) = tokio::io::split(up);
    let (dn_rd, dn_wr) = tokio::io::split(dn);
    tokio::try_join!(
        copy_direction(up_rd, dn_wr, bufsize),
        copy_direction(dn_rd, up_wr, bufsize),
    )
}

async fn copy_direction<R, W>(mut rd: R, mut wr: W, bufsize: usize) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; bufsize];
    let mut total = 0u64;
    loop {
        let n = rd.read(&mut buf).await?;
        if n == 0 {
            // Propagate the EOF so the far side's reader unblocks too.
            wr.shutdown().await?;
            return Ok(total);
        }
        wr.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn pump_carries_bytes_both_ways() {
        let (up_near, up_far) = tokio::io::duplex(4096);
        let (dn_near, dn_far) = tokio::io::duplex(4096);

        let task = tokio::spawn(pump(up_far, dn_far, 1024));

        let (mut up, mut dn) = (up_near, dn_near);

        // Two full round trips in each direction.
        for round in 0..2 {
            let msg = format!("up-to-dn {round}");
            up.write_all(msg.as_bytes()).await.unwrap();
            let mut got = vec![0u8; msg.len()];
            dn.read_exact(&mut got).await.unwrap();
            assert_eq!(got, msg.as_bytes());

            let msg = format!("dn-to-up {round}");
            dn.write_all(msg.as_bytes()).await.unwrap();
            let mut got = vec![0u8; msg.len()];
            up.read_exact(&mut got).await.unwrap();
            assert_eq!(got, msg.as_bytes());
        }

        drop(up);
        drop(dn);
        let (a, b) = task.await.unwrap().unwrap();
        assert_eq!(a, "up-to-dn 0".len() as u64 * 2);
        assert_eq!(b, "dn-to-up 0".len() as u64 * 2);
    }

    #[tokio::test]
    async fn eof_on_one_side_reaches_the_other() {
        let (up_near, up_far) = tokio::io::duplex(4096);
        let (dn_near, dn_far) = tokio::io::duplex(4096);

        tokio::spawn(pump(up_far, dn_far, 1024));

        let (mut up, mut dn) = (up_near, dn_near);
        up.write_all(b"last words").await.unwrap();
        up.shutdown().await.unwrap();

        let mut got = Vec::new();
        dn.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"last words");
    }
}
