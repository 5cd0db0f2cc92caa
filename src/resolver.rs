//! Thin async name resolution used by the client's server connect and by
//! the dial-out side of a relay.

use std::io;
use std::net::SocketAddr;

use tokio::net::{TcpStream, lookup_host};

/// Resolve `host:port` into candidate endpoints, in resolver order.
pub async fn resolve(host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = lookup_host((host, port)).await?.collect();
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses for {host}:{port}"),
        ));
    }
    Ok(addrs)
}

/// Connect to the first reachable candidate.
pub async fn connect_any(addrs: &[SocketAddr]) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "no candidate endpoints")
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_loopback_literal() {
        let addrs = resolve("127.0.0.1", 2222).await.unwrap();
        assert!(!addrs.is_empty());
        assert_eq!(addrs[0].port(), 2222);
    }

    #[tokio::test]
    async fn connect_any_reaches_a_listener() {
        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let stream = connect_any(&[addr]).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
    }
}
