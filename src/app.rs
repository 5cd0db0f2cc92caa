//! Process-level wiring for the two roles.

use anyhow::Context;
use tokio::net::TcpListener;

use crate::client::{Client, ClientOptions};
use crate::config::Config;
use crate::server::{self, Server};

/// Run the server role: control listener, operator stdin loop, signal exit.
pub async fn run_server(
    cfg: Config,
    port: u16,
    advertise_host: String,
    target_host: String,
    target_port: u16,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("server: bind control port {port}"))?;
    tracing::info!(port, "server: listening");

    let srv = Server::new(cfg);

    let accept = {
        let srv = srv.clone();
        tokio::spawn(async move { srv.serve(listener).await })
    };

    // The operator console is advisory: losing stdin (or a read error) must
    // not take the broker down with it.
    tokio::spawn(async move {
        match server::operator_loop(
            srv,
            tokio::io::stdin(),
            advertise_host,
            target_host,
            target_port,
        )
        .await
        {
            Ok(()) => tracing::info!("server: operator input closed"),
            Err(err) => tracing::warn!(err = %err, "server: operator loop failed"),
        }
    });

    tokio::select! {
        res = accept => res.context("server: accept task")??,
        res = tokio::signal::ctrl_c() => {
            res.context("server: install signal handler")?;
            tracing::info!("server: interrupted, shutting down");
        }
    }
    Ok(())
}

/// Run the client role until interrupted.
pub async fn run_client(cfg: Config, opts: ClientOptions) -> anyhow::Result<()> {
    let client = Client::new(cfg, opts);

    tokio::select! {
        res = client.run() => res?,
        res = tokio::signal::ctrl_c() => {
            res.context("client: install signal handler")?;
            tracing::info!("client: interrupted, shutting down");
        }
    }
    Ok(())
}

/// Split `host:port`, taking the last colon so bare IPv6-ish inputs at least
/// fail with a parse error instead of mis-splitting.
pub fn parse_host_port(s: &str) -> anyhow::Result<(String, u16)> {
    let (host, port) = s
        .rsplit_once(':')
        .with_context(|| format!("expected host:port, got {s:?}"))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid port in {s:?}"))?;
    anyhow::ensure!(!host.is_empty(), "empty host in {s:?}");
    Ok((host.to_string(), port))
}
