use clap::{Parser, Subcommand};
use trane::client::ClientOptions;
use trane::config::{self, DEFAULT_CONTROL_PORT};
use trane::{app, logging};

#[derive(Debug, Parser)]
#[command(name = "trane", version, about = "trane - reverse TCP tunnel broker")]
struct Cli {
    /// Path to a trane config file (.toml). If omitted, uses TRANE_CONFIG;
    /// otherwise built-in defaults.
    #[arg(long, env = "TRANE_CONFIG")]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    role: Role,
}

#[derive(Debug, Subcommand)]
enum Role {
    /// Publicly reachable broker: accepts clients and administrators.
    Server {
        /// Control-channel listen port.
        #[arg(long, default_value_t = DEFAULT_CONTROL_PORT)]
        port: u16,
        /// Host advertised to clients for relay dial-out.
        #[arg(long, default_value = "127.0.0.1")]
        advertise: String,
        /// host:port the client should forward tunnels to.
        #[arg(long, default_value = "127.0.0.1:22")]
        target: String,
    },
    /// NAT-side agent: connects out to the server and keeps the channel up.
    Client {
        /// Name this machine reports on connect.
        site: String,
        /// Server host to dial.
        host: String,
        /// Server control port.
        #[arg(long, default_value_t = DEFAULT_CONTROL_PORT)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load(cli.config.as_deref())?;
    let _logging = logging::init(&cfg.logging)?;

    match cli.role {
        Role::Server {
            port,
            advertise,
            target,
        } => {
            let (target_host, target_port) = app::parse_host_port(&target)?;
            app::run_server(cfg, port, advertise, target_host, target_port).await
        }
        Role::Client { site, host, port } => {
            let opts = ClientOptions {
                site_name: site,
                server_host: host,
                server_port: port,
            };
            app::run_client(cfg, opts).await
        }
    }
}
