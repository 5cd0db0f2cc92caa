//! Configuration: file shape, defaults and validation.
//!
//! A trane process runs fine with no config file at all; every knob has a
//! default matching the reference deployment. Values of zero in the file
//! mean "use the default".

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

pub const DEFAULT_CONTROL_PORT: u16 = 39999;
pub const DEFAULT_BUFSIZE: usize = 32 * 1024;
pub const DEFAULT_HEARTBEAT_SECS: u64 = 10;
pub const DEFAULT_RECONNECT_SECS: u64 = 3;
pub const DEFAULT_BIND_RETRIES: u32 = 25;

/// An inclusive range of ephemeral ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PortRange {
    pub begin: u16,
    pub end: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        (self.begin..=self.end).contains(&port)
    }

    pub fn span(&self) -> u32 {
        u32::from(self.end) - u32::from(self.begin) + 1
    }

    fn overlaps(&self, other: &PortRange) -> bool {
        self.begin <= other.end && other.begin <= self.end
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            output: "stderr".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Relay and decode buffer size; must be a non-zero multiple of 1024.
    pub bufsize: usize,
    /// Delay between a received PONG and the next PING.
    pub heartbeat_interval: Duration,
    /// Fixed client backoff between reconnect attempts.
    pub reconnect_backoff: Duration,
    /// Attempts at finding a bindable port pair per tunnel.
    pub bind_retries: u32,
    /// Admin-facing (downstream) listener ports.
    pub admin_ports: PortRange,
    /// Tunnel-facing (upstream) listener ports, advertised to clients.
    pub tunnel_ports: PortRange,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bufsize: DEFAULT_BUFSIZE,
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            reconnect_backoff: Duration::from_secs(DEFAULT_RECONNECT_SECS),
            bind_retries: DEFAULT_BIND_RETRIES,
            admin_ports: PortRange {
                begin: 40000,
                end: 49999,
            },
            tunnel_ports: PortRange {
                begin: 50000,
                end: 59999,
            },
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    bufsize: u64,
    #[serde(default)]
    heartbeat_secs: u64,
    #[serde(default)]
    reconnect_secs: u64,
    #[serde(default)]
    bind_retries: u32,
    admin_ports: Option<PortRange>,
    tunnel_ports: Option<PortRange>,
    logging: Option<FileLogging>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
}

/// Load the config from `path`, or the built-in defaults when `path` is
/// `None`.
pub fn load(path: Option<&Path>) -> anyhow::Result<Config> {
    let cfg = match path {
        None => Config::default(),
        Some(p) => {
            let raw = std::fs::read_to_string(p)
                .with_context(|| format!("config: read {}", p.display()))?;
            let fc: FileConfig = toml::from_str(&raw)
                .with_context(|| format!("config: parse {}", p.display()))?;
            from_file_config(fc)
        }
    };
    validate(&cfg)?;
    Ok(cfg)
}

fn from_file_config(fc: FileConfig) -> Config {
    let defaults = Config::default();
    let mut cfg = defaults.clone();

    if fc.bufsize != 0 {
        cfg.bufsize = fc.bufsize as usize;
    }
    if fc.heartbeat_secs != 0 {
        cfg.heartbeat_interval = Duration::from_secs(fc.heartbeat_secs);
    }
    if fc.reconnect_secs != 0 {
        cfg.reconnect_backoff = Duration::from_secs(fc.reconnect_secs);
    }
    if fc.bind_retries != 0 {
        cfg.bind_retries = fc.bind_retries;
    }
    if let Some(r) = fc.admin_ports {
        cfg.admin_ports = r;
    }
    if let Some(r) = fc.tunnel_ports {
        cfg.tunnel_ports = r;
    }
    if let Some(l) = fc.logging {
        if let Some(level) = l.level {
            cfg.logging.level = level;
        }
        if let Some(format) = l.format {
            cfg.logging.format = format;
        }
        if let Some(output) = l.output {
            cfg.logging.output = output;
        }
    }
    cfg
}

fn validate(cfg: &Config) -> anyhow::Result<()> {
    if cfg.bufsize == 0 || cfg.bufsize % 1024 != 0 {
        anyhow::bail!("config: bufsize must be a non-zero multiple of 1024");
    }
    for (name, r) in [("admin_ports", &cfg.admin_ports), ("tunnel_ports", &cfg.tunnel_ports)] {
        if r.begin > r.end {
            anyhow::bail!("config: {name} range is inverted ({}..{})", r.begin, r.end);
        }
    }
    if cfg.admin_ports.overlaps(&cfg.tunnel_ports) {
        anyhow::bail!("config: admin_ports and tunnel_ports must be disjoint");
    }
    if cfg.admin_ports.span() != cfg.tunnel_ports.span() {
        anyhow::bail!("config: admin and tunnel port ranges must span the same number of ports");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn file_values_override_defaults() {
        let fc: FileConfig = toml::from_str(
            r#"
            bufsize = 65536
            heartbeat_secs = 5
            [tunnel_ports]
            begin = 50000
            end = 50099
            [admin_ports]
            begin = 40000
            end = 40099
            [logging]
            level = "debug"
            "#,
        )
        .unwrap();
        let cfg = from_file_config(fc);
        assert_eq!(cfg.bufsize, 65536);
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(cfg.reconnect_backoff, Duration::from_secs(DEFAULT_RECONNECT_SECS));
        assert_eq!(cfg.tunnel_ports.span(), 100);
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.logging.format, "text");
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn overlapping_ranges_are_rejected() {
        let mut cfg = Config::default();
        cfg.tunnel_ports = PortRange {
            begin: 45000,
            end: 54999,
        };
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn unequal_spans_are_rejected() {
        let mut cfg = Config::default();
        cfg.tunnel_ports = PortRange {
            begin: 50000,
            end: 50010,
        };
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn odd_bufsize_is_rejected() {
        let mut cfg = Config::default();
        cfg.bufsize = 1000;
        assert!(validate(&cfg).is_err());
    }
}
