//! Process-startup configuration, parsed once in `bin/driver.rs` via
//! `clap`. Every field comes from flags/env rather than a YAML file,
//! since there's no volume-group config to load ahead of time.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use volume_key::validate_prefix;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Role {
    Controller,
    Node,
}

#[derive(Debug, Parser)]
#[command(name = "driver", version, about = "Block-storage CSI driver")]
pub struct Cli {
    /// Which CSI service group this process serves.
    #[arg(long, value_enum)]
    pub role: Role,

    /// gRPC transport endpoint: `unix:///run/csi/csi.sock` or `tcp://host:port`.
    #[arg(long, default_value = "unix:///run/csi/csi.sock")]
    pub endpoint: String,

    /// Advertised in GetPluginInfo.
    #[arg(long, default_value = "com.linode.csi.linodebs")]
    pub driver_name: String,

    /// Advertised in GetPluginInfo.
    #[arg(long, default_value = env!("CARGO_PKG_VERSION"))]
    pub vendor_version: String,

    /// Prepended to derived volume labels; must match `[A-Za-z0-9_-]`, ≤12 chars.
    #[arg(long, default_value = "csi")]
    pub label_prefix: String,

    /// Cloud API bearer token. Read from `LINODE_API_TOKEN` if unset.
    #[arg(long, env = "LINODE_API_TOKEN", hide_env_values = true)]
    pub api_token: String,

    /// Override the driver's home region (Controller only); otherwise resolved via node metadata.
    #[arg(long)]
    pub region: Option<String>,
}

/// A parsed `unix://` or `tcp://` transport endpoint.
#[derive(Debug, Clone)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(std::net::SocketAddr),
}

impl Endpoint {
    pub fn parse(raw: &str) -> Result<Self, String> {
        if let Some(path) = raw.strip_prefix("unix://") {
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }

        if let Some(addr) = raw.strip_prefix("tcp://") {
            let addr = addr
                .parse()
                .map_err(|err| format!("invalid tcp endpoint `{addr}`: {err}"))?;
            return Ok(Endpoint::Tcp(addr));
        }

        Err(format!(
            "unsupported transport scheme in `{raw}`: expected `unix://` or `tcp://`"
        ))
    }
}

impl Cli {
    /// Validate the label prefix, a fatal startup error if malformed
    /// An invalid prefix is a fatal startup error.
    pub fn validate(&self) -> Result<(), String> {
        validate_prefix(&self.label_prefix).map_err(|err| err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unix_endpoint() {
        assert!(matches!(
            Endpoint::parse("unix:///run/csi/csi.sock").unwrap(),
            Endpoint::Unix(path) if path == PathBuf::from("/run/csi/csi.sock")
        ));
    }

    #[test]
    fn parses_tcp_endpoint() {
        assert!(matches!(
            Endpoint::parse("tcp://0.0.0.0:50051").unwrap(),
            Endpoint::Tcp(_)
        ));
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(Endpoint::parse("http://example.com").is_err());
    }
}
