//! Listener settings.

use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    path::PathBuf,
};

use serde::Deserialize;

/// Address used when neither the command line nor the file sets one.
pub const DEFAULT_LISTEN_ADDRESS: SocketAddr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 8000));

/// The `[server]` section.
#[derive(Default, Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Address to bind. The `--listen-address` flag wins over this.
    pub listen_address: Option<SocketAddr>,
    /// Serve HTTPS with this certificate and key instead of plain HTTP.
    pub tls: Option<TlsServerConfig>,
    /// The unauthenticated health route.
    #[serde(default)]
    pub health: HealthConfig,
}

impl ServerConfig {
    /// The address to bind, given an optional override from the command line.
    pub fn bind_address(&self, flag: Option<SocketAddr>) -> SocketAddr {
        flag.or(self.listen_address).unwrap_or(DEFAULT_LISTEN_ADDRESS)
    }
}

/// PEM files for the HTTPS listener.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsServerConfig {
    /// Certificate chain.
    pub certificate: PathBuf,
    /// Private key.
    pub key: PathBuf,
}

/// The `[server.health]` table.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthConfig {
    /// Mount the route at all.
    pub enabled: bool,
    /// Route path, starting with `/`.
    pub path: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            enabled: true,
            path: "/health".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use crate::{Config, DEFAULT_LISTEN_ADDRESS};

    #[test]
    fn flag_wins_over_file_and_default() {
        let config: Config = toml::from_str("[server]\nlisten_address = \"0.0.0.0:9000\"\n").unwrap();
        let flag: SocketAddr = "127.0.0.1:7000".parse().unwrap();

        assert_eq!(config.server.bind_address(Some(flag)), flag);
        assert_eq!(config.server.bind_address(None).port(), 9000);
        assert_eq!(Config::default().server.bind_address(None), DEFAULT_LISTEN_ADDRESS);
    }

    #[test]
    fn tls_and_health() {
        let config: Config = toml::from_str(indoc::indoc! {r#"
            [server.tls]
            certificate = "certs/cert.pem"
            key = "certs/key.pem"

            [server.health]
            enabled = false
        "#})
        .unwrap();

        let tls = config.server.tls.unwrap();

        assert_eq!(tls.certificate.to_str(), Some("certs/cert.pem"));
        assert!(!config.server.health.enabled);
        assert_eq!(config.server.health.path, "/health");
    }
}
