//! Configuration for the server process.
//!
//! Configuration is loaded from environment variables with sensible defaults.
//! Backend-specific settings live in the provider's own config file.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Configuration for the vmpod server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Registered provider to construct.
    pub provider: String,

    /// Config file handed to the provider constructor.
    pub backend_config: PathBuf,

    /// HTTP server bind address.
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            provider: vmpod_core::FIRECRACKER.to_string(),
            backend_config: PathBuf::from("/etc/vmpod/firecracker.json"),
            http_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 8080),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `VMPOD_PROVIDER` | `firecracker` |
    /// | `VMPOD_BACKEND_CONFIG` | `/etc/vmpod/firecracker.json` |
    /// | `VMPOD_HTTP_HOST` | `127.0.0.1` |
    /// | `VMPOD_HTTP_PORT` | `8080` |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let default = Self::default();

        let http_host: IpAddr = lookup("VMPOD_HTTP_HOST")
            .and_then(|v| v.parse().ok())
            .unwrap_or(default.http_addr.ip());

        let http_port: u16 = lookup("VMPOD_HTTP_PORT")
            .and_then(|v| v.parse().ok())
            .unwrap_or(default.http_addr.port());

        Self {
            provider: lookup("VMPOD_PROVIDER")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(default.provider),
            backend_config: lookup("VMPOD_BACKEND_CONFIG")
                .map(PathBuf::from)
                .unwrap_or(default.backend_config),
            http_addr: SocketAddr::new(http_host, http_port),
        }
    }
}
