//! # Socksrelay - SOCKS4/4a/5 Client and Server
//!
//! Socksrelay implements the CONNECT flavor of SOCKS4, SOCKS4a and SOCKS5 in
//! both directions. The client tunnels outbound TCP connections through an
//! existing SOCKS proxy; the server accepts SOCKS clients on a listener and
//! relays their connections to the requested targets.
//!
//! ## Features
//!
//! - **Incremental Parsing**: Handshakes are driven by a stream reader that
//!   never consumes bytes past the current handshake step
//! - **Username/Password Authentication**: RFC 1929 sub-negotiation on both sides
//! - **Pluggable Connectors**: Servers dial targets through any [`transport::Connector`],
//!   including another SOCKS [`socks::Client`] for proxy chaining
//! - **Target Policy**: Blocklisted targets are refused with "not allowed by ruleset"
//!
//! ## Usage
//!
//! ```rust,ignore
//! use socksrelay::config::load_config;
//! use socksrelay::run_server;
//! use tokio::sync::broadcast;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config("config.toml")?;
//!     let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
//!
//!     run_server(config, shutdown_rx).await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! SOCKS Client -> Socksrelay Server -> [Upstream SOCKS Proxy] -> Target
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod protocol;
pub mod socks;
pub mod transport;

// Re-export commonly used items
pub use config::{load_config, Config};
pub use error::{ConnectError, ConnectErrorKind, ReadError, ReplyCode, SocksError};
pub use socks::{Client, Server};

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::info;
use transport::{BlocklistConnector, Connector, SocketOpts, TcpConnector};

/// Version of the Socksrelay library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Build the outbound connector described by the configuration
///
/// Targets are dialed directly over TCP, or through the upstream proxy when
/// one is configured. The blocklist is checked before either.
pub fn build_connector(config: &Config) -> Result<Arc<dyn Connector>> {
    let tcp = TcpConnector::from_config(&config.server.tcp);

    let mut connector: Arc<dyn Connector> = match &config.upstream {
        Some(upstream) => {
            let to_proxy = tcp.with_connect_timeout(Duration::from_secs(upstream.connect_timeout));
            let client = Client::new(&upstream.proxy, Arc::new(to_proxy))
                .with_context(|| format!("Invalid upstream proxy: {}", upstream.proxy))?;
            info!(
                "Relaying through upstream {} proxy {}",
                client.protocol_version(),
                client.proxy()
            );
            Arc::new(client)
        }
        None => Arc::new(tcp),
    };

    if !config.server.blocklist.is_empty() {
        info!("Blocklist active with {} patterns", config.server.blocklist.len());
        connector = Arc::new(BlocklistConnector::new(
            connector,
            config.server.blocklist.iter(),
        ));
    }

    Ok(connector)
}

/// Build the SOCKS server described by the configuration
pub fn build_server(config: &Config) -> Result<Server> {
    let connector = build_connector(config)?;

    let mut server = Server::new(connector)
        .with_protocol_version(config.server.protocol_version)?
        .with_relay_buffer_size(config.server.relay_buffer_size)
        .with_socket_opts(SocketOpts::from_tcp_config(&config.server.tcp));

    if let Some(auth) = &config.server.auth {
        server = server.with_auth_map(auth.users.clone())?;
    }

    Ok(server)
}

/// Run the SOCKS server until a shutdown signal arrives
pub async fn run_server(config: Config, shutdown_rx: broadcast::Receiver<bool>) -> Result<()> {
    let server = build_server(&config)?;

    let listener = TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.listen))?;

    server.serve(listener, shutdown_rx).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, ServerConfig, UpstreamConfig};
    use crate::socks::ProtocolVersion;
    use std::collections::HashMap;

    fn config() -> Config {
        Config {
            server: ServerConfig::default(),
            upstream: None,
        }
    }

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_name() {
        assert_eq!(NAME, "socksrelay");
    }

    #[test]
    fn test_build_server_with_auth() {
        let mut config = config();
        let mut users = HashMap::new();
        users.insert("alice".to_string(), "secret".to_string());
        config.server.auth = Some(AuthConfig { users });

        let server = build_server(&config).unwrap();
        assert!(server.requires_auth());
        assert!(server.protocol_version().is_none());

        config.server.protocol_version = Some(ProtocolVersion::V4);
        assert!(build_server(&config).is_err());
    }

    #[test]
    fn test_build_connector_rejects_bad_upstream() {
        let mut config = config();
        config.upstream = Some(UpstreamConfig {
            proxy: "socks4://user@127.0.0.1:1081".to_string(),
            connect_timeout: 1,
        });
        assert!(build_connector(&config).is_err());
    }

    #[tokio::test]
    async fn test_run_server_stops_on_shutdown() {
        let mut config = config();
        config.server.listen = "127.0.0.1:0".to_string();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(run_server(config, shutdown_rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_server_bind_failure() {
        let mut config = config();
        config.server.listen = "not an address".to_string();

        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        assert!(run_server(config, shutdown_rx).await.is_err());
    }
}
