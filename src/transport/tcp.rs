//! TCP connector implementation
//!
//! Provides plain TCP connections to SOCKS proxies and relay targets.

use super::{ConnectAddr, Connector, SocketOpts, StreamDyn};
use crate::config::TcpConfig;
use crate::error::{ConnectError, ConnectErrorKind};
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// TCP connector for plain connections
#[derive(Debug, Clone)]
pub struct TcpConnector {
    /// Socket options to apply to connections
    socket_opts: SocketOpts,
    /// Connection timeout
    connect_timeout: Duration,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl TcpConnector {
    /// Create a new TCP connector with default options
    pub fn with_defaults() -> Self {
        TcpConnector {
            socket_opts: SocketOpts::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Create a TCP connector from configuration
    pub fn from_config(config: &TcpConfig) -> Self {
        TcpConnector {
            socket_opts: SocketOpts::from_tcp_config(config),
            connect_timeout: Duration::from_secs(config.connect_timeout),
        }
    }

    /// Set socket options
    pub fn with_socket_opts(mut self, opts: SocketOpts) -> Self {
        self.socket_opts = opts;
        self
    }

    /// Set connection timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Connect and return the concrete stream
    pub async fn connect_tcp(&self, uri: &str) -> Result<TcpStream, ConnectError> {
        let addr = ConnectAddr::parse(uri)?;
        let resolved = addr.resolve().await?;

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&resolved[..]))
            .await
            .map_err(|_| {
                ConnectError::new(
                    ConnectErrorKind::TimedOut,
                    format!("Connection to {} timed out", addr),
                )
            })?
            .map_err(|e| ConnectError::from_io(e, format!("Connection to {} failed", addr)))?;

        if let Err(e) = self.socket_opts.apply(&stream) {
            warn!("Failed to apply socket options: {}", e);
        }

        match stream.peer_addr() {
            Ok(peer) => debug!("TCP connection established to {} ({})", addr, peer),
            Err(_) => debug!("TCP connection established to {}", addr),
        }

        Ok(stream)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, uri: &str) -> Result<Box<dyn StreamDyn>, ConnectError> {
        let stream = self.connect_tcp(uri).await?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_tcp_connector_with_defaults() {
        let connector = TcpConnector::with_defaults();
        assert!(connector.socket_opts.nodelay);
        assert_eq!(connector.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_tcp_connector_from_config() {
        let config = TcpConfig {
            nodelay: false,
            keepalive_secs: 60,
            keepalive_interval: 20,
            connect_timeout: 5,
        };
        let connector =
            TcpConnector::from_config(&config).with_connect_timeout(Duration::from_secs(30));
        assert!(!connector.socket_opts.nodelay);
        assert_eq!(connector.socket_opts.keepalive_secs, Some(60));
        assert_eq!(connector.connect_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_tcp_connector_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"hello").await.unwrap();
        });

        let connector = TcpConnector::with_defaults();
        let mut stream = connector
            .connect(&format!("{}?source=socks5%3A%2F%2F127.0.0.1%3A1", addr))
            .await
            .unwrap();

        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_tcp_connector_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = TcpConnector::with_defaults()
            .connect(&addr.to_string())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ConnectErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn test_tcp_connector_invalid_uri() {
        let err = TcpConnector::with_defaults()
            .connect("no-port")
            .await
            .unwrap_err();
        assert_eq!(err.kind, ConnectErrorKind::InvalidTarget);
    }
}
