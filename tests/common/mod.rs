//! Test utilities for Socksrelay
//!
//! This module provides common test utilities used across integration tests.

#![allow(dead_code)]

use socksrelay::socks::Server;
use socksrelay::transport::{Connector, TcpConnector};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Create a test TCP listener on an available port
pub async fn create_test_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Start a TCP echo server that serves connections until the test ends
pub async fn start_echo_server() -> SocketAddr {
    let (listener, addr) = create_test_listener().await;

    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

/// Running SOCKS server bound to a local port
pub struct TestServer {
    /// Listen address
    pub addr: SocketAddr,
    shutdown_tx: broadcast::Sender<bool>,
}

impl TestServer {
    /// Start `server` on an available port
    pub async fn start(server: Server) -> Self {
        let (listener, addr) = create_test_listener().await;
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        tokio::spawn(async move {
            let _ = server.serve(listener, shutdown_rx).await;
        });

        TestServer { addr, shutdown_tx }
    }

    /// Proxy URI for this server with the given scheme
    pub fn uri(&self, scheme: &str) -> String {
        format!("{}://{}", scheme, self.addr)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Plain TCP connector shared by servers and clients in tests
pub fn tcp_connector() -> Arc<dyn Connector> {
    Arc::new(TcpConnector::with_defaults())
}

/// Raw SOCKS request bytes
pub mod socks_mock {
    use socksrelay::socks::*;

    /// Create a no-auth method selection request
    pub fn create_auth_request_no_auth() -> Vec<u8> {
        vec![SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_NONE]
    }

    /// Create a SOCKS5 connect command to an IPv4 address
    pub fn create_connect_ipv4(ip: [u8; 4], port: u16) -> Vec<u8> {
        let mut cmd = vec![
            SOCKS5_VERSION,
            SOCKS_CMD_CONNECT,
            SOCKS_RESERVED,
            SOCKS5_ADDR_TYPE_IPV4,
        ];
        cmd.extend_from_slice(&ip);
        cmd.extend_from_slice(&port.to_be_bytes());
        cmd
    }

    /// Create a SOCKS5 command with an arbitrary command byte
    pub fn create_command_ipv4(command: u8, ip: [u8; 4], port: u16) -> Vec<u8> {
        let mut cmd = create_connect_ipv4(ip, port);
        cmd[1] = command;
        cmd
    }

    /// Create a SOCKS4 connect request with an empty user id
    pub fn create_socks4_connect(ip: [u8; 4], port: u16) -> Vec<u8> {
        let mut cmd = vec![SOCKS4_VERSION, SOCKS_CMD_CONNECT];
        cmd.extend_from_slice(&port.to_be_bytes());
        cmd.extend_from_slice(&ip);
        cmd.push(0x00);
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_echo_server() {
        let addr = start_echo_server().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_socks4_connect_bytes() {
        let bytes = socks_mock::create_socks4_connect([127, 0, 0, 1], 80);
        assert_eq!(bytes, vec![0x04, 0x01, 0x00, 0x50, 127, 0, 0, 1, 0x00]);
    }
}
