//! Transport module for Socksrelay
//!
//! This module provides the outbound connection abstraction used by both the
//! SOCKS client (to reach the proxy) and the SOCKS server (to reach the
//! requested target), along with a plain TCP implementation and a policy
//! wrapper.

mod addr;
mod filter;
mod tcp;

pub use addr::ConnectAddr;
pub use filter::BlocklistConnector;
pub use tcp::TcpConnector;

use crate::config::TcpConfig;
use crate::error::ConnectError;
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Socket options for configuring connections
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOpts {
    /// Enable TCP_NODELAY
    pub nodelay: bool,
    /// TCP keepalive timeout
    pub keepalive_secs: Option<u64>,
    /// TCP keepalive interval
    pub keepalive_interval: Option<u64>,
    /// SO_SNDBUF hint
    pub send_buffer_size: Option<usize>,
    /// SO_RCVBUF hint
    pub recv_buffer_size: Option<usize>,
}

impl Default for SocketOpts {
    fn default() -> Self {
        SocketOpts {
            nodelay: true,
            keepalive_secs: Some(20),
            keepalive_interval: Some(8),
            send_buffer_size: None,
            recv_buffer_size: None,
        }
    }
}

impl SocketOpts {
    /// Create socket options from TCP config
    pub fn from_tcp_config(config: &TcpConfig) -> Self {
        SocketOpts {
            nodelay: config.nodelay,
            keepalive_secs: Some(config.keepalive_secs),
            keepalive_interval: Some(config.keepalive_interval),
            send_buffer_size: None,
            recv_buffer_size: None,
        }
    }

    /// Raise kernel buffers for relaying bulk data
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.send_buffer_size = Some(size);
        self.recv_buffer_size = Some(size);
        self
    }

    /// Apply socket options to a TCP stream
    pub fn apply(&self, stream: &TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(self.nodelay)?;

        let socket = socket2::SockRef::from(stream);
        if let (Some(timeout), Some(interval)) = (self.keepalive_secs, self.keepalive_interval) {
            let keepalive = socket2::TcpKeepalive::new()
                .with_time(Duration::from_secs(timeout))
                .with_interval(Duration::from_secs(interval));
            socket.set_tcp_keepalive(&keepalive)?;
        }
        if let Some(size) = self.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        if let Some(size) = self.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }

        Ok(())
    }
}

/// Outbound connection factory
///
/// `uri` is `host:port`, optionally followed by `?source=<percent-encoded>`
/// describing the inbound peer on whose behalf the connection is made.
/// Implementations must tolerate concurrent calls. Dropping the returned
/// future cancels the attempt.
#[async_trait]
pub trait Connector: Debug + Send + Sync {
    /// Connect to `uri` and return a boxed stream
    async fn connect(&self, uri: &str) -> Result<Box<dyn StreamDyn>, ConnectError>;
}

#[async_trait]
impl<C: Connector + ?Sized> Connector for Arc<C> {
    async fn connect(&self, uri: &str) -> Result<Box<dyn StreamDyn>, ConnectError> {
        (**self).connect(uri).await
    }
}

/// Dynamic stream trait for boxed streams
pub trait StreamDyn: AsyncRead + AsyncWrite + Unpin + Send + Sync + Debug {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + Debug> StreamDyn for T {}
