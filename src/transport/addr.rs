//! Connector address parsing
//!
//! Connectors receive `host:port` strings that may carry a `?source=...`
//! annotation. This module splits them apart and resolves the host.

use crate::error::{ConnectError, ConnectErrorKind};
use std::fmt;
use std::net::SocketAddr;
use url::form_urlencoded;

/// Parsed connector URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectAddr {
    host: String,
    port: u16,
    source: Option<String>,
}

impl ConnectAddr {
    /// Parse `[tcp://]host:port[?source=...]`
    ///
    /// IPv6 hosts must be bracketed. The returned host never carries brackets.
    pub fn parse(uri: &str) -> Result<Self, ConnectError> {
        let invalid = || {
            ConnectError::new(
                ConnectErrorKind::InvalidTarget,
                format!("Invalid target URI given: {}", uri),
            )
        };

        let rest = uri.strip_prefix("tcp://").unwrap_or(uri);
        let (authority, query) = match rest.split_once('?') {
            Some((authority, query)) => (authority, Some(query)),
            None => (rest, None),
        };

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, port) = bracketed.split_once("]:").ok_or_else(invalid)?;
            (host, port)
        } else {
            let (host, port) = authority.rsplit_once(':').ok_or_else(invalid)?;
            if host.contains(':') {
                return Err(invalid());
            }
            (host, port)
        };

        let port: u16 = port.parse().map_err(|_| invalid())?;
        if host.is_empty() || port == 0 {
            return Err(invalid());
        }

        let source = query.and_then(|query| {
            form_urlencoded::parse(query.as_bytes())
                .find(|(key, _)| key == "source")
                .map(|(_, value)| value.into_owned())
        });

        Ok(ConnectAddr {
            host: host.to_string(),
            port,
            source,
        })
    }

    /// Host without brackets
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Decoded source annotation, if present
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Resolve to every socket address of the host, in lookup order
    pub async fn resolve(&self) -> Result<Vec<SocketAddr>, ConnectError> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| ConnectError::from_io(e, format!("Failed to resolve {}", self)))?
            .collect();

        if addrs.is_empty() {
            return Err(ConnectError::new(
                ConnectErrorKind::HostUnreachable,
                format!("No addresses found for {}", self),
            ));
        }
        Ok(addrs)
    }
}

impl fmt::Display for ConnectAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
