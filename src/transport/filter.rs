//! Ruleset connector
//!
//! Wraps another connector and refuses targets matching a blocklist. A
//! refusal surfaces as `PermissionDenied`, which the server reports as
//! "connection not allowed by ruleset".

use super::{ConnectAddr, Connector, StreamDyn};
use crate::error::{ConnectError, ConnectErrorKind};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// One blocklist entry
#[derive(Debug, Clone, PartialEq, Eq)]
enum Rule {
    /// `*.example.com` matches every subdomain, not the apex
    Suffix(String),
    /// `example.com` matches the host on any port
    Host(String),
    /// `example.com:80` matches one host and port
    HostPort(String, u16),
}

impl Rule {
    fn parse(pattern: &str) -> Rule {
        let pattern = pattern.trim().to_ascii_lowercase();
        if let Some(suffix) = pattern.strip_prefix("*.") {
            return Rule::Suffix(format!(".{}", suffix));
        }
        if let Ok(addr) = ConnectAddr::parse(&pattern) {
            return Rule::HostPort(addr.host().to_string(), addr.port());
        }
        let host = pattern.trim_start_matches('[').trim_end_matches(']');
        Rule::Host(host.to_string())
    }

    fn matches(&self, host: &str, port: u16) -> bool {
        match self {
            Rule::Suffix(suffix) => host.ends_with(suffix.as_str()),
            Rule::Host(h) => h == host,
            Rule::HostPort(h, p) => h == host && *p == port,
        }
    }
}

/// Connector that rejects blocked targets before delegating
#[derive(Debug, Clone)]
pub struct BlocklistConnector {
    inner: Arc<dyn Connector>,
    rules: Vec<Rule>,
}

impl BlocklistConnector {
    /// Wrap `inner` with the given patterns
    pub fn new<I, S>(inner: Arc<dyn Connector>, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let rules = patterns
            .into_iter()
            .filter(|p| !p.as_ref().trim().is_empty())
            .map(|p| Rule::parse(p.as_ref()))
            .collect();

        BlocklistConnector { inner, rules }
    }

    /// Whether `host:port` is blocked
    pub fn is_blocked(&self, host: &str, port: u16) -> bool {
        let host = host.to_ascii_lowercase();
        self.rules.iter().any(|rule| rule.matches(&host, port))
    }
}

#[async_trait]
impl Connector for BlocklistConnector {
    async fn connect(&self, uri: &str) -> Result<Box<dyn StreamDyn>, ConnectError> {
        let addr = ConnectAddr::parse(uri)?;

        if self.is_blocked(addr.host(), addr.port()) {
            info!(
                "Rejected {} from {}",
                addr,
                addr.source().unwrap_or("unknown source")
            );
            return Err(ConnectError::new(
                ConnectErrorKind::PermissionDenied,
                format!("Connection to {} rejected by ruleset", addr),
            ));
        }

        self.inner.connect(uri).await
    }
}
