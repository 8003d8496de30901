//! SOCKS server
//!
//! Accepts SOCKS4, SOCKS4a and SOCKS5 clients, dials the requested target
//! through a [`Connector`] and relays between both legs.
//!
//! SOCKS5 request:
//! ```text
//! +----+-----+-------+------+----------+----------+
//! |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
//! +----+-----+-------+------+----------+----------+
//! | 1  |  1  | X'00' |  1   | Variable |    2     |
//! +----+-----+-------+------+----------+----------+
//! ```

use super::auth::{Authenticator, StaticAuthenticator};
use super::consts::*;
use super::session::{field, SessionIo};
use super::tcp_relay::{end_connection, relay, RelayStats, DEFAULT_RELAY_BUFFER_SIZE};
use super::types::{ProtocolVersion, SocksCommand, Target, URI_COMPONENT};
use crate::error::{ReplyCode, SocksError};
use crate::protocol::BinaryFormat;
use crate::transport::{Connector, SocketOpts, StreamDyn};
use bytes::{Bytes, BytesMut};
use percent_encoding::utf8_percent_encode;
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const ACCEPT_BACKOFF_BASE: Duration = Duration::from_millis(50);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Position in the server handshake
#[derive(Debug)]
enum ServerState {
    /// Waiting for the version byte
    Greeting,
    /// Waiting for the SOCKS4 command, port and IP
    Socks4Request,
    /// Waiting for the NUL-terminated SOCKS4 USERID
    Socks4UserId { port: u16, ip: u32 },
    /// Waiting for the NUL-terminated SOCKS4a hostname
    Socks4Hostname { port: u16 },
    /// Waiting for the offered SOCKS5 methods
    Socks5Methods,
    /// Waiting for the RFC 1929 username and password
    Socks5Auth,
    /// Waiting for the SOCKS5 request header
    Socks5Request,
    /// Waiting for the target address of the given type
    Socks5Address(u8),
    /// Waiting for the target port
    Socks5Port(String),
    /// Request fully parsed
    Done(Request),
}

/// Wire family a reply must be written in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Socks4,
    Socks5,
}

/// A fully parsed CONNECT request
#[derive(Debug)]
struct Request {
    family: Family,
    host: String,
    port: u16,
}

/// Shared, read-only server configuration
#[derive(Debug, Clone)]
struct Settings {
    connector: Arc<dyn Connector>,
    version: Option<ProtocolVersion>,
    auth: Option<Arc<dyn Authenticator>>,
    relay_buffer_size: usize,
    socket_opts: SocketOpts,
}

/// One handshake in progress
struct ServerSession<'a, S> {
    io: SessionIo<'a, S>,
    settings: &'a Settings,
    /// Source annotation, gains credentials after authentication
    source: Option<String>,
    remote: Option<String>,
}

impl<'a, S> ServerSession<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(stream: &'a mut S, settings: &'a Settings, remote: Option<String>) -> Self {
        ServerSession {
            io: SessionIo::new(stream),
            settings,
            source: None,
            remote,
        }
    }

    /// Parse the request, answering only the negotiation steps
    async fn negotiate(&mut self) -> Result<Request, SocksError> {
        // authentication requires SOCKS5
        let restriction = if self.settings.auth.is_some() {
            Some(ProtocolVersion::V5)
        } else {
            self.settings.version
        };

        let mut state = ServerState::Greeting;
        loop {
            state = match state {
                ServerState::Greeting => match self.io.read_byte().await? {
                    SOCKS4_VERSION => {
                        if restriction == Some(ProtocolVersion::V5) {
                            return Err(SocksError::Protocol(
                                "SOCKS4 not allowed due to configuration".to_string(),
                            ));
                        }
                        self.source = self.annotate("socks4");
                        ServerState::Socks4Request
                    }
                    SOCKS5_VERSION => {
                        if matches!(restriction, Some(v) if v != ProtocolVersion::V5) {
                            return Err(SocksError::Protocol(
                                "SOCKS5 not allowed due to configuration".to_string(),
                            ));
                        }
                        self.source = self.annotate("socks5");
                        ServerState::Socks5Methods
                    }
                    other => {
                        return Err(SocksError::Protocol(format!(
                            "Unexpected/unknown version number 0x{:02X}",
                            other
                        )))
                    }
                },
                ServerState::Socks4Request => {
                    let command = self.io.read_byte().await?;
                    if SocksCommand::from_byte(command) == Some(SocksCommand::Bind) {
                        self.io.send(&socks4_reply(SOCKS4_REPLY_REJECTED)).await?;
                        return Err(SocksError::Protocol(
                            "Only CONNECT requests supported, got BIND".to_string(),
                        ));
                    }
                    if command != SOCKS_CMD_CONNECT {
                        return Err(SocksError::Protocol(format!(
                            "Expected 0x{:02X}, but got 0x{:02X}",
                            SOCKS_CMD_CONNECT, command
                        )));
                    }

                    let format = BinaryFormat::new(&[("port", 2), ("ip", 4)])?;
                    let fields = self.io.read_binary(&format).await?;
                    let port = field(&fields, "port")? as u16;
                    let ip = field(&fields, "ip")?;
                    if ip == 0 {
                        return Err(SocksError::Protocol("Invalid IP".to_string()));
                    }
                    if port == 0 {
                        return Err(SocksError::Protocol("Invalid port".to_string()));
                    }
                    ServerState::Socks4UserId { port, ip }
                }
                ServerState::Socks4UserId { port, ip } => {
                    let user_id = self.io.read_string_null(MAX_FIELD_LEN).await?;
                    if !user_id.is_empty() {
                        debug!("SOCKS4 USERID {:?}", String::from_utf8_lossy(&user_id));
                    }

                    // SOCKS4a is only allowed when not pinned to plain SOCKS4
                    let supports_hostname =
                        restriction.map(ProtocolVersion::supports_hostname).unwrap_or(true);
                    if ip < 256 && supports_hostname {
                        ServerState::Socks4Hostname { port }
                    } else {
                        ServerState::Done(Request {
                            family: Family::Socks4,
                            host: Ipv4Addr::from(ip).to_string(),
                            port,
                        })
                    }
                }
                ServerState::Socks4Hostname { port } => {
                    let host = self.io.read_string_null(MAX_FIELD_LEN).await?;
                    ServerState::Done(Request {
                        family: Family::Socks4,
                        host: utf8(host, "hostname")?,
                        port,
                    })
                }
                ServerState::Socks5Methods => {
                    let count = self.io.read_byte().await?;
                    let methods = self.io.read_length(usize::from(count)).await?;

                    if self.settings.auth.is_none() && methods.contains(&SOCKS5_AUTH_METHOD_NONE) {
                        self.io
                            .send(&[SOCKS5_VERSION, SOCKS5_AUTH_METHOD_NONE])
                            .await?;
                        ServerState::Socks5Request
                    } else if self.settings.auth.is_some()
                        && methods.contains(&SOCKS5_AUTH_METHOD_PASSWORD)
                    {
                        self.io
                            .send(&[SOCKS5_VERSION, SOCKS5_AUTH_METHOD_PASSWORD])
                            .await?;
                        ServerState::Socks5Auth
                    } else {
                        self.io
                            .send(&[SOCKS5_VERSION, SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE])
                            .await?;
                        return Err(SocksError::Auth(
                            "No acceptable authentication mechanism found".to_string(),
                        ));
                    }
                }
                ServerState::Socks5Auth => {
                    self.io.read_byte_assert(SOCKS5_AUTH_VERSION).await?;
                    let len = self.io.read_byte().await?;
                    let username = self.io.read_length(usize::from(len)).await?;
                    let len = self.io.read_byte().await?;
                    let password = self.io.read_length(usize::from(len)).await?;

                    let accepted = match (
                        String::from_utf8(username.to_vec()),
                        String::from_utf8(password.to_vec()),
                    ) {
                        (Ok(username), Ok(password)) => {
                            self.authenticate(&username, &password).await
                        }
                        _ => false,
                    };

                    if !accepted {
                        self.io
                            .send(&[SOCKS5_AUTH_VERSION, SOCKS5_AUTH_FAILURE])
                            .await?;
                        return Err(SocksError::Auth("Unable to authenticate".to_string()));
                    }

                    self.io
                        .send(&[SOCKS5_AUTH_VERSION, SOCKS5_AUTH_SUCCESS])
                        .await?;
                    ServerState::Socks5Request
                }
                ServerState::Socks5Request => {
                    let format = BinaryFormat::new(&[
                        ("version", 1),
                        ("command", 1),
                        ("null", 1),
                        ("type", 1),
                    ])?;
                    let fields = self.io.read_binary(&format).await?;
                    if field(&fields, "version")? != u32::from(SOCKS5_VERSION) {
                        return Err(SocksError::Protocol("Invalid SOCKS version".to_string()));
                    }
                    let command = field(&fields, "command")? as u8;
                    if SocksCommand::from_byte(command) != Some(SocksCommand::Connect) {
                        self.io
                            .send(&socks5_reply(ReplyCode::CommandNotSupported))
                            .await?;
                        return Err(SocksError::Protocol(format!(
                            "Only CONNECT requests supported, got {}",
                            SocksCommand::from_byte(command)
                                .map(|c| c.to_string())
                                .unwrap_or_else(|| format!("0x{:02X}", command))
                        )));
                    }
                    ServerState::Socks5Address(field(&fields, "type")? as u8)
                }
                ServerState::Socks5Address(addr_type) => {
                    let host = match addr_type {
                        SOCKS5_ADDR_TYPE_DOMAIN => {
                            let len = self.io.read_byte().await?;
                            let host = self.io.read_length(usize::from(len)).await?;
                            utf8(host, "hostname")?
                        }
                        SOCKS5_ADDR_TYPE_IPV4 => {
                            let octets = self.io.read_length(4).await?;
                            let mut ip = [0u8; 4];
                            ip.copy_from_slice(&octets);
                            Ipv4Addr::from(ip).to_string()
                        }
                        SOCKS5_ADDR_TYPE_IPV6 => {
                            let octets = self.io.read_length(16).await?;
                            let mut ip = [0u8; 16];
                            ip.copy_from_slice(&octets);
                            Ipv6Addr::from(ip).to_string()
                        }
                        other => {
                            self.io
                                .send(&socks5_reply(ReplyCode::AddressTypeNotSupported))
                                .await?;
                            return Err(SocksError::Protocol(format!(
                                "Invalid address type 0x{:02X}",
                                other
                            )));
                        }
                    };
                    ServerState::Socks5Port(host)
                }
                ServerState::Socks5Port(host) => {
                    let format = BinaryFormat::new(&[("port", 2)])?;
                    let fields = self.io.read_binary(&format).await?;
                    ServerState::Done(Request {
                        family: Family::Socks5,
                        host,
                        port: field(&fields, "port")? as u16,
                    })
                }
                ServerState::Done(request) => return Ok(request),
            };
        }
    }

    /// Ask the authenticator, exposing the credentials in the source annotation
    async fn authenticate(&mut self, username: &str, password: &str) -> bool {
        let Some(auth) = self.settings.auth.as_ref() else {
            return false;
        };

        if let Some(source) = self.source.take() {
            let credentials = format!(
                "://{}:{}@",
                utf8_percent_encode(username, URI_COMPONENT),
                utf8_percent_encode(password, URI_COMPONENT)
            );
            self.source = Some(source.replacen("://", &credentials, 1));
        }

        let accepted = auth
            .authenticate(username, password, self.source.as_deref())
            .await;
        if accepted {
            info!("User {} authenticated", username);
        } else {
            warn!("Authentication failed for user {}", username);
        }
        accepted
    }

    /// `socks4://host:port` or `socks5://host:port`, with `s` for TLS transports
    fn annotate(&self, scheme: &str) -> Option<String> {
        self.remote.as_deref().map(|remote| {
            let secure = remote.starts_with("tls://");
            let address = match remote.split_once("://") {
                Some((_, address)) => address,
                None => remote,
            };
            format!("{}{}://{}", scheme, if secure { "s" } else { "" }, address)
        })
    }
}

fn utf8(bytes: Bytes, what: &str) -> Result<String, SocksError> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| SocksError::Protocol(format!("Invalid {} encoding", what)))
}

fn socks4_reply(status: u8) -> [u8; 8] {
    [0x00, status, 0, 0, 0, 0, 0, 0]
}

fn socks5_reply(code: ReplyCode) -> [u8; 10] {
    [
        SOCKS5_VERSION,
        u8::from(code),
        SOCKS_RESERVED,
        SOCKS5_ADDR_TYPE_IPV4,
        0,
        0,
        0,
        0,
        0,
        0,
    ]
}

fn failure_reply(family: Family, code: ReplyCode) -> Vec<u8> {
    match family {
        Family::Socks4 => socks4_reply(SOCKS4_REPLY_REJECTED).to_vec(),
        Family::Socks5 => socks5_reply(code).to_vec(),
    }
}

/// Pause after the given number of consecutive accept failures
fn accept_backoff(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(5);
    (ACCEPT_BACKOFF_BASE * 2u32.pow(exponent)).min(ACCEPT_BACKOFF_MAX)
}

fn success_reply(family: Family) -> Vec<u8> {
    match family {
        Family::Socks4 => socks4_reply(SOCKS4_REPLY_GRANTED).to_vec(),
        Family::Socks5 => socks5_reply(ReplyCode::Succeeded).to_vec(),
    }
}

/// SOCKS server
///
/// Cheap to clone; clones share configuration. Configuration is fixed once
/// the server starts handling connections.
#[derive(Debug, Clone)]
pub struct Server {
    settings: Arc<Settings>,
}

impl Server {
    /// Create a server dialing targets through `connector`
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Server {
            settings: Arc::new(Settings {
                connector,
                version: None,
                auth: None,
                relay_buffer_size: DEFAULT_RELAY_BUFFER_SIZE,
                socket_opts: SocketOpts::default(),
            }),
        }
    }

    fn settings_mut(&mut self) -> &mut Settings {
        Arc::make_mut(&mut self.settings)
    }

    /// Restrict accepted clients to one protocol version, `None` accepts all
    pub fn with_protocol_version(
        mut self,
        version: Option<ProtocolVersion>,
    ) -> Result<Self, SocksError> {
        if self.settings.auth.is_some() && matches!(version, Some(v) if v != ProtocolVersion::V5) {
            return Err(SocksError::InvalidArgument(
                "Unable to change protocol version to anything but SOCKS5 while authentication is used. Consider removing authentication info or sticking to SOCKS5"
                    .to_string(),
            ));
        }
        self.settings_mut().version = version;
        Ok(self)
    }

    /// Require username/password authentication
    pub fn with_auth(mut self, auth: Arc<dyn Authenticator>) -> Result<Self, SocksError> {
        if matches!(self.settings.version, Some(v) if v != ProtocolVersion::V5) {
            return Err(SocksError::InvalidArgument(
                "Authentication requires SOCKS5. Consider using protocol version 5 or waive authentication"
                    .to_string(),
            ));
        }
        self.settings_mut().auth = Some(auth);
        Ok(self)
    }

    /// Require authentication against a static username to password map
    pub fn with_auth_map(self, users: HashMap<String, String>) -> Result<Self, SocksError> {
        self.with_auth(Arc::new(StaticAuthenticator::new(users)))
    }

    /// Accept clients without authentication
    pub fn without_auth(mut self) -> Self {
        self.settings_mut().auth = None;
        self
    }

    /// Copy buffer size for each relay direction
    pub fn with_relay_buffer_size(mut self, size: usize) -> Self {
        self.settings_mut().relay_buffer_size = size.max(1);
        self
    }

    /// Socket options applied to accepted connections
    pub fn with_socket_opts(mut self, opts: SocketOpts) -> Self {
        self.settings_mut().socket_opts = opts;
        self
    }

    /// Configured protocol version restriction
    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.settings.version
    }

    /// Whether clients must authenticate
    pub fn requires_auth(&self) -> bool {
        self.settings.auth.is_some()
    }

    /// Accept connections until a shutdown signal arrives
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown_rx: broadcast::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let local = listener.local_addr()?;
        info!("SOCKS server listening on {}", local);

        let opts = self
            .settings
            .socket_opts
            .clone()
            .with_buffer_size(self.settings.relay_buffer_size);

        let mut accept_failures = 0u32;
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => {
                            accept_failures = 0;
                            conn
                        }
                        Err(e) => {
                            accept_failures = accept_failures.saturating_add(1);
                            let delay = accept_backoff(accept_failures);
                            error!("Failed to accept connection: {}, retrying in {:?}", e, delay);
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => continue,
                                _ = shutdown_rx.recv() => {
                                    info!(
                                        "Shutdown signal received, stopping SOCKS server on {}",
                                        local
                                    );
                                    break;
                                }
                            }
                        }
                    };

                    if let Err(e) = opts.apply(&stream) {
                        warn!("Failed to apply socket options: {}", e);
                    }

                    let server = self.clone();
                    tokio::spawn(async move {
                        match server.handle(stream, Some(format!("tcp://{}", peer))).await {
                            Ok(stats) => debug!(
                                "Connection from {} closed, {} bytes sent, {} bytes received",
                                peer, stats.sent, stats.received
                            ),
                            Err(e) => debug!("Connection from {} failed: {}", peer, e),
                        }
                    });
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping SOCKS server on {}", local);
                    break;
                }
            }
        }

        Ok(())
    }

    /// Drive one inbound connection to completion
    ///
    /// `remote` is the peer address in `scheme://host:port` form. Returns the
    /// relayed byte counts once both legs are closed.
    pub async fn handle<S>(
        &self,
        mut stream: S,
        remote: Option<String>,
    ) -> Result<RelayStats, SocksError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let settings = self.settings.as_ref();
        let mut session = ServerSession::new(&mut stream, settings, remote);

        let request = match session.negotiate().await {
            Ok(request) => request,
            Err(e) => {
                drop(session);
                end_connection(&mut stream).await;
                return Err(e);
            }
        };
        let source = session.source.take();
        let early = session.io.take_buffered();
        drop(session);

        let family = request.family;
        let target = match Target::new(request.host, request.port).and_then(|target| {
            target.validate()?;
            Ok(target.with_source(source))
        }) {
            Ok(target) => target,
            Err(e) => {
                let _ = stream.write_all(&failure_reply(family, ReplyCode::GeneralFailure)).await;
                end_connection(&mut stream).await;
                return Err(e);
            }
        };

        info!(
            "{} CONNECT {} from {}",
            if family == Family::Socks4 { "SOCKS4" } else { "SOCKS5" },
            target,
            target.source().unwrap_or("unknown")
        );

        let (outbound, early) = match self.connect_target(&mut stream, &target, early).await {
            Ok(connected) => connected,
            Err(e) => {
                warn!("Connection to {} failed: {}", target, e);
                if !matches!(e, SocksError::Cancelled(_)) {
                    let _ = stream.write_all(&failure_reply(family, e.reply_code())).await;
                }
                end_connection(&mut stream).await;
                return Err(e);
            }
        };

        stream.write_all(&success_reply(family)).await?;
        stream.flush().await?;
        debug!("Tunnel established to {}", target);

        let mut outbound = outbound;
        if !early.is_empty() {
            outbound.write_all(&early).await?;
        }

        Ok(relay(stream, outbound, settings.relay_buffer_size).await)
    }

    /// Dial the target while watching the inbound connection
    ///
    /// Data the client sends early is buffered and returned for forwarding.
    /// If the client closes first the attempt is dropped.
    async fn connect_target<S>(
        &self,
        stream: &mut S,
        target: &Target,
        early: Bytes,
    ) -> Result<(Box<dyn StreamDyn>, BytesMut), SocksError>
    where
        S: AsyncRead + Unpin,
    {
        let limit = self.settings.relay_buffer_size;
        let mut early = BytesMut::from(&early[..]);
        let mut chunk = vec![0u8; limit.min(DEFAULT_RELAY_BUFFER_SIZE)];

        let uri = target.connector_uri();
        let connecting = self.settings.connector.connect(&uri);
        tokio::pin!(connecting);

        loop {
            tokio::select! {
                result = &mut connecting => {
                    return result.map(|outbound| (outbound, early)).map_err(SocksError::from);
                }
                read = stream.read(&mut chunk), if early.len() < limit => match read {
                    Ok(0) | Err(_) => {
                        return Err(SocksError::Cancelled(format!(
                            "Connection to {} cancelled because the client closed",
                            target
                        )));
                    }
                    Ok(n) => early.extend_from_slice(&chunk[..n]),
                },
            }
        }
    }
}
