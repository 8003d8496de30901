//! Error types for Socksrelay
//!
//! This module defines the error taxonomy shared by the SOCKS client, the
//! SOCKS server, the stream reader and the outbound connectors.

use std::fmt;
use std::io;
use thiserror::Error;

/// Main error type for SOCKS sessions
#[derive(Error, Debug)]
pub enum SocksError {
    /// Underlying connection failed
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Connection ended while a handshake step was still waiting for data
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Peer sent bytes that violate the expected format
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Credentials rejected
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Outbound connection to the target failed
    #[error("Target connection failed: {message}")]
    TargetConnect {
        /// SOCKS5 reply code describing the failure
        code: ReplyCode,
        /// Human readable reason
        message: String,
    },

    /// Handshake or connect aborted by the caller
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// SOCKS4 without the "a" extension can only address IPv4 targets
    #[error("Requires an IPv4 address for SOCKS4, got {0}")]
    RequiresIpv4(String),

    /// Invalid construction parameters or target
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl SocksError {
    /// Reply code reported to a SOCKS5 peer for this error
    pub fn reply_code(&self) -> ReplyCode {
        match self {
            SocksError::TargetConnect { code, .. } => *code,
            _ => ReplyCode::GeneralFailure,
        }
    }
}

impl From<ReadError> for SocksError {
    fn from(err: ReadError) -> Self {
        match err {
            ReadError::InvalidFormat(_) => SocksError::InvalidArgument(err.to_string()),
            ReadError::UnexpectedByte { .. } | ReadError::TooLong(_) => {
                SocksError::Protocol(err.to_string())
            }
            ReadError::Closed => SocksError::ConnectionLost(err.to_string()),
        }
    }
}

impl From<ConnectError> for SocksError {
    fn from(err: ConnectError) -> Self {
        match err.kind {
            ConnectErrorKind::Cancelled => SocksError::Cancelled(err.message),
            ConnectErrorKind::InvalidTarget => SocksError::InvalidArgument(err.message),
            _ => SocksError::TargetConnect {
                code: ReplyCode::from(&err),
                message: err.message,
            },
        }
    }
}

/// Errors produced by the incremental stream reader
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    /// Field width other than 1, 2 or 4 bytes
    #[error("Invalid field width {0}, expected 1, 2 or 4")]
    InvalidFormat(usize),

    /// Asserted byte did not match
    #[error("Expected 0x{expected:02X}, but got 0x{actual:02X}")]
    UnexpectedByte {
        /// Byte the caller asserted
        expected: u8,
        /// Byte actually received
        actual: u8,
    },

    /// No NUL terminator within the allowed number of bytes
    #[error("No NUL terminator within {0} bytes")]
    TooLong(usize),

    /// Reader dropped before the read could complete
    #[error("Stream reader closed before the read completed")]
    Closed,
}

/// Reply codes for SOCKS5 protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyCode {
    /// Command succeeded
    Succeeded = 0x00,
    /// General SOCKS server failure
    GeneralFailure = 0x01,
    /// Connection not allowed by ruleset
    ConnectionNotAllowed = 0x02,
    /// Network unreachable
    NetworkUnreachable = 0x03,
    /// Host unreachable
    HostUnreachable = 0x04,
    /// Connection refused
    ConnectionRefused = 0x05,
    /// TTL expired
    TtlExpired = 0x06,
    /// Command not supported
    CommandNotSupported = 0x07,
    /// Address type not supported
    AddressTypeNotSupported = 0x08,
}

impl ReplyCode {
    /// Reason used when a proxy reports this code to the client
    pub fn reason(self) -> &'static str {
        match self {
            ReplyCode::Succeeded => "succeeded",
            ReplyCode::GeneralFailure => "proxy refused connection with general server failure",
            ReplyCode::ConnectionNotAllowed => "proxy denied access due to ruleset",
            ReplyCode::NetworkUnreachable => "proxy reported network unreachable",
            ReplyCode::HostUnreachable => "proxy reported host unreachable",
            ReplyCode::ConnectionRefused => "proxy reported connection refused",
            ReplyCode::TtlExpired => "proxy reported TTL/timeout expired",
            ReplyCode::CommandNotSupported => "proxy does not support the CONNECT command",
            ReplyCode::AddressTypeNotSupported => "proxy does not support this address type",
        }
    }
}

impl From<ReplyCode> for u8 {
    fn from(code: ReplyCode) -> Self {
        code as u8
    }
}

impl TryFrom<u8> for ReplyCode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(ReplyCode::Succeeded),
            0x01 => Ok(ReplyCode::GeneralFailure),
            0x02 => Ok(ReplyCode::ConnectionNotAllowed),
            0x03 => Ok(ReplyCode::NetworkUnreachable),
            0x04 => Ok(ReplyCode::HostUnreachable),
            0x05 => Ok(ReplyCode::ConnectionRefused),
            0x06 => Ok(ReplyCode::TtlExpired),
            0x07 => Ok(ReplyCode::CommandNotSupported),
            0x08 => Ok(ReplyCode::AddressTypeNotSupported),
            other => Err(other),
        }
    }
}

impl From<&ConnectError> for ReplyCode {
    fn from(err: &ConnectError) -> Self {
        match err.kind {
            ConnectErrorKind::PermissionDenied => ReplyCode::ConnectionNotAllowed,
            ConnectErrorKind::HostUnreachable => ReplyCode::HostUnreachable,
            ConnectErrorKind::NetworkUnreachable => ReplyCode::NetworkUnreachable,
            ConnectErrorKind::ConnectionRefused => ReplyCode::ConnectionRefused,
            ConnectErrorKind::TimedOut => ReplyCode::TtlExpired,
            ConnectErrorKind::Cancelled
            | ConnectErrorKind::InvalidTarget
            | ConnectErrorKind::Other => ReplyCode::GeneralFailure,
        }
    }
}

/// Classification of outbound connect failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectErrorKind {
    /// Rejected by policy or by the operating system
    PermissionDenied,
    /// No route to the network
    NetworkUnreachable,
    /// No route to the host
    HostUnreachable,
    /// Target actively refused the connection
    ConnectionRefused,
    /// Connect attempt timed out
    TimedOut,
    /// Attempt aborted before completion
    Cancelled,
    /// Target URI could not be parsed
    InvalidTarget,
    /// Anything else
    Other,
}

/// Error returned by a [`Connector`](crate::transport::Connector)
#[derive(Error, Debug)]
#[error("{message}")]
pub struct ConnectError {
    /// Failure classification
    pub kind: ConnectErrorKind,
    /// Human readable reason
    pub message: String,
    #[source]
    source: Option<io::Error>,
}

impl ConnectError {
    /// Create a new connect error
    pub fn new(kind: ConnectErrorKind, message: impl Into<String>) -> Self {
        ConnectError {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Classify an IO error raised while connecting
    pub fn from_io(err: io::Error, context: impl fmt::Display) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::PermissionDenied => ConnectErrorKind::PermissionDenied,
            io::ErrorKind::HostUnreachable => ConnectErrorKind::HostUnreachable,
            io::ErrorKind::NetworkUnreachable => ConnectErrorKind::NetworkUnreachable,
            io::ErrorKind::ConnectionRefused => ConnectErrorKind::ConnectionRefused,
            io::ErrorKind::TimedOut => ConnectErrorKind::TimedOut,
            _ if err.to_string().contains("Connection refused") => {
                ConnectErrorKind::ConnectionRefused
            }
            _ => ConnectErrorKind::Other,
        };

        ConnectError {
            kind,
            message: format!("{}: {}", context, err),
            source: Some(err),
        }
    }
}

impl From<SocksError> for ConnectError {
    fn from(err: SocksError) -> Self {
        let kind = match &err {
            SocksError::TargetConnect { code, .. } => match code {
                ReplyCode::ConnectionNotAllowed => ConnectErrorKind::PermissionDenied,
                ReplyCode::NetworkUnreachable => ConnectErrorKind::NetworkUnreachable,
                ReplyCode::HostUnreachable => ConnectErrorKind::HostUnreachable,
                ReplyCode::ConnectionRefused => ConnectErrorKind::ConnectionRefused,
                ReplyCode::TtlExpired => ConnectErrorKind::TimedOut,
                _ => ConnectErrorKind::Other,
            },
            SocksError::Cancelled(_) => ConnectErrorKind::Cancelled,
            SocksError::InvalidArgument(_) | SocksError::RequiresIpv4(_) => {
                ConnectErrorKind::InvalidTarget
            }
            _ => ConnectErrorKind::Other,
        };

        ConnectError::new(kind, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_code_from_u8_valid() {
        for value in 0x00..=0x08u8 {
            let code = ReplyCode::try_from(value).unwrap();
            assert_eq!(u8::from(code), value);
        }
    }

    #[test]
    fn test_reply_code_from_u8_invalid() {
        assert_eq!(ReplyCode::try_from(0xFF), Err(0xFF));
        assert_eq!(ReplyCode::try_from(0x09), Err(0x09));
        assert_eq!(ReplyCode::try_from(200), Err(200));
    }

    #[test]
    fn test_reply_code_from_connect_error() {
        let cases = [
            (ConnectErrorKind::PermissionDenied, ReplyCode::ConnectionNotAllowed),
            (ConnectErrorKind::HostUnreachable, ReplyCode::HostUnreachable),
            (ConnectErrorKind::NetworkUnreachable, ReplyCode::NetworkUnreachable),
            (ConnectErrorKind::ConnectionRefused, ReplyCode::ConnectionRefused),
            (ConnectErrorKind::TimedOut, ReplyCode::TtlExpired),
            (ConnectErrorKind::Other, ReplyCode::GeneralFailure),
            (ConnectErrorKind::Cancelled, ReplyCode::GeneralFailure),
        ];

        for (kind, expected) in cases {
            let err = ConnectError::new(kind, "test");
            assert_eq!(ReplyCode::from(&err), expected);
        }
    }

    #[test]
    fn test_connect_error_from_io() {
        let cases = [
            (io::ErrorKind::PermissionDenied, ConnectErrorKind::PermissionDenied),
            (io::ErrorKind::HostUnreachable, ConnectErrorKind::HostUnreachable),
            (io::ErrorKind::NetworkUnreachable, ConnectErrorKind::NetworkUnreachable),
            (io::ErrorKind::ConnectionRefused, ConnectErrorKind::ConnectionRefused),
            (io::ErrorKind::TimedOut, ConnectErrorKind::TimedOut),
            (io::ErrorKind::NotFound, ConnectErrorKind::Other),
        ];

        for (io_kind, expected) in cases {
            let err = ConnectError::from_io(io::Error::new(io_kind, "test"), "example.com:80");
            assert_eq!(err.kind, expected);
            assert!(err.message.starts_with("example.com:80"));
        }
    }

    #[test]
    fn test_connect_error_refused_by_message() {
        let io_err = io::Error::new(io::ErrorKind::Other, "Connection refused");
        let err = ConnectError::from_io(io_err, "target");
        assert_eq!(err.kind, ConnectErrorKind::ConnectionRefused);
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(err.to_string(), "target: Connection refused");
    }

    #[test]
    fn test_connect_error_display_and_source() {
        let err = ConnectError::new(
            ConnectErrorKind::TimedOut,
            "Connection to example.com:80 timed out",
        );
        assert_eq!(err.to_string(), "Connection to example.com:80 timed out");
        assert!(std::error::Error::source(&err).is_none());
    }

    #[test]
    fn test_socks_error_from_connect_error() {
        let err: SocksError =
            ConnectError::new(ConnectErrorKind::HostUnreachable, "no route").into();
        assert!(matches!(
            err,
            SocksError::TargetConnect {
                code: ReplyCode::HostUnreachable,
                ..
            }
        ));
        assert_eq!(err.reply_code(), ReplyCode::HostUnreachable);

        let err: SocksError = ConnectError::new(ConnectErrorKind::Cancelled, "closed").into();
        assert!(matches!(err, SocksError::Cancelled(_)));
    }

    #[test]
    fn test_socks_error_from_read_error() {
        let err: SocksError = ReadError::UnexpectedByte {
            expected: 0x01,
            actual: 0x02,
        }
        .into();
        assert!(matches!(err, SocksError::Protocol(_)));
        assert_eq!(err.to_string(), "Protocol error: Expected 0x01, but got 0x02");

        let err: SocksError = ReadError::InvalidFormat(3).into();
        assert!(matches!(err, SocksError::InvalidArgument(_)));

        let err: SocksError = ReadError::Closed.into();
        assert!(matches!(err, SocksError::ConnectionLost(_)));
    }

    #[test]
    fn test_socks_error_display() {
        let err = SocksError::Protocol("bad version".to_string());
        assert_eq!(format!("{}", err), "Protocol error: bad version");

        let err = SocksError::Auth("rejected".to_string());
        assert_eq!(format!("{}", err), "Authentication error: rejected");

        let err = SocksError::RequiresIpv4("example.com".to_string());
        assert_eq!(
            format!("{}", err),
            "Requires an IPv4 address for SOCKS4, got example.com"
        );

        let err = SocksError::Protocol("x".to_string());
        assert_eq!(err.reply_code(), ReplyCode::GeneralFailure);
    }

    #[test]
    fn test_connect_error_from_socks_error() {
        let err = ConnectError::from(SocksError::TargetConnect {
            code: ReplyCode::ConnectionNotAllowed,
            message: "denied".to_string(),
        });
        assert_eq!(err.kind, ConnectErrorKind::PermissionDenied);
        assert_eq!(ReplyCode::from(&err), ReplyCode::ConnectionNotAllowed);

        let err = ConnectError::from(SocksError::Cancelled("stop".to_string()));
        assert_eq!(err.kind, ConnectErrorKind::Cancelled);

        let err = ConnectError::from(SocksError::Protocol("bad".to_string()));
        assert_eq!(err.kind, ConnectErrorKind::Other);
    }

    #[test]
    fn test_reply_code_reason() {
        assert_eq!(
            ReplyCode::ConnectionNotAllowed.reason(),
            "proxy denied access due to ruleset"
        );
        assert_eq!(
            ReplyCode::TtlExpired.reason(),
            "proxy reported TTL/timeout expired"
        );
    }
}
