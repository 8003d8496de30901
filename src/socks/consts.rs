//! SOCKS protocol constants
//!
//! Wire constants for SOCKS4, SOCKS4a and SOCKS5 (RFC 1928, RFC 1929).

/// SOCKS4 protocol version
pub const SOCKS4_VERSION: u8 = 0x04;

/// SOCKS5 protocol version
pub const SOCKS5_VERSION: u8 = 0x05;

/// SOCKS5 authentication sub-negotiation version
pub const SOCKS5_AUTH_VERSION: u8 = 0x01;

// Authentication methods
/// No authentication required
pub const SOCKS5_AUTH_METHOD_NONE: u8 = 0x00;
/// Username/password authentication
pub const SOCKS5_AUTH_METHOD_PASSWORD: u8 = 0x02;
/// No acceptable methods
pub const SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE: u8 = 0xFF;

// Authentication status
/// Credentials accepted
pub const SOCKS5_AUTH_SUCCESS: u8 = 0x00;
/// Credentials rejected (any non-zero value)
pub const SOCKS5_AUTH_FAILURE: u8 = 0xFF;

// Commands (shared by SOCKS4 and SOCKS5)
/// TCP CONNECT command
pub const SOCKS_CMD_CONNECT: u8 = 0x01;
/// TCP BIND command (acknowledged, not implemented)
pub const SOCKS_CMD_BIND: u8 = 0x02;
/// UDP ASSOCIATE command (SOCKS5 only, not implemented)
pub const SOCKS5_CMD_UDP_ASSOCIATE: u8 = 0x03;

// Address types
/// IPv4 address
pub const SOCKS5_ADDR_TYPE_IPV4: u8 = 0x01;
/// Domain name
pub const SOCKS5_ADDR_TYPE_DOMAIN: u8 = 0x03;
/// IPv6 address
pub const SOCKS5_ADDR_TYPE_IPV6: u8 = 0x04;

// SOCKS4 reply status
/// Request granted
pub const SOCKS4_REPLY_GRANTED: u8 = 0x5A;
/// Request rejected or failed
pub const SOCKS4_REPLY_REJECTED: u8 = 0x5B;

/// Reserved byte value (always 0x00)
pub const SOCKS_RESERVED: u8 = 0x00;

/// SOCKS4a sentinel IP 0.0.0.1 announcing a trailing hostname
pub const SOCKS4A_INVALID_IP: u32 = 0x0000_0001;

/// Maximum domain name, username and password length
pub const MAX_FIELD_LEN: usize = 255;

/// Default SOCKS server port
pub const DEFAULT_SOCKS_PORT: u16 = 1080;
