//! SOCKS module for Socksrelay
//!
//! This module implements the SOCKS4, SOCKS4a and SOCKS5 CONNECT handshakes
//! in both directions: a client that tunnels through an existing proxy, and
//! a server that accepts SOCKS clients and relays their connections.

mod auth;
mod client;
mod consts;
mod server;
mod session;
mod tcp_relay;
mod types;

pub use auth::{AuthFn, AuthFuture, Authenticator, StaticAuthenticator};
pub use client::{handshake, Client};
pub use consts::*;
pub use server::Server;
pub use tcp_relay::{
    end_connection, relay, RelayStats, DEFAULT_RELAY_BUFFER_SIZE, END_CONNECTION_TIMEOUT,
};
pub use types::{Credentials, ProtocolVersion, SocksCommand, Target, TargetAddr};
