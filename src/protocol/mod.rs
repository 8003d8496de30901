//! Protocol framing for Socksrelay
//!
//! SOCKS handshakes are length-prefixed, peer-driven binary exchanges that
//! arrive in arbitrarily sized chunks. This module provides the incremental
//! reader both handshake directions are built on.

mod reader;

pub use reader::{BinaryFormat, Fields, Pending, StreamReader};
