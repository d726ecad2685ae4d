//! Forwarder Protocol Definitions
//!
//! This crate defines the wire format spoken between the proxy and the
//! per-node forwarding agents, plus the destination address type recovered
//! from intercepted connections.

pub mod destination;
pub mod handshake;

pub use destination::{Destination, DestinationError};
pub use handshake::{HandshakeError, UpgradeRequest, UpgradeResponse};

/// Upgrade token identifying the dynamic forwarder protocol (v2)
pub const FORWARDER_PROTOCOL: &str = "platform9.com/forwarder.dynamic.v2";

/// Maximum size of the forwarder's upgrade response head
pub const MAX_RESPONSE_HEAD: usize = 8192;

/// HTTP status code the forwarder answers with when the tunnel is accepted
pub const STATUS_SWITCHING_PROTOCOLS: u16 = 101;
