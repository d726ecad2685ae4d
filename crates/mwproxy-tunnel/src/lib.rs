//! Forwarder tunnel client
//!
//! Dials a forwarding agent, negotiates the upgrade handshake and relays
//! bytes between the intercepted connection and the forwarder.

mod client;
mod relay;

pub use client::{TunnelClient, TunnelConfig, TunnelError};
pub use relay::RelayStats;

/// Size of a single relay read
pub const RELAY_CHUNK_SIZE: usize = 8192;
