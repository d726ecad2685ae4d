//! Transparent Proxy Listener
//!
//! Accepts connections redirected to the proxy by the packet filter, recovers
//! each connection's original destination and hands it to the
//! [`mwproxy_router::ConnectionRouter`].

pub mod destination;
pub mod server;

pub use destination::{DestinationResolver, OriginalDstResolver};
pub use server::{connection_id, ProxyServer, ProxyServerConfig, ServerError};
