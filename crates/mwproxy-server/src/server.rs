//! Listener and per-connection tasks

use crate::destination::DestinationResolver;
use mwproxy_router::ConnectionRouter;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, info_span, warn, Instrument};

const BIND_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind to {address}:{port}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Failed to recover original destination: {0}")]
    Interception(std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ProxyServerConfig {
    pub bind_addr: SocketAddr,
}

impl ProxyServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self { bind_addr }
    }
}

impl Default for ProxyServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
        }
    }
}

/// Short id used to correlate the log lines of one connection
pub fn connection_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

pub struct ProxyServer {
    config: ProxyServerConfig,
    router: Arc<ConnectionRouter>,
    destinations: Arc<dyn DestinationResolver>,
}

impl ProxyServer {
    pub fn new(
        config: ProxyServerConfig,
        router: Arc<ConnectionRouter>,
        destinations: Arc<dyn DestinationResolver>,
    ) -> Self {
        Self {
            config,
            router,
            destinations,
        }
    }

    /// Bind the listen socket, retrying while the port is still in use
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let bind_addr = self.config.bind_addr;
        let bind_error = |reason: String| ServerError::BindError {
            address: bind_addr.ip().to_string(),
            port: bind_addr.port(),
            reason,
        };

        for attempt in 1..=BIND_ATTEMPTS {
            match TcpListener::bind(bind_addr).await {
                Ok(listener) => {
                    let local = listener.local_addr()?;
                    if attempt > 1 {
                        info!(
                            "Bound to {} on attempt {}/{}",
                            local, attempt, BIND_ATTEMPTS
                        );
                    }
                    info!("Proxy listening on {}", local);
                    return Ok(listener);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < BIND_ATTEMPTS => {
                    warn!(
                        "Port {} is in use (attempt {}/{}), retrying in 1 second...",
                        bind_addr.port(),
                        attempt,
                        BIND_ATTEMPTS
                    );
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(e) => return Err(bind_error(e.to_string())),
            }
        }

        Err(bind_error(format!(
            "Address in use after {} attempts",
            BIND_ATTEMPTS
        )))
    }

    /// Bind and accept forever
    pub async fn start(self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.run(listener).await
    }

    /// Accept connections on `listener`, one task per connection
    pub async fn run(self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let router = self.router.clone();
                    let destinations = self.destinations.clone();
                    let span = info_span!("conn", id = %connection_id(), peer = %peer_addr);

                    tokio::spawn(
                        Self::handle_connection(stream, router, destinations).instrument(span),
                    );
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        router: Arc<ConnectionRouter>,
        destinations: Arc<dyn DestinationResolver>,
    ) {
        let original = match destinations
            .original_destination(&stream)
            .map_err(ServerError::Interception)
        {
            Ok(addr) => addr,
            Err(e) => {
                warn!("Dropping connection: {}", e);
                return;
            }
        };

        info!(destination = %original, "Accepted connection");

        // The stream is moved into the router and dropped on every path
        match router.handle(stream, &original.to_string()).await {
            Ok(stats) => debug!(
                bytes_to_forwarder = stats.bytes_to_forwarder,
                bytes_to_client = stats.bytes_to_client,
                "Connection finished"
            ),
            Err(e) => warn!(destination = %original, "Dropping connection: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_shape() {
        let id = connection_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(connection_id(), connection_id());
    }

    #[test]
    fn test_default_config_uses_dynamic_port() {
        let config = ProxyServerConfig::default();
        assert_eq!(config.bind_addr.port(), 0);
        assert!(config.bind_addr.ip().is_unspecified());
    }

    #[test]
    fn test_bind_error_display() {
        let err = ServerError::BindError {
            address: "0.0.0.0".to_string(),
            port: 9999,
            reason: "Address in use".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("0.0.0.0:9999"));
        assert!(msg.contains("lsof -i :9999"));
    }
}
