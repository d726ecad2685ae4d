use crate::relay::{relay, RelayStats};
use mwproxy_proto::{HandshakeError, UpgradeRequest, UpgradeResponse};
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

/// Errors that abort a tunnel attempt
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Failed to connect to forwarder {address}: {source}")]
    ConnectionFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("Timed out {0}")]
    Timeout(&'static str),

    #[error("Failed to send upgrade request: {0}")]
    WriteFailed(std::io::Error),

    #[error("Failed to read upgrade response: {0}")]
    ReadFailed(std::io::Error),

    #[error("Forwarder closed the connection during the handshake")]
    ClosedDuringHandshake,

    #[error("Invalid upgrade response: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Unexpected upgrade status code: {0}")]
    UnexpectedStatus(u16),

    #[error("Failed to deliver forwarder data to client: {0}")]
    RelayFailed(std::io::Error),
}

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Forwarding service address (host:port)
    pub forwarder_addr: String,
    pub connect_timeout: Duration,
    /// Bound on writing the request and reading the response head
    pub handshake_timeout: Duration,
}

impl TunnelConfig {
    pub fn new(forwarder_addr: impl Into<String>) -> Self {
        Self {
            forwarder_addr: forwarder_addr.into(),
            connect_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

/// Client side of the dynamic forwarder protocol
#[derive(Debug, Clone)]
pub struct TunnelClient {
    config: TunnelConfig,
}

impl TunnelClient {
    pub fn new(config: TunnelConfig) -> Self {
        Self { config }
    }

    pub fn forwarder_addr(&self) -> &str {
        &self.config.forwarder_addr
    }

    /// Tunnel `inbound` to `port` on node `node_id` through the forwarder.
    ///
    /// Returns once the relay has finished; both connections are closed by
    /// then. On error nothing has been relayed and the outbound connection is
    /// already closed.
    pub async fn tunnel<S>(
        &self,
        inbound: S,
        node_id: &str,
        port: u16,
        destination_host: Option<IpAddr>,
    ) -> Result<RelayStats, TunnelError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (outbound, early_data) = self.open(node_id, port, destination_host).await?;
        info!(node_id = %node_id, port = port, "Connection established");

        let mut inbound = inbound;
        if !early_data.is_empty() {
            inbound
                .write_all(&early_data)
                .await
                .map_err(TunnelError::RelayFailed)?;
        }

        let mut stats = relay(inbound, outbound).await;
        stats.bytes_to_client += early_data.len() as u64;

        info!(
            bytes_to_forwarder = stats.bytes_to_forwarder,
            bytes_to_client = stats.bytes_to_client,
            "Tunnel closed"
        );
        Ok(stats)
    }

    /// Dial the forwarder and complete the upgrade handshake.
    ///
    /// Returns the upgraded stream plus any bytes the forwarder sent after
    /// the response head.
    pub async fn open(
        &self,
        node_id: &str,
        port: u16,
        destination_host: Option<IpAddr>,
    ) -> Result<(TcpStream, Vec<u8>), TunnelError> {
        let address = &self.config.forwarder_addr;

        let mut stream = timeout(self.config.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| TunnelError::Timeout("connecting to forwarder"))?
            .map_err(|e| TunnelError::ConnectionFailed {
                address: address.clone(),
                source: e,
            })?;
        let _ = stream.set_nodelay(true);

        let request = UpgradeRequest::new(address.clone(), node_id, port)
            .with_destination_host(destination_host.map(|ip| ip.to_string()));

        debug!(
            forwarder = %address,
            node_id = %node_id,
            port = port,
            destination_host = ?destination_host,
            "Sending upgrade request"
        );

        let early_data = timeout(
            self.config.handshake_timeout,
            Self::handshake(&mut stream, &request),
        )
        .await
        .map_err(|_| TunnelError::Timeout("waiting for upgrade response"))??;

        Ok((stream, early_data))
    }

    async fn handshake(
        stream: &mut TcpStream,
        request: &UpgradeRequest,
    ) -> Result<Vec<u8>, TunnelError> {
        stream
            .write_all(&request.encode())
            .await
            .map_err(TunnelError::WriteFailed)?;

        let mut buf = Vec::with_capacity(1024);
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream
                .read(&mut chunk)
                .await
                .map_err(TunnelError::ReadFailed)?;
            if n == 0 {
                return Err(TunnelError::ClosedDuringHandshake);
            }
            buf.extend_from_slice(&chunk[..n]);

            if let Some(response) = UpgradeResponse::parse(&buf)? {
                if !response.is_switching_protocols() {
                    return Err(TunnelError::UnexpectedStatus(response.status));
                }
                return Ok(buf.split_off(response.header_len));
            }
        }
    }
}
