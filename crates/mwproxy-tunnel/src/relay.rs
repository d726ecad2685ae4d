use crate::RELAY_CHUNK_SIZE;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Byte counts for a finished relay
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub bytes_to_forwarder: u64,
    pub bytes_to_client: u64,
}

async fn copy_chunked<R, W>(reader: &mut R, writer: &mut W, total: &mut u64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; RELAY_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buffer[..n]).await?;
        *total += n as u64;
    }
}

/// Relay bytes both ways until either side reaches EOF or fails.
///
/// Both streams are shut down and dropped before returning.
pub(crate) async fn relay<C, F>(client: C, forwarder: F) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Unpin,
    F: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut forwarder_read, mut forwarder_write) = tokio::io::split(forwarder);
    let mut stats = RelayStats::default();

    {
        let client_to_forwarder = copy_chunked(
            &mut client_read,
            &mut forwarder_write,
            &mut stats.bytes_to_forwarder,
        );
        let forwarder_to_client = copy_chunked(
            &mut forwarder_read,
            &mut client_write,
            &mut stats.bytes_to_client,
        );

        tokio::select! {
            result = client_to_forwarder => match result {
                Ok(()) => debug!("Client closed connection"),
                Err(e) => debug!("Relay from client stopped: {}", e),
            },
            result = forwarder_to_client => match result {
                Ok(()) => debug!("Forwarder closed connection"),
                Err(e) => debug!("Relay from forwarder stopped: {}", e),
            },
        }
    }

    let _ = forwarder_write.shutdown().await;
    let _ = client_write.shutdown().await;

    stats
}
