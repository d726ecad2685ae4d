//! Original destination recovery for redirected connections

use std::io;
use std::net::SocketAddr;
use tokio::net::TcpStream;

/// Recovers where a redirected connection was originally headed
pub trait DestinationResolver: Send + Sync {
    fn original_destination(&self, stream: &TcpStream) -> io::Result<SocketAddr>;
}

/// Reads `SO_ORIGINAL_DST` from sockets redirected by an iptables REDIRECT or
/// DNAT rule.
#[derive(Debug, Clone, Copy, Default)]
pub struct OriginalDstResolver;

impl OriginalDstResolver {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(target_os = "linux")]
impl DestinationResolver for OriginalDstResolver {
    fn original_destination(&self, stream: &TcpStream) -> io::Result<SocketAddr> {
        let socket = socket2::SockRef::from(stream);
        let local = stream.local_addr()?;

        let addr = if local.is_ipv4() {
            socket.original_dst()?
        } else {
            socket.original_dst_ipv6()?
        };

        addr.as_socket().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                "original destination is not an inet address",
            )
        })
    }
}

#[cfg(not(target_os = "linux"))]
impl DestinationResolver for OriginalDstResolver {
    fn original_destination(&self, _stream: &TcpStream) -> io::Result<SocketAddr> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "original destination recovery requires Linux",
        ))
    }
}
