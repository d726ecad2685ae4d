//! Forwarder upgrade handshake
//!
//! The proxy opens a plain TCP connection to the forwarder and sends an
//! HTTP/1.1 upgrade request describing the target node and port. A `101
//! Switching Protocols` answer turns the connection into an opaque byte pipe.

use crate::{FORWARDER_PROTOCOL, MAX_RESPONSE_HEAD, STATUS_SWITCHING_PROTOCOLS};
use std::fmt::Write;
use thiserror::Error;

/// Header slots tried first; most forwarder responses carry a handful
const INITIAL_HEADERS: usize = 32;

/// Enough slots for any head within `MAX_RESPONSE_HEAD` (shortest header
/// line is `a:\r\n`)
const MAX_HEADERS: usize = MAX_RESPONSE_HEAD / 4;

/// Errors produced while parsing the forwarder's response
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("Malformed upgrade response: {0}")]
    Malformed(String),

    #[error("Upgrade response head exceeds {0} bytes")]
    HeadTooLarge(usize),
}

/// Upgrade request sent to the forwarder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    /// Forwarder address (host:port), used as request target and Host
    pub forwarder: String,
    /// Node the forwarder should reach
    pub host_id: String,
    /// Port on the target node
    pub host_local_port: u16,
    /// Explicit destination host for service/container traffic
    pub destination_host: Option<String>,
}

impl UpgradeRequest {
    pub fn new(forwarder: impl Into<String>, host_id: impl Into<String>, port: u16) -> Self {
        Self {
            forwarder: forwarder.into(),
            host_id: host_id.into(),
            host_local_port: port,
            destination_host: None,
        }
    }

    pub fn with_destination_host(mut self, host: Option<String>) -> Self {
        self.destination_host = host;
        self
    }

    /// Render the request head, terminated by an empty line
    pub fn encode(&self) -> Vec<u8> {
        let mut head = String::with_capacity(256);
        // Writing into a String cannot fail
        let _ = write!(head, "GET http://{} HTTP/1.1\r\n", self.forwarder);
        let _ = write!(head, "Host: {}\r\n", self.forwarder);
        head.push_str("Connection: Upgrade\r\n");
        let _ = write!(head, "Upgrade: {}\r\n", FORWARDER_PROTOCOL);
        let _ = write!(head, "hostid: {}\r\n", self.host_id);
        let _ = write!(head, "hostlocalport: {}\r\n", self.host_local_port);
        if let Some(host) = &self.destination_host {
            let _ = write!(head, "destinationhost: {}\r\n", host);
        }
        head.push_str("\r\n");
        head.into_bytes()
    }
}

/// Parsed forwarder response head
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    /// Bytes consumed by the status line and headers (including the blank line)
    pub header_len: usize,
}

impl UpgradeResponse {
    /// Try to parse a response head from the bytes received so far.
    ///
    /// Returns `Ok(None)` when more data is needed.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>, HandshakeError> {
        let mut headers = [httparse::EMPTY_HEADER; INITIAL_HEADERS];
        match Self::parse_with(buf, &mut headers) {
            Err(httparse::Error::TooManyHeaders) => {
                let mut headers = vec![httparse::EMPTY_HEADER; MAX_HEADERS];
                match Self::parse_with(buf, &mut headers) {
                    Err(httparse::Error::TooManyHeaders) => {
                        Err(HandshakeError::HeadTooLarge(MAX_RESPONSE_HEAD))
                    }
                    other => Self::finish(buf, other),
                }
            }
            other => Self::finish(buf, other),
        }
    }

    fn parse_with<'b>(
        buf: &'b [u8],
        headers: &mut [httparse::Header<'b>],
    ) -> Result<Option<Self>, httparse::Error> {
        let mut response = httparse::Response::new(headers);

        match response.parse(buf)? {
            httparse::Status::Complete(header_len) => Ok(Some(Self {
                // httparse always sets the code on a complete response
                status: response.code.unwrap_or_default(),
                reason: response.reason.unwrap_or_default().to_string(),
                headers: response
                    .headers
                    .iter()
                    .map(|h| {
                        (
                            h.name.to_string(),
                            String::from_utf8_lossy(h.value).to_string(),
                        )
                    })
                    .collect(),
                header_len,
            })),
            httparse::Status::Partial => Ok(None),
        }
    }

    fn finish(
        buf: &[u8],
        parsed: Result<Option<Self>, httparse::Error>,
    ) -> Result<Option<Self>, HandshakeError> {
        match parsed {
            Ok(Some(response)) => Ok(Some(response)),
            Ok(None) if buf.len() >= MAX_RESPONSE_HEAD => {
                Err(HandshakeError::HeadTooLarge(MAX_RESPONSE_HEAD))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(HandshakeError::Malformed(e.to_string())),
        }
    }

    pub fn is_switching_protocols(&self) -> bool {
        self.status == STATUS_SWITCHING_PROTOCOLS
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}
