//! Original destination of an intercepted connection
//!
//! The interception layer reports destinations in `ip:port` text form. Parsing
//! is strict: exactly one `:` separator, a literal IP and a numeric port.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

/// Errors produced while parsing a recovered destination
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DestinationError {
    #[error("Invalid destination '{0}' (expected format: ip:port)")]
    InvalidFormat(String),

    #[error("Malformed IP address '{0}'")]
    InvalidIp(String),

    #[error("Invalid port '{0}'")]
    InvalidPort(String),
}

/// A parsed `ip:port` destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Destination {
    pub ip: IpAddr,
    pub port: u16,
}

impl Destination {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    /// Parse a destination, rejecting anything that isn't exactly `ip:port`
    pub fn parse(raw: &str) -> Result<Self, DestinationError> {
        let parts: Vec<&str> = raw.split(':').collect();
        if parts.len() != 2 {
            return Err(DestinationError::InvalidFormat(raw.to_string()));
        }

        let ip = IpAddr::from_str(parts[0])
            .map_err(|_| DestinationError::InvalidIp(parts[0].to_string()))?;
        let port = parts[1]
            .parse::<u16>()
            .map_err(|_| DestinationError::InvalidPort(parts[1].to_string()))?;

        Ok(Self { ip, port })
    }
}

impl FromStr for Destination {
    type Err = DestinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}
