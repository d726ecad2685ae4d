//! Destination classification against the overlay network ranges

use ipnetwork::IpNetwork;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

/// Which network a destination belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    /// Virtual service address; any node can relay it
    ServiceNetwork,
    /// Container overlay address; any node can relay it
    ContainerNetwork,
    /// Physical address of a node
    Direct,
}

impl Classification {
    /// Overlay destinations are relayed through an arbitrary node
    pub fn is_overlay(&self) -> bool {
        !matches!(self, Classification::Direct)
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Classification::ServiceNetwork => write!(f, "services network"),
            Classification::ContainerNetwork => write!(f, "containers network"),
            Classification::Direct => write!(f, "direct"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassifierError {
    #[error("Invalid {network} CIDR '{value}': {reason}")]
    InvalidCidr {
        network: &'static str,
        value: String,
        reason: String,
    },
}

/// Service and container CIDR ranges, fixed at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRanges {
    services: IpNetwork,
    containers: IpNetwork,
}

impl NetworkRanges {
    pub fn new(services: IpNetwork, containers: IpNetwork) -> Self {
        Self {
            services,
            containers,
        }
    }

    /// Parse both ranges from CIDR notation (e.g. "10.21.0.0/16")
    pub fn parse(services: &str, containers: &str) -> Result<Self, ClassifierError> {
        let services = parse_cidr("services", services)?;
        let containers = parse_cidr("containers", containers)?;
        Ok(Self::new(services, containers))
    }

    pub fn services(&self) -> IpNetwork {
        self.services
    }

    pub fn containers(&self) -> IpNetwork {
        self.containers
    }

    /// Classify a destination. The services range wins if the ranges overlap.
    pub fn classify(&self, ip: IpAddr) -> Classification {
        if self.services.contains(ip) {
            Classification::ServiceNetwork
        } else if self.containers.contains(ip) {
            Classification::ContainerNetwork
        } else {
            Classification::Direct
        }
    }
}

fn parse_cidr(network: &'static str, value: &str) -> Result<IpNetwork, ClassifierError> {
    IpNetwork::from_str(value).map_err(|e| ClassifierError::InvalidCidr {
        network,
        value: value.to_string(),
        reason: e.to_string(),
    })
}
