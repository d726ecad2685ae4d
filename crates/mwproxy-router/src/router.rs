//! Routing decision for an intercepted connection

use crate::classifier::{Classification, NetworkRanges};
use mwproxy_directory::{DirectoryError, NodeResolver};
use mwproxy_proto::{Destination, DestinationError};
use mwproxy_tunnel::{RelayStats, TunnelClient, TunnelError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

/// What to do when no node can be picked for an overlay destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionPolicy {
    /// Drop the connection
    Abort,
    /// Tunnel anyway with an empty node id and let the forwarder decide
    #[default]
    Continue,
}

impl FromStr for ResolutionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "abort" => Ok(ResolutionPolicy::Abort),
            "continue" => Ok(ResolutionPolicy::Continue),
            other => Err(format!(
                "unknown resolution policy '{}' (expected 'abort' or 'continue')",
                other
            )),
        }
    }
}

impl fmt::Display for ResolutionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionPolicy::Abort => write!(f, "abort"),
            ResolutionPolicy::Continue => write!(f, "continue"),
        }
    }
}

/// Where a connection is sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub classification: Classification,
    /// Node id for the `hostid` header; empty when resolution failed under
    /// [`ResolutionPolicy::Continue`]
    pub node_id: String,
    pub port: u16,
    /// Original overlay address, set only for overlay destinations
    pub destination_host: Option<IpAddr>,
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error(transparent)]
    Destination(#[from] DestinationError),

    #[error("Node resolution failed: {0}")]
    Resolution(#[from] DirectoryError),

    #[error("Tunnel failed: {0}")]
    Tunnel(#[from] TunnelError),
}

/// Classifies destinations, picks the node and opens the tunnel
pub struct ConnectionRouter {
    ranges: NetworkRanges,
    resolver: Arc<dyn NodeResolver>,
    tunnel: TunnelClient,
    policy: ResolutionPolicy,
}

impl ConnectionRouter {
    pub fn new(ranges: NetworkRanges, resolver: Arc<dyn NodeResolver>, tunnel: TunnelClient) -> Self {
        Self {
            ranges,
            resolver,
            tunnel,
            policy: ResolutionPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: ResolutionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> ResolutionPolicy {
        self.policy
    }

    pub fn ranges(&self) -> &NetworkRanges {
        &self.ranges
    }

    /// Decide which node carries a connection to `destination`.
    ///
    /// Overlay destinations go through any node in round-robin order. Direct
    /// destinations must belong to a known node; a failed lookup always
    /// aborts.
    pub async fn resolve(&self, destination: Destination) -> Result<Route, RouteError> {
        let classification = self.ranges.classify(destination.ip);

        if !classification.is_overlay() {
            let node_id = self.resolver.lookup_by_ip(destination.ip).await?;
            info!(
                ip = %destination.ip,
                node_id = %node_id,
                "Resolved node by primary IP"
            );
            return Ok(Route {
                classification,
                node_id,
                port: destination.port,
                destination_host: None,
            });
        }

        let node_id = match self.resolver.pick_random().await {
            Ok(node_id) => node_id,
            Err(e) if self.policy == ResolutionPolicy::Continue => {
                warn!(
                    ip = %destination.ip,
                    network = %classification,
                    error = %e,
                    "Could not pick a node, continuing without one"
                );
                String::new()
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            ip = %destination.ip,
            network = %classification,
            node_id = %node_id,
            "Destination within overlay network"
        );

        Ok(Route {
            classification,
            node_id,
            port: destination.port,
            destination_host: Some(destination.ip),
        })
    }

    /// Route one intercepted connection.
    ///
    /// `raw_destination` is the recovered original destination in `ip:port`
    /// form. On any error nothing has been relayed; the caller drops
    /// `inbound` to close it.
    pub async fn handle<S>(&self, inbound: S, raw_destination: &str) -> Result<RelayStats, RouteError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let destination = Destination::parse(raw_destination)?;
        debug!(destination = %destination, "Routing connection");

        let route = self.resolve(destination).await?;
        let stats = self
            .tunnel
            .tunnel(inbound, &route.node_id, route.port, route.destination_host)
            .await?;

        Ok(stats)
    }
}
