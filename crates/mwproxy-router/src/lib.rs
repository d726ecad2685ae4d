//! Connection routing
//!
//! Classifies an intercepted destination against the overlay network ranges,
//! resolves the node that should carry it and hands the connection to the
//! forwarder tunnel.

pub mod classifier;
pub mod router;

pub use classifier::{Classification, ClassifierError, NetworkRanges};
pub use router::{ConnectionRouter, ResolutionPolicy, Route, RouteError};
