//! Token issuance for the node directory API
//!
//! Directory calls carry a project-scoped bearer token. This crate defines the
//! `TokenIssuer` seam and a Keystone v3 implementation of it.

pub mod issuer;
pub mod keystone;

pub use issuer::{AuthError, Credentials, TokenIssuer};
pub use keystone::{KeystoneClient, KeystoneConfig};

// Re-export so implementors don't need their own dependency
pub use async_trait::async_trait;
