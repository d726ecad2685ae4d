//! Node Directory
//!
//! Resolves cluster nodes from the remote node-directory API. Results are held
//! in a memory-resident cache that is rebuilt wholesale on demand and dropped
//! periodically by the [`CacheInvalidator`].

pub mod directory;
pub mod invalidator;
pub mod lister;
pub mod node;

pub use directory::{DirectoryConfig, DirectoryError, NodeDirectory, NodeResolver};
pub use invalidator::CacheInvalidator;
pub use lister::{HttpNodeLister, HttpNodeListerConfig, ListError, NodeLister};
pub use node::Node;

/// Default period between forced cache invalidations (5 minutes)
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;
