//! Periodic cache invalidation
//!
//! Bounds cache staleness without push notifications from the directory API.
//! The timer restarts after each invalidation; there is no jitter and no stop
//! signal beyond aborting the returned task.

use crate::directory::NodeDirectory;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub struct CacheInvalidator {
    directory: Arc<NodeDirectory>,
    period: Duration,
}

impl CacheInvalidator {
    pub fn new(directory: Arc<NodeDirectory>, period: Duration) -> Self {
        Self { directory, period }
    }

    /// Run on a background task for the lifetime of the runtime
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        info!("Invalidating node cache every {:?}", self.period);
        loop {
            tokio::time::sleep(self.period).await;
            debug!("Cache timer fired");
            self.directory.invalidate().await;
        }
    }
}
