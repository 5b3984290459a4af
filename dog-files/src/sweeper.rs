use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::coordinator::UploadCoordinator;
use crate::{FileId, FilesResult};

/// Fixed-interval task that expires abandoned upload sessions and reclaims their storage
pub struct ExpirySweeper {
    uploads: Arc<dyn UploadCoordinator>,
    interval: Duration,
}

impl ExpirySweeper {
    /// Create a new sweeper
    pub fn new(uploads: Arc<dyn UploadCoordinator>, interval: Duration) -> Self {
        Self { uploads, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run one sweep cycle
    pub async fn tick(&self) -> FilesResult<Vec<FileId>> {
        self.uploads.expire_stale(Utc::now()).await
    }

    /// Sweep forever; errors are logged and the loop continues
    pub async fn start(self) {
        let mut ticker = interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Starting expiry sweeper with interval: {:?}", self.interval);

        loop {
            ticker.tick().await;

            match self.tick().await {
                Ok(expired) if !expired.is_empty() => {
                    info!("Expired {} stale upload sessions", expired.len());
                }
                Ok(_) => debug!("No stale upload sessions found"),
                Err(e) => warn!("Error during expiry sweep: {}", e),
            }
        }
    }

    /// Start the sweeper on the current runtime; abort the handle to stop it
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.start())
    }
}
