//! Background retention sweeper for terminal jobs.
//!
//! Completed and cancelled jobs are dropped after their configured
//! retention window; failed jobs get a longer one so operators can still
//! inspect them. Output artifacts on disk are never touched.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::queue::JobQueue;

/// Periodic job retention sweeper.
pub struct JobSweeper {
    queue: Arc<JobQueue>,
}

impl JobSweeper {
    pub fn new(queue: Arc<JobQueue>) -> Self {
        Self { queue }
    }

    /// Start the background sweep task.
    pub fn start_background_task(&self, cancel: CancellationToken) {
        let queue = self.queue.clone();
        let interval_secs = queue.config().sweep_interval_secs.max(1);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            info!(
                interval_secs,
                completed_retention_hours = queue.config().completed_retention_hours,
                failed_retention_hours = queue.config().failed_retention_hours,
                "job sweeper started"
            );
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("job sweeper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = queue.sweep_expired();
                        if removed > 0 {
                            debug!(removed, "sweep cycle complete");
                        }
                    }
                }
            }
        });
    }
}
