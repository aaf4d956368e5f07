//! Scheduled purge of records left in the trash past the retention window.

use crate::error::ServiceResult;
use crate::lifecycle::LifecycleManager;
use crate::record_store::RecordStore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

/// Maintenance job purging expired trash across all users.
///
/// Overlapping runs are harmless: a record removed by one run is simply
/// absent from the next run's query, and deletes of missing rows count zero.
pub struct RetentionSweeper {
    store: Arc<dyn RecordStore>,
    lifecycle: Arc<LifecycleManager>,
    retention_window: Duration,
}

impl RetentionSweeper {
    pub fn new(
        store: Arc<dyn RecordStore>,
        lifecycle: Arc<LifecycleManager>,
        retention_window: Duration,
    ) -> Self {
        Self {
            store,
            lifecycle,
            retention_window,
        }
    }

    /// Configured retention window
    pub fn retention_window(&self) -> Duration {
        self.retention_window
    }

    /// Purge with the configured retention window
    pub async fn sweep(&self) -> ServiceResult<u64> {
        self.sweep_with_window(self.retention_window).await
    }

    /// Purge every trashed record whose deletion is at least `retention_window` old
    #[instrument(skip(self))]
    pub async fn sweep_with_window(&self, retention_window: Duration) -> ServiceResult<u64> {
        metrics::counter!("analysis.sweeper.runs").increment(1);

        let expired = self.store.find_expired_trash(retention_window).await?;
        if expired.is_empty() {
            return Ok(0);
        }

        let found = expired.len();
        let purged = self.lifecycle.purge_records(expired).await;
        info!(found, purged, "Retention sweep completed");
        Ok(purged)
    }

    /// Sweep every `interval` until `shutdown` is cancelled. A failed sweep
    /// is logged and retried on the next tick.
    pub async fn run_periodic(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(interval_secs = interval.as_secs(), "Retention sweeper started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Retention sweeper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Retention sweep failed");
                    }
                }
            }
        }
    }
}
