//! Periodic recovery of abandoned leases.

use crate::error::JobResult;
use crate::metrics::JobMetrics;
use crate::store::JobStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, Instrument};

/// Returns jobs whose lease expired without ack or fail to their queue.
///
/// Runs independently of the worker pools; it only touches leases that
/// have already expired, so it is safe alongside active leasing.
#[derive(Clone)]
pub struct LeaseReaper {
    store: Arc<dyn JobStore>,
    interval: Duration,
}

impl LeaseReaper {
    /// Creates a reaper running every `interval`.
    pub fn new(store: Arc<dyn JobStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Reap interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Runs one reaping pass.
    pub async fn reap_once(&self) -> JobResult<u64> {
        let reaped = self.store.reap_expired_leases().await?;
        JobMetrics::leases_reaped(reaped);
        if reaped > 0 {
            info!(reaped, "Reaped expired leases");
        } else {
            debug!("No expired leases");
        }
        Ok(reaped)
    }

    /// Spawns the reaping loop; it exits on the shutdown signal.
    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(
            async move {
                info!(interval_secs = self.interval.as_secs(), "Lease reaper started");
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(self.interval) => {
                            if let Err(e) = self.reap_once().await {
                                error!(error = %e, "Failed to reap expired leases");
                            }
                        }
                        _ = shutdown.recv() => {
                            info!("Lease reaper stopped");
                            break;
                        }
                    }
                }
            }
            .instrument(tracing::info_span!("lease_reaper")),
        )
    }
}

impl std::fmt::Debug for LeaseReaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseReaper")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::job::{JobPayload, JobRecord, JobState};
    use crate::store::InMemoryJobStore;
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn test_reap_once_requeues_expired() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(t0));
        let store = Arc::new(InMemoryJobStore::with_clock(clock.clone()));
        let id = store
            .create(JobRecord::new(JobPayload::kind("noop"), "default", t0).max_attempts(3))
            .await
            .unwrap();
        store
            .lease_next(&["default".to_string()], Duration::from_secs(10))
            .await
            .unwrap();

        let reaper = LeaseReaper::new(store.clone(), Duration::from_secs(1));
        assert_eq!(reaper.reap_once().await.unwrap(), 0);

        clock.advance(Duration::from_secs(11));
        assert_eq!(reaper.reap_once().await.unwrap(), 1);
        assert_eq!(store.get(&id).await.unwrap().unwrap().state, JobState::Enqueued);
    }

    #[tokio::test]
    async fn test_loop_stops_on_shutdown() {
        let store = Arc::new(InMemoryJobStore::new());
        let (tx, rx) = broadcast::channel(1);
        let handle = LeaseReaper::new(store, Duration::from_millis(10)).spawn(rx);

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
