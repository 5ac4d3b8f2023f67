//! Recurring trigger scheduler.
//!
//! Each tick materializes every due slot of every recurring definition
//! and then moves `next_fire_at` forward with a compare-and-set. Slot jobs
//! are created idempotently per `(definition, slot)` before the advance, so
//! a ticker that dies between the two steps re-creates nothing on restart:
//! the next tick sees the same slot, gets the existing job back and
//! advances.

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::dispatcher::Dispatcher;
use crate::error::JobResult;
use crate::metrics::SchedulerMetrics;
use crate::recurring::RecurringDefinition;
use crate::store::JobStore;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Scheduler statistics.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    /// Is the tick loop running.
    pub running: bool,

    /// Slots materialized since start.
    pub jobs_fired: u64,

    /// Time of the last completed tick.
    pub last_tick: Option<DateTime<Utc>>,
}

/// Fires recurring definitions stored in the job store.
pub struct RecurringScheduler {
    store: Arc<dyn JobStore>,
    dispatcher: Dispatcher,
    clock: Arc<dyn Clock>,
    tick_interval: Duration,
    max_catch_up: u32,
    shutdown_tx: broadcast::Sender<()>,
    running: AtomicBool,
    jobs_fired: AtomicU64,
    last_tick: RwLock<Option<DateTime<Utc>>>,
}

impl RecurringScheduler {
    /// Create a new scheduler.
    pub fn new(
        store: Arc<dyn JobStore>,
        dispatcher: Dispatcher,
        clock: Arc<dyn Clock>,
        config: &SchedulerConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            store,
            dispatcher,
            clock,
            tick_interval: config.tick_interval(),
            max_catch_up: config.max_catch_up.max(1),
            shutdown_tx,
            running: AtomicBool::new(false),
            jobs_fired: AtomicU64::new(0),
            last_tick: RwLock::new(None),
        }
    }

    /// Fires every due slot. Returns how many slots were materialized.
    pub async fn tick(&self) -> JobResult<usize> {
        let now = self.clock.now();
        let due = self.store.due_recurring(now).await?;

        let mut fired = 0;
        for definition in &due {
            match self.fire(definition, now).await {
                Ok(count) => fired += count,
                Err(e) => error!(
                    definition_id = %definition.id,
                    error = %e,
                    "Failed to fire recurring job"
                ),
            }
        }

        self.jobs_fired.fetch_add(fired as u64, Ordering::Relaxed);
        *self.last_tick.write() = Some(now);
        Ok(fired)
    }

    async fn fire(&self, definition: &RecurringDefinition, now: DateTime<Utc>) -> JobResult<usize> {
        let Some(mut slot) = definition.next_fire_at.filter(|at| *at <= now) else {
            return Ok(0);
        };

        let mut fired = 0;
        loop {
            if fired >= self.max_catch_up {
                let next = definition.next_after(now)?;
                if self.store.advance_recurring(&definition.id, slot, next).await? {
                    warn!(
                        definition_id = %definition.id,
                        missed_from = %slot,
                        next_fire_at = ?next,
                        "Skipped missed recurring slots"
                    );
                    SchedulerMetrics::recurring_skipped(&definition.id);
                }
                break;
            }

            let job_id = self.dispatcher.materialize(definition, slot).await?;
            let next = definition.next_after(slot)?;
            if !self.store.advance_recurring(&definition.id, slot, next).await? {
                debug!(definition_id = %definition.id, slot = %slot, "Recurring slot advanced elsewhere");
                break;
            }

            fired += 1;
            SchedulerMetrics::recurring_fired(&definition.id);
            info!(
                definition_id = %definition.id,
                job_id = %job_id,
                slot = %slot,
                "Fired recurring job"
            );

            match next {
                Some(at) if at <= now => slot = at,
                _ => break,
            }
        }

        Ok(fired as usize)
    }

    /// Runs the tick loop until [`stop`](Self::stop) is called.
    pub async fn run(&self) {
        self.run_until(self.shutdown_receiver()).await
    }

    /// Subscribes to the stop signal. A receiver taken before the loop is
    /// spawned sees a [`stop`](Self::stop) issued before the loop starts.
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Runs the tick loop until `shutdown_rx` fires.
    pub async fn run_until(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Recurring scheduler already running");
            return;
        }
        let _running = RunningGuard(&self.running);

        info!(tick_interval_ms = self.tick_interval.as_millis() as u64, "Starting recurring scheduler");

        let mut ticker = interval(self.tick_interval);

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    break;
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Failed to check recurring jobs");
                    }
                }
            }
        }

        info!("Recurring scheduler stopped");
    }

    /// Stop the scheduler.
    pub fn stop(&self) {
        info!("Stopping recurring scheduler...");
        let _ = self.shutdown_tx.send(());
    }

    /// Check if the tick loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// All recurring definitions.
    pub async fn list(&self) -> JobResult<Vec<RecurringDefinition>> {
        self.store.list_recurring().await
    }

    /// Get scheduler statistics.
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            running: self.is_running(),
            jobs_fired: self.jobs_fired.load(Ordering::Relaxed),
            last_tick: *self.last_tick.read(),
        }
    }
}

/// Clears the running flag when the loop exits, including when its task
/// is aborted.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
