//! Shared fixtures for dispatch integration tests.

use chrono::{DateTime, TimeZone, Utc};
use meridian_jobs::{
    Dispatcher, FilterPipeline, InMemoryJobStore, JobHandlers, ManualClock, QueueRegistry, RetryPolicy,
    WorkerContext,
};
use std::sync::Arc;

/// Fixed start of simulated time.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// In-memory store, dispatcher and handler table on a manual clock.
pub struct TestSystem {
    pub clock: Arc<ManualClock>,
    pub store: Arc<InMemoryJobStore>,
    pub registry: Arc<QueueRegistry>,
    pub dispatcher: Dispatcher,
    pub handlers: JobHandlers,
}

impl TestSystem {
    /// Creates a system whose jobs get `max_attempts` attempts.
    pub fn new(max_attempts: u32) -> Self {
        let clock = Arc::new(ManualClock::new(t0()));
        let store = Arc::new(InMemoryJobStore::with_clock(clock.clone()));
        let registry = Arc::new(QueueRegistry::standard());
        let dispatcher = Dispatcher::new(store.clone(), registry.clone(), clock.clone(), max_attempts);

        Self {
            clock,
            store,
            registry,
            dispatcher,
            handlers: JobHandlers::new(),
        }
    }

    /// Worker collaborators using this system's store and clock.
    pub fn worker_context(&self, retry: RetryPolicy) -> WorkerContext {
        WorkerContext {
            store: self.store.clone(),
            handlers: self.handlers.clone(),
            filters: FilterPipeline::default_chain(),
            retry,
            clock: self.clock.clone(),
        }
    }
}
