//! Process-level composition of the dispatch core.

use crate::clock::{Clock, SystemClock};
use crate::config::JobsConfig;
use crate::dispatcher::Dispatcher;
use crate::error::JobResult;
use crate::filter::{FilterPipeline, JobFilter};
use crate::handler::JobHandlers;
use crate::queue::QueueRegistry;
use crate::reaper::LeaseReaper;
use crate::retry::RetryPolicy;
use crate::scheduler::RecurringScheduler;
use crate::store::{InMemoryJobStore, JobStore};
use crate::worker::{WorkerContext, WorkerPoolManager, WorkerPoolStats};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

/// Builder for [`JobServer`].
pub struct JobServerBuilder {
    config: JobsConfig,
    store: Option<Arc<dyn JobStore>>,
    clock: Option<Arc<dyn Clock>>,
    handlers: JobHandlers,
    filters: FilterPipeline,
}

impl JobServerBuilder {
    /// Uses `store` instead of a fresh in-memory store.
    pub fn store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Uses `clock` instead of the wall clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Uses an existing handler table.
    pub fn handlers(mut self, handlers: JobHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    /// Replaces the filter chain.
    pub fn filters(mut self, filters: FilterPipeline) -> Self {
        self.filters = filters;
        self
    }

    /// Appends a filter to the chain.
    pub fn filter(mut self, filter: Arc<dyn JobFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    /// Validates the configuration and wires every component.
    pub fn build(self) -> JobResult<JobServer> {
        self.config.validate()?;

        let registry = Arc::new(self.config.queue_registry()?);
        let pools = self.config.pool_configs(&registry)?;
        let retry = RetryPolicy::from(&self.config.retry);
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryJobStore::with_clock(clock.clone())));

        let dispatcher = Dispatcher::new(
            store.clone(),
            registry.clone(),
            clock.clone(),
            retry.max_attempts,
        );

        let manager = WorkerPoolManager::new(
            &registry,
            pools,
            WorkerContext {
                store: store.clone(),
                handlers: self.handlers.clone(),
                filters: self.filters,
                retry,
                clock: clock.clone(),
            },
        )?
        .with_reaper(LeaseReaper::new(store.clone(), self.config.lease.reap_interval()))
        .with_shutdown_timeout(self.config.worker.shutdown_timeout());

        let scheduler = self.config.scheduler.enabled.then(|| {
            Arc::new(RecurringScheduler::new(
                store.clone(),
                dispatcher.clone(),
                clock,
                &self.config.scheduler,
            ))
        });

        Ok(JobServer {
            config: self.config,
            registry,
            store,
            dispatcher,
            handlers: self.handlers,
            manager,
            scheduler,
            scheduler_handle: Mutex::new(None),
        })
    }
}

/// Registry, store, dispatcher, worker pools and recurring scheduler for
/// one process.
pub struct JobServer {
    config: JobsConfig,
    registry: Arc<QueueRegistry>,
    store: Arc<dyn JobStore>,
    dispatcher: Dispatcher,
    handlers: JobHandlers,
    manager: WorkerPoolManager,
    scheduler: Option<Arc<RecurringScheduler>>,
    scheduler_handle: Mutex<Option<JoinHandle<()>>>,
}

impl JobServer {
    /// Starts a builder from configuration.
    pub fn builder(config: JobsConfig) -> JobServerBuilder {
        JobServerBuilder {
            config,
            store: None,
            clock: None,
            handlers: JobHandlers::new(),
            filters: FilterPipeline::default_chain(),
        }
    }

    /// Starts the worker pools, the lease reaper and the recurring
    /// scheduler.
    pub fn start(&self) -> JobResult<()> {
        self.manager.start()?;

        if let Some(scheduler) = &self.scheduler {
            let scheduler = scheduler.clone();
            let shutdown_rx = scheduler.shutdown_receiver();
            let handle = tokio::spawn(async move { scheduler.run_until(shutdown_rx).await });
            *self.scheduler_handle.lock() = Some(handle);
        }

        info!(
            queues = ?self.registry.queue_names().collect::<Vec<_>>(),
            pools = self.manager.pools().len(),
            job_kinds = ?self.handlers.kinds(),
            scheduler = self.scheduler.is_some(),
            "Job server started"
        );
        Ok(())
    }

    /// Stops the scheduler, then drains the worker pools.
    pub async fn shutdown(&self) {
        if let Some(scheduler) = &self.scheduler {
            scheduler.stop();
        }
        let handle = self.scheduler_handle.lock().take();
        if let Some(mut handle) = handle {
            if timeout(self.config.worker.shutdown_timeout(), &mut handle).await.is_err() {
                warn!("Recurring scheduler did not stop in time, aborting it");
                handle.abort();
            }
        }

        self.manager.shutdown().await;
        info!("Job server stopped");
    }

    /// Producer API.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Handler table; kinds may be registered after start.
    pub fn handlers(&self) -> &JobHandlers {
        &self.handlers
    }

    /// Job store.
    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Queue registry.
    pub fn registry(&self) -> &QueueRegistry {
        &self.registry
    }

    /// Worker pools.
    pub fn manager(&self) -> &WorkerPoolManager {
        &self.manager
    }

    /// Recurring scheduler, if enabled.
    pub fn scheduler(&self) -> Option<&RecurringScheduler> {
        self.scheduler.as_deref()
    }

    /// Effective configuration.
    pub fn config(&self) -> &JobsConfig {
        &self.config
    }

    /// Per-pool statistics.
    pub fn stats(&self) -> Vec<WorkerPoolStats> {
        self.manager.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::error::JobError;
    use crate::job::{JobPayload, JobState};
    use crate::queue::Priority;
    use std::time::Duration;

    fn fast_config() -> JobsConfig {
        let mut config = JobsConfig::default();
        for pool in &mut config.pools {
            pool.poll_interval_ms = Some(5);
        }
        config.worker.shutdown_timeout_secs = 2;
        config
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let mut config = JobsConfig::default();
        config.pools = vec![PoolConfig::new("only", ["default".to_string()], 1)];
        assert!(matches!(
            JobServer::builder(config).build(),
            Err(JobError::Configuration(_))
        ));
    }

    #[test]
    fn test_build_defaults() {
        let server = JobServer::builder(JobsConfig::default()).build().unwrap();
        assert_eq!(server.manager().pools().len(), 2);
        assert!(server.scheduler().is_some());
        assert_eq!(server.registry().queue_names().count(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_run_shutdown() {
        let server = JobServer::builder(fast_config()).build().unwrap();
        server.handlers().register_fn("noop", |_, _| async { Ok(()) });
        server.start().unwrap();

        let tier = server.dispatcher().priority(Priority::RealTime).unwrap();
        let id = server
            .dispatcher()
            .enqueue(JobPayload::kind("noop"), &tier)
            .await
            .unwrap();

        for _ in 0..200 {
            let job = server.dispatcher().get_job(&id).await.unwrap().unwrap();
            if job.state == JobState::Succeeded {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        server.shutdown().await;
        let job = server.dispatcher().get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(server.stats().iter().map(|s| s.jobs_succeeded).sum::<u64>(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_immediate_shutdown_stops_scheduler() {
        let mut config = JobsConfig::default();
        config.worker.shutdown_timeout_secs = 1;
        let server = JobServer::builder(config).build().unwrap();

        server.start().unwrap();
        server.shutdown().await;

        let scheduler = server.scheduler().unwrap();
        assert!(!scheduler.is_running());
        assert!(server.scheduler_handle.lock().is_none());
    }
}
