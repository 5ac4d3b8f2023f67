//! Worker pools: lease, execute, settle.
//!
//! Each pool runs `concurrency` independent slots. A slot leases the next
//! eligible job from its pool's queues (highest rank first), runs it
//! through the filter pipeline, then acks it or fails it according to the
//! retry policy. A job body that blocks only stalls its own slot.

use crate::clock::{self, Clock};
use crate::config::validate_pools;
use crate::error::{JobError, JobResult};
use crate::filter::FilterPipeline;
use crate::handler::JobHandlers;
use crate::job::{JobContext, JobId, JobPayload, JobRecord};
use crate::metrics::{JobMetrics, WorkerMetrics};
use crate::queue::QueueRegistry;
use crate::reaper::LeaseReaper;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::store::JobStore;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};

/// Worker pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Pool id.
    pub id: String,

    /// Queues to poll, highest rank first.
    pub queues: Vec<String>,

    /// Number of concurrent slots.
    pub concurrency: usize,

    /// Idle wait between empty polls; zero only yields.
    pub poll_interval: Duration,

    /// Lease requested for each job.
    pub lease_duration: Duration,
}

impl WorkerPoolConfig {
    /// Creates a pool config with a 100ms poll interval and 5 minute leases.
    pub fn new(id: impl Into<String>, queues: impl IntoIterator<Item = impl Into<String>>, concurrency: usize) -> Self {
        Self {
            id: id.into(),
            queues: queues.into_iter().map(Into::into).collect(),
            concurrency,
            poll_interval: Duration::from_millis(100),
            lease_duration: Duration::from_secs(300),
        }
    }

    /// Sets the poll interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the lease duration.
    pub fn lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = duration;
        self
    }
}

/// How one leased job was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Acked; `released` are continuations made eligible by the ack.
    Succeeded { job_id: JobId, released: Vec<JobId> },
    /// Failed and re-enqueued for `retry_at`.
    Retrying { job_id: JobId, retry_at: DateTime<Utc> },
    /// Failed terminally.
    Failed { job_id: JobId, error: String },
    /// The lease expired or was taken over before the result was recorded;
    /// the result was dropped.
    LeaseLost { job_id: JobId },
}

impl JobOutcome {
    /// Id of the settled job.
    pub fn job_id(&self) -> &JobId {
        match self {
            JobOutcome::Succeeded { job_id, .. }
            | JobOutcome::Retrying { job_id, .. }
            | JobOutcome::Failed { job_id, .. }
            | JobOutcome::LeaseLost { job_id } => job_id,
        }
    }
}

/// Collaborators shared by every pool of a process.
#[derive(Clone)]
pub struct WorkerContext {
    /// Job store.
    pub store: Arc<dyn JobStore>,
    /// Registered job kinds.
    pub handlers: JobHandlers,
    /// Filters applied around every job.
    pub filters: FilterPipeline,
    /// Retry policy consulted on failure.
    pub retry: RetryPolicy,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

#[derive(Default)]
struct Counters {
    busy: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
}

/// One worker pool.
#[derive(Clone)]
pub struct WorkerPool {
    config: Arc<WorkerPoolConfig>,
    store: Arc<dyn JobStore>,
    handlers: JobHandlers,
    filters: Arc<FilterPipeline>,
    retry: Arc<RetryPolicy>,
    clock: Arc<dyn Clock>,
    counters: Arc<Counters>,
}

impl WorkerPool {
    /// Create a new worker pool. `config.queues` must already be ordered
    /// highest rank first.
    pub fn new(config: WorkerPoolConfig, context: WorkerContext) -> Self {
        Self {
            config: Arc::new(config),
            store: context.store,
            handlers: context.handlers,
            filters: Arc::new(context.filters),
            retry: Arc::new(context.retry),
            clock: context.clock,
            counters: Arc::default(),
        }
    }

    /// Get the pool ID.
    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Pool configuration.
    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Leases and settles at most one job.
    ///
    /// Returns `None` when nothing is eligible. Store errors while
    /// settling are returned; job failures never are.
    pub async fn run_once(&self, worker_id: &str) -> JobResult<Option<JobOutcome>> {
        let job = match self
            .store
            .lease_next(&self.config.queues, self.config.lease_duration)
            .await
        {
            Ok(Some(job)) => job,
            Ok(None) => return Ok(None),
            Err(JobError::LeaseConflict(reason)) => {
                debug!(pool_id = %self.config.id, reason = %reason, "Lease conflict, retrying next poll");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let started_at = self.clock.now();
        let wait = (started_at - job.scheduled_at).to_std().unwrap_or_default();
        JobMetrics::job_leased(&job.queue, &job.payload.kind, wait);

        let ctx = job.to_context(&self.config.id, worker_id, started_at);
        debug!(
            job_id = %job.id,
            queue = %job.queue,
            kind = %job.payload.kind,
            attempt = job.attempt,
            "Processing job"
        );

        let timer = Instant::now();
        let result = {
            let _busy = BusyGuard::enter(self);
            self.execute(job.payload.clone(), &ctx).await
        };
        let elapsed = timer.elapsed();

        match self.settle(&job, result, elapsed).await {
            Err(JobError::LeaseConflict(reason)) => {
                warn!(
                    job_id = %job.id,
                    attempt = job.attempt,
                    reason = %reason,
                    "Lease lost before the result was recorded, dropping it"
                );
                Ok(Some(JobOutcome::LeaseLost {
                    job_id: job.id.clone(),
                }))
            }
            other => other.map(Some),
        }
    }

    /// Runs the handler inside the filter pipeline. A panic anywhere in
    /// there, handler or filter hook, becomes an `ExecutionFailed`.
    async fn execute(&self, payload: JobPayload, ctx: &JobContext) -> Result<(), JobError> {
        let handler = self.handlers.get(&payload.kind);
        let body = async move {
            let Some(handler) = handler else {
                return Err(JobError::UnknownJobKind(payload.kind));
            };
            let call = async move { handler(payload, ctx.clone()).await };
            AssertUnwindSafe(call)
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(panicked("job", panic.as_ref())))
        };
        AssertUnwindSafe(self.filters.run(ctx, body))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(panicked("job filter", panic.as_ref())))
    }

    async fn settle(
        &self,
        job: &JobRecord,
        result: Result<(), JobError>,
        elapsed: Duration,
    ) -> JobResult<JobOutcome> {
        let error = match result {
            Ok(()) => {
                let released = self.store.ack(&job.id, job.attempt).await?;
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                JobMetrics::job_succeeded(&job.queue, &job.payload.kind, elapsed);
                JobMetrics::continuations_released(released.len());
                debug!(job_id = %job.id, released = released.len(), "Job succeeded");
                return Ok(JobOutcome::Succeeded {
                    job_id: job.id.clone(),
                    released,
                });
            }
            Err(e) => e,
        };

        let message = error.to_string();
        match self.retry.decide(job.attempt, &error) {
            RetryDecision::RetryAfter(delay) if !job.is_exhausted() => {
                let retry_at = clock::add(self.clock.now(), delay);
                self.store
                    .fail(&job.id, job.attempt, &message, Some(retry_at))
                    .await?;
                self.counters.retried.fetch_add(1, Ordering::Relaxed);
                JobMetrics::job_retried(&job.queue, &job.payload.kind, job.attempt);
                warn!(
                    job_id = %job.id,
                    attempt = job.attempt,
                    max_attempts = job.max_attempts,
                    retry_at = %retry_at,
                    error = %message,
                    "Job failed, scheduled for retry"
                );
                Ok(JobOutcome::Retrying {
                    job_id: job.id.clone(),
                    retry_at,
                })
            }
            _ => {
                self.store.fail(&job.id, job.attempt, &message, None).await?;
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                JobMetrics::job_failed(&job.queue, &job.payload.kind, elapsed);
                error!(
                    job_id = %job.id,
                    attempt = job.attempt,
                    error = %message,
                    "Job failed permanently"
                );
                Ok(JobOutcome::Failed {
                    job_id: job.id.clone(),
                    error: message,
                })
            }
        }
    }

    /// Spawns one task per slot. Slots finish their current job before
    /// honouring the shutdown signal.
    pub fn spawn_slots(&self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        (0..self.config.concurrency)
            .map(|slot| {
                let worker_id = format!("{}-{slot}", self.config.id);
                let span = tracing::info_span!("worker", pool_id = %self.config.id, worker_id = %worker_id);
                tokio::spawn(self.clone().run_slot(worker_id, shutdown.subscribe()).instrument(span))
            })
            .collect()
    }

    async fn run_slot(self, worker_id: String, mut shutdown: broadcast::Receiver<()>) {
        debug!(queues = ?self.config.queues, "Worker slot started");

        loop {
            if !matches!(shutdown.try_recv(), Err(TryRecvError::Empty)) {
                break;
            }

            let idle = match self.run_once(&worker_id).await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    error!(error = %e, "Failed to process job");
                    true
                }
            };

            if idle {
                if self.config.poll_interval.is_zero() {
                    tokio::task::yield_now().await;
                } else {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = shutdown.recv() => break,
                    }
                }
            }
        }

        debug!("Worker slot stopped");
    }

    /// Get pool statistics.
    pub fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            id: self.config.id.clone(),
            concurrency: self.config.concurrency,
            busy: self.counters.busy.load(Ordering::Relaxed),
            jobs_succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            jobs_retried: self.counters.retried.load(Ordering::Relaxed),
            jobs_failed: self.counters.failed.load(Ordering::Relaxed),
            queues: self.config.queues.clone(),
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("filters", &self.filters)
            .finish_non_exhaustive()
    }
}

/// Counts a slot as busy until dropped, unwinding included.
struct BusyGuard<'a> {
    pool: &'a WorkerPool,
}

impl<'a> BusyGuard<'a> {
    fn enter(pool: &'a WorkerPool) -> Self {
        let busy = pool.counters.busy.fetch_add(1, Ordering::Relaxed) + 1;
        WorkerMetrics::update_workers(&pool.config.id, busy, pool.config.concurrency);
        Self { pool }
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let busy = self
            .pool
            .counters
            .busy
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1);
        WorkerMetrics::update_workers(&self.pool.config.id, busy, self.pool.config.concurrency);
    }
}

fn panicked(what: &str, panic: &(dyn Any + Send)) -> JobError {
    let message = panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic");
    JobError::ExecutionFailed(format!("{what} panicked: {message}"))
}

/// Worker pool statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolStats {
    /// Pool ID.
    pub id: String,

    /// Configured concurrency.
    pub concurrency: usize,

    /// Slots currently executing a job.
    pub busy: u64,

    /// Jobs acked.
    pub jobs_succeeded: u64,

    /// Failed attempts re-enqueued.
    pub jobs_retried: u64,

    /// Jobs failed terminally.
    pub jobs_failed: u64,

    /// Queues being processed, highest rank first.
    pub queues: Vec<String>,
}

/// Runs every configured pool plus the lease reaper.
pub struct WorkerPoolManager {
    pools: Vec<WorkerPool>,
    reaper: Option<LeaseReaper>,
    shutdown_timeout: Duration,
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl WorkerPoolManager {
    /// Validates the pool layout against the registry and builds the
    /// pools. Each pool's queues are ordered by rank here.
    pub fn new(
        registry: &QueueRegistry,
        pools: Vec<WorkerPoolConfig>,
        context: WorkerContext,
    ) -> JobResult<Self> {
        validate_pools(&pools, registry)?;

        let pools = pools
            .into_iter()
            .map(|mut config| -> JobResult<WorkerPool> {
                config.queues = registry.order_by_rank(&config.queues)?;
                Ok(WorkerPool::new(config, context.clone()))
            })
            .collect::<JobResult<Vec<_>>>()?;

        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            pools,
            reaper: None,
            shutdown_timeout: Duration::from_secs(30),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }

    /// Runs `reaper` alongside the pools.
    pub fn with_reaper(mut self, reaper: LeaseReaper) -> Self {
        self.reaper = Some(reaper);
        self
    }

    /// How long `shutdown` waits for in-flight jobs.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Spawns every slot and the reaper.
    pub fn start(&self) -> JobResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(JobError::invalid_state("stopped", "running"));
        }

        let mut handles = self.handles.lock();
        for pool in &self.pools {
            info!(
                pool_id = %pool.id(),
                concurrency = pool.config().concurrency,
                queues = ?pool.config().queues,
                "Starting worker pool"
            );
            handles.extend(pool.spawn_slots(&self.shutdown_tx));
        }
        if let Some(reaper) = &self.reaper {
            handles.push(reaper.clone().spawn(self.shutdown_tx.subscribe()));
        }

        info!(pools = self.pools.len(), tasks = handles.len(), "Worker pools started");
        Ok(())
    }

    /// Signals every slot to stop and waits up to the shutdown timeout.
    /// Slots still running a job after that are aborted; their leases
    /// expire and the jobs are re-leased later.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping worker pools...");
        let _ = self.shutdown_tx.send(());

        let mut handles = std::mem::take(&mut *self.handles.lock());
        let joined = timeout(
            self.shutdown_timeout,
            futures::future::join_all(handles.iter_mut()),
        )
        .await;

        if joined.is_err() {
            warn!(
                timeout_secs = self.shutdown_timeout.as_secs(),
                "Worker pools did not stop in time, aborting remaining slots"
            );
            for handle in &handles {
                handle.abort();
            }
        }

        for pool in &self.pools {
            let stats = pool.stats();
            info!(
                pool_id = %stats.id,
                succeeded = stats.jobs_succeeded,
                retried = stats.jobs_retried,
                failed = stats.jobs_failed,
                "Worker pool stopped"
            );
        }
    }

    /// Check if the pools are running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Managed pools.
    pub fn pools(&self) -> &[WorkerPool] {
        &self.pools
    }

    /// Looks up a pool by id.
    pub fn pool(&self, id: &str) -> Option<&WorkerPool> {
        self.pools.iter().find(|pool| pool.id() == id)
    }

    /// Statistics for every pool.
    pub fn stats(&self) -> Vec<WorkerPoolStats> {
        self.pools.iter().map(WorkerPool::stats).collect()
    }
}
