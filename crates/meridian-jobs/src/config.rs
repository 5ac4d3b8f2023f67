//! Job dispatch configuration.

use crate::error::{JobError, JobResult};
use crate::queue::{Priority, QueueDefinition, QueueRegistry};
use crate::worker::WorkerPoolConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Configuration for the job dispatch core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Registered queues.
    #[serde(default = "default_queues")]
    pub queues: Vec<QueueDefinition>,

    /// Worker pools and the queues they serve.
    #[serde(default = "default_pools")]
    pub pools: Vec<PoolConfig>,

    /// Retry policy applied to every job.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Lease duration and reaping.
    #[serde(default)]
    pub lease: LeaseConfig,

    /// Worker slot defaults.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Recurring scheduler configuration.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            queues: default_queues(),
            pools: default_pools(),
            retry: RetryConfig::default(),
            lease: LeaseConfig::default(),
            worker: WorkerConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

fn default_queues() -> Vec<QueueDefinition> {
    Priority::ALL.into_iter().map(QueueDefinition::from).collect()
}

fn default_pools() -> Vec<PoolConfig> {
    vec![
        PoolConfig::new(
            "realtime",
            [Priority::RealTime, Priority::High].map(|p| p.default_queue().to_string()),
            1,
        ),
        PoolConfig::new(
            "normal",
            [Priority::AboveNormal, Priority::Normal, Priority::BelowNormal]
                .map(|p| p.default_queue().to_string()),
            1,
        ),
    ]
}

impl JobsConfig {
    /// Builds the queue registry.
    pub fn queue_registry(&self) -> JobResult<QueueRegistry> {
        QueueRegistry::new(self.queues.iter().cloned())
    }

    /// Resolves pool settings against the registry: queues ordered by
    /// rank, poll interval and lease duration filled from the defaults.
    pub fn pool_configs(&self, registry: &QueueRegistry) -> JobResult<Vec<WorkerPoolConfig>> {
        self.pools
            .iter()
            .map(|pool| -> JobResult<WorkerPoolConfig> {
                Ok(WorkerPoolConfig {
                    id: pool.id.clone(),
                    queues: registry.order_by_rank(&pool.queues)?,
                    concurrency: pool.concurrency,
                    poll_interval: pool
                        .poll_interval_ms
                        .map_or_else(|| self.worker.poll_interval(), Duration::from_millis),
                    lease_duration: self.lease.duration(),
                })
            })
            .collect()
    }

    /// Validates queues, pools and the scheduler settings.
    pub fn validate(&self) -> JobResult<()> {
        let registry = self.queue_registry()?;
        validate_pools(&self.pool_configs(&registry)?, &registry)?;

        if self.retry.max_attempts == 0 {
            return Err(JobError::Configuration(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.lease.duration_secs == 0 {
            return Err(JobError::Configuration(
                "lease.duration_secs must be greater than 0".to_string(),
            ));
        }
        if self.lease.reap_interval_secs == 0 {
            return Err(JobError::Configuration(
                "lease.reap_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.worker.shutdown_timeout_secs == 0 {
            return Err(JobError::Configuration(
                "worker.shutdown_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.scheduler.enabled && self.scheduler.tick_interval_secs == 0 {
            return Err(JobError::Configuration(
                "scheduler.tick_interval_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Checks pool ids, concurrency and that every registered queue is served.
pub fn validate_pools(pools: &[WorkerPoolConfig], registry: &QueueRegistry) -> JobResult<()> {
    if pools.is_empty() {
        return Err(JobError::Configuration(
            "at least one worker pool is required".to_string(),
        ));
    }

    let mut ids = HashSet::new();
    let mut covered = HashSet::new();
    for pool in pools {
        if pool.id.trim().is_empty() {
            return Err(JobError::Configuration("worker pool id cannot be empty".to_string()));
        }
        if !ids.insert(pool.id.as_str()) {
            return Err(JobError::Configuration(format!(
                "duplicate worker pool id: {}",
                pool.id
            )));
        }
        if pool.concurrency == 0 {
            return Err(JobError::Configuration(format!(
                "worker pool {} must have concurrency greater than 0",
                pool.id
            )));
        }
        if pool.queues.is_empty() {
            return Err(JobError::Configuration(format!(
                "worker pool {} serves no queues",
                pool.id
            )));
        }
        for queue in &pool.queues {
            if !registry.contains(queue) {
                return Err(JobError::Configuration(format!(
                    "worker pool {} references unknown queue: {queue}",
                    pool.id
                )));
            }
            covered.insert(queue.as_str());
        }
    }

    let uncovered: Vec<&str> = registry
        .queue_names()
        .filter(|queue| !covered.contains(queue))
        .collect();
    if !uncovered.is_empty() {
        return Err(JobError::Configuration(format!(
            "queues not served by any worker pool: {}",
            uncovered.join(", ")
        )));
    }
    Ok(())
}

/// A worker pool: which queues it polls and how many slots it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Pool id.
    pub id: String,

    /// Queue names served by the pool; ordered by rank at startup.
    pub queues: Vec<String>,

    /// Concurrent execution slots.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Overrides `worker.poll_interval_ms` for this pool.
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
}

impl PoolConfig {
    /// Creates a pool entry using the worker poll interval.
    pub fn new(id: impl Into<String>, queues: impl IntoIterator<Item = String>, concurrency: usize) -> Self {
        Self {
            id: id.into(),
            queues: queues.into_iter().collect(),
            concurrency,
            poll_interval_ms: None,
        }
    }
}

fn default_concurrency() -> usize {
    1
}

/// Retry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts allowed, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before each retry in seconds; the last entry repeats.
    #[serde(default = "default_delays")]
    pub delays_secs: Vec<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delays_secs: default_delays(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_delays() -> Vec<u64> {
    vec![300]
}

/// Lease configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// How long a leased job stays invisible to other workers.
    #[serde(default = "default_lease_duration")]
    pub duration_secs: u64,

    /// How often expired leases are reaped.
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            duration_secs: default_lease_duration(),
            reap_interval_secs: default_reap_interval(),
        }
    }
}

fn default_lease_duration() -> u64 {
    300 // 5 minutes
}

fn default_reap_interval() -> u64 {
    30
}

impl LeaseConfig {
    /// Returns lease duration as Duration.
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    /// Returns reap interval as Duration.
    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

/// Worker slot defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Polling interval in milliseconds when no job is eligible.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

fn default_poll_interval() -> u64 {
    100 // 100ms
}

fn default_shutdown_timeout() -> u64 {
    30
}

impl WorkerConfig {
    /// Returns poll interval as Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Returns shutdown timeout as Duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Recurring scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Enable the recurring scheduler.
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,

    /// Tick interval in seconds.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    /// Missed slots materialized per definition and tick before the rest
    /// are skipped.
    #[serde(default = "default_max_catch_up")]
    pub max_catch_up: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            tick_interval_secs: default_tick_interval(),
            max_catch_up: default_max_catch_up(),
        }
    }
}

fn default_scheduler_enabled() -> bool {
    true
}

fn default_tick_interval() -> u64 {
    1
}

fn default_max_catch_up() -> u32 {
    10
}

impl SchedulerConfig {
    /// Returns tick interval as Duration.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}
