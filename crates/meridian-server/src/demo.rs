//! Demo job kinds and the jobs seeded at startup.
//!
//! Selected with `MERIDIAN_DEMO`:
//! - `priority` (default): ten sleeping jobs spread over the five queues
//! - `all`: the priority demo plus fire-and-forget, delayed, recurring,
//!   continuation and always-failing jobs
//! - `none`: nothing is seeded

use async_trait::async_trait;
use meridian_jobs::{
    cron_expressions, Dispatcher, Job, JobContext, JobError, JobHandlers, JobPayload, JobResult, Priority,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// Environment variable selecting the demo.
pub const DEMO_VAR: &str = "MERIDIAN_DEMO";

/// Environment variable overriding how long priority demo jobs sleep.
pub const DEMO_SLEEP_VAR: &str = "MERIDIAN_DEMO_SLEEP_MS";

const DEFAULT_SLEEP_MS: u64 = 20_000;

/// Which demo jobs to seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DemoMode {
    /// Priority demo only.
    #[default]
    Priority,
    /// Every demo scenario.
    All,
    /// Seed nothing.
    None,
}

impl FromStr for DemoMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "priority" | "" => Ok(Self::Priority),
            "all" => Ok(Self::All),
            "none" | "off" => Ok(Self::None),
            other => Err(format!("unknown demo '{other}' (expected priority, all or none)")),
        }
    }
}

impl fmt::Display for DemoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Priority => write!(f, "priority"),
            Self::All => write!(f, "all"),
            Self::None => write!(f, "none"),
        }
    }
}

/// Prints a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrintMessage {
    pub message: String,
}

#[async_trait]
impl Job for PrintMessage {
    const KIND: &'static str = "demo.print";

    async fn perform(&self, ctx: JobContext) -> Result<(), JobError> {
        info!(job_id = %ctx.job_id, "{}", self.message);
        Ok(())
    }
}

/// Reports whether a random number came out even or odd.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoinFlip;

#[async_trait]
impl Job for CoinFlip {
    const KIND: &'static str = "demo.coin_flip";

    async fn perform(&self, ctx: JobContext) -> Result<(), JobError> {
        let even = Uuid::new_v4().as_bytes()[0] % 2 == 0;
        info!(
            job_id = %ctx.job_id,
            "Recurring job drew an {} number",
            if even { "even" } else { "odd" }
        );
        Ok(())
    }
}

/// Always fails, to show retries and the terminal `Failed` state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlwaysFails;

#[async_trait]
impl Job for AlwaysFails {
    const KIND: &'static str = "demo.fail";

    async fn perform(&self, _ctx: JobContext) -> Result<(), JobError> {
        Err(JobError::ExecutionFailed("this job always fails".to_string()))
    }
}

/// Blocks its worker slot for a while; used to watch queue priority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrioritySleep {
    pub tier: String,
    pub sleep_ms: u64,
}

impl PrioritySleep {
    /// Kind of the blocking handler.
    pub const KIND: &'static str = "demo.priority_sleep";
}

/// Registers every demo job kind.
pub fn register(handlers: &JobHandlers) {
    handlers.register_job::<PrintMessage>();
    handlers.register_job::<CoinFlip>();
    handlers.register_job::<AlwaysFails>();
    handlers.register_blocking(PrioritySleep::KIND, |payload, ctx| {
        let job: PrioritySleep = payload.decode()?;
        info!(job_id = %ctx.job_id, tier = %job.tier, worker_id = %ctx.worker_id, "Start");
        std::thread::sleep(Duration::from_millis(job.sleep_ms));
        info!(job_id = %ctx.job_id, tier = %job.tier, worker_id = %ctx.worker_id, "End");
        Ok(())
    });
}

/// Reads the sleep override, falling back to 20 seconds.
pub fn sleep_ms_from_env() -> u64 {
    std::env::var(DEMO_SLEEP_VAR)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_SLEEP_MS)
}

/// Seeds the selected demo. Returns how many jobs were created.
pub async fn seed(dispatcher: &Dispatcher, mode: DemoMode, sleep_ms: u64) -> JobResult<usize> {
    let created = match mode {
        DemoMode::None => 0,
        DemoMode::Priority => seed_priority(dispatcher, sleep_ms).await?,
        DemoMode::All => {
            seed_basics(dispatcher).await? + seed_priority(dispatcher, sleep_ms).await?
        }
    };
    info!(demo = %mode, jobs = created, "Seeded demo jobs");
    Ok(created)
}

/// One normal, one below-normal, four above-normal, two high and two
/// real-time jobs, enqueued lowest priority first.
async fn seed_priority(dispatcher: &Dispatcher, sleep_ms: u64) -> JobResult<usize> {
    let plan = [
        (Priority::Normal, 1),
        (Priority::BelowNormal, 1),
        (Priority::AboveNormal, 4),
        (Priority::High, 2),
        (Priority::RealTime, 2),
    ];

    let mut created = 0;
    for (priority, count) in plan {
        let tier = dispatcher.priority(priority)?;
        for _ in 0..count {
            let payload = JobPayload::new(
                PrioritySleep::KIND,
                serde_json::to_value(PrioritySleep {
                    tier: priority.label().to_string(),
                    sleep_ms,
                })?,
            );
            let id = dispatcher.enqueue(payload, &tier).await?;
            info!(job_id = %id, queue = %tier.queue(), "Enqueued priority demo job");
            created += 1;
        }
    }
    Ok(created)
}

async fn seed_basics(dispatcher: &Dispatcher) -> JobResult<usize> {
    let normal = dispatcher.priority(Priority::Normal)?;

    dispatcher
        .enqueue_job(
            &PrintMessage {
                message: "Fire-and-forget job".to_string(),
            },
            &normal,
        )
        .await?;

    dispatcher
        .schedule(
            JobPayload::from_job(&PrintMessage {
                message: "Delayed job, run two minutes after startup".to_string(),
            })?,
            &normal,
            Duration::from_secs(120),
        )
        .await?;

    dispatcher
        .add_recurring(
            "demo.recurring",
            cron_expressions::MINUTELY,
            JobPayload::from_job(&CoinFlip)?,
            &normal,
        )
        .await?;

    let parent = dispatcher
        .enqueue_job(
            &PrintMessage {
                message: "Parent job".to_string(),
            },
            &normal,
        )
        .await?;
    dispatcher
        .continue_with(
            &parent,
            JobPayload::from_job(&PrintMessage {
                message: format!("Child job, continuation of {parent}"),
            })?,
            &normal,
        )
        .await?;

    dispatcher.enqueue_job(&AlwaysFails, &normal).await?;

    Ok(5)
}
