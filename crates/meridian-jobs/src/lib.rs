//! Meridian Jobs - Priority Background Job Dispatch
//!
//! A storage-agnostic job dispatch core with:
//! - Priority tiers mapped onto named, ranked queues
//! - Worker pools that drain their queues strictly in rank order
//! - Exclusive, time-bounded leases with reaping of expired leases
//! - Retry policies with per-attempt delays
//! - Continuations released atomically when their parent succeeds
//! - Cron-based recurring jobs with idempotent, restart-safe firing
//! - An ordered filter pipeline around every execution
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Meridian Jobs Architecture                      │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  Producer ──► Dispatcher ◄── RecurringScheduler (cron ticks)     │
//! │                   │                                              │
//! │                   ▼                                              │
//! │  ┌─────────────────────────────────────────────────────────┐    │
//! │  │                 JobStore (atomic ops)                    │    │
//! │  │  ┌──────────┐ ┌────────┐ ┌─────────┐ ┌───────┐ ┌──────┐ │    │
//! │  │  │a_realtime│ │ b_high │ │c_above_ │ │default│ │e-below│ │    │
//! │  │  └────┬─────┘ └───┬────┘ └────┬────┘ └───┬───┘ └──┬───┘ │    │
//! │  │       │  continuations (AwaitingParent)   │        │     │    │
//! │  └───────┼───────────┼───────────┼──────────┼────────┼─────┘    │
//! │          ▼           ▼           ▼          ▼        ▼          │
//! │  ┌──────────────────────┐   ┌──────────────────────────────┐    │
//! │  │  Pool "realtime"     │   │  Pool "normal"               │    │
//! │  │  slot 0 .. slot N    │   │  slot 0 .. slot N            │    │
//! │  └──────────┬───────────┘   └──────────────┬───────────────┘    │
//! │             └──────── FilterPipeline ──────┘                     │
//! │                           │                                      │
//! │                ack ◄──────┴──────► fail (retry / Failed)         │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use meridian_jobs::prelude::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct SendEmail {
//!     to: String,
//! }
//!
//! #[async_trait::async_trait]
//! impl Job for SendEmail {
//!     const KIND: &'static str = "send_email";
//!
//!     async fn perform(&self, ctx: JobContext) -> Result<(), JobError> {
//!         Ok(())
//!     }
//! }
//!
//! let server = JobServer::builder(JobsConfig::default()).build()?;
//! server.handlers().register_job::<SendEmail>();
//! server.start()?;
//!
//! let high = server.dispatcher().priority(Priority::High)?;
//! server
//!     .dispatcher()
//!     .enqueue_job(&SendEmail { to: "user@example.com".into() }, &high)
//!     .await?;
//! ```

pub mod clock;
pub mod config;
pub mod continuation;
pub mod dispatcher;
pub mod error;
pub mod filter;
pub mod handler;
pub mod job;
pub mod metrics;
pub mod queue;
pub mod reaper;
pub mod recurring;
pub mod retry;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{JobsConfig, PoolConfig};
pub use continuation::ContinuationGraph;
pub use dispatcher::Dispatcher;
pub use error::{JobError, JobResult};
pub use filter::{FilterPipeline, JobFilter, LoggingFilter};
pub use handler::{JobHandler, JobHandlers};
pub use job::{Job, JobContext, JobId, JobPayload, JobRecord, JobState};
pub use metrics::{register_metrics, JobMetrics, SchedulerMetrics, WorkerMetrics};
pub use queue::{Priority, QueueDefinition, QueueRegistry, QueueStats, Tier};
pub use reaper::LeaseReaper;
pub use recurring::{cron_expressions, RecurringDefinition};
pub use retry::{Backoff, RetryDecision, RetryPolicy};
pub use scheduler::{RecurringScheduler, SchedulerStats};
pub use server::{JobServer, JobServerBuilder};
pub use store::{InMemoryJobStore, JobStore};
pub use worker::{JobOutcome, WorkerContext, WorkerPool, WorkerPoolConfig, WorkerPoolManager, WorkerPoolStats};

/// Re-export commonly used traits
pub mod prelude {
    pub use crate::job::{Job, JobState};
    pub use crate::queue::{Priority, Tier};
    pub use crate::retry::RetryPolicy;
    pub use crate::server::JobServer;
    pub use crate::store::JobStore;
    pub use crate::{JobContext, JobError, JobId, JobPayload, JobResult, JobsConfig};
}
