//! Job records, payloads and the typed job trait.

use crate::error::{JobError, JobResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique job identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    /// Creates a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Creates a job ID from a string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Returns the job ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle state of a job.
///
/// ```text
/// create ──► Enqueued ◄──────────────┐
///   │           │ lease              │ retry / lease reaped
///   ▼           ▼                    │
/// AwaitingParent  Leased ────────────┘
///   (parent ok)   │ ack        │ give up
///                 ▼            ▼
///             Succeeded      Failed ──► Deleted (retention)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for its parent to succeed.
    AwaitingParent,
    /// Eligible for leasing once `scheduled_at` has passed.
    Enqueued,
    /// Held by a worker until acked, failed or the lease expires.
    Leased,
    /// Completed successfully.
    Succeeded,
    /// Gave up; never leased again.
    Failed,
    /// Removed by retention.
    Deleted,
}

impl JobState {
    /// Returns true for states a job never leaves on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Deleted)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::AwaitingParent => write!(f, "awaiting_parent"),
            JobState::Enqueued => write!(f, "enqueued"),
            JobState::Leased => write!(f, "leased"),
            JobState::Succeeded => write!(f, "succeeded"),
            JobState::Failed => write!(f, "failed"),
            JobState::Deleted => write!(f, "deleted"),
        }
    }
}

/// What to run: a registered job kind plus its JSON arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    /// Registered handler kind.
    pub kind: String,

    /// Handler arguments.
    pub args: serde_json::Value,
}

impl JobPayload {
    /// Creates a payload from a kind and raw arguments.
    pub fn new(kind: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            args,
        }
    }

    /// Creates a payload with no arguments.
    pub fn kind(kind: impl Into<String>) -> Self {
        Self::new(kind, serde_json::Value::Null)
    }

    /// Serializes a typed job into a payload.
    pub fn from_job<J: Job>(job: &J) -> JobResult<Self> {
        Ok(Self::new(J::KIND, serde_json::to_value(job)?))
    }

    /// Deserializes the arguments.
    pub fn decode<T: DeserializeOwned>(&self) -> JobResult<T> {
        Ok(serde_json::from_value(self.args.clone())?)
    }
}

/// Stored job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Job ID.
    pub id: JobId,

    /// Queue the job was routed to.
    pub queue: String,

    /// Work to perform.
    pub payload: JobPayload,

    /// Current state.
    pub state: JobState,

    /// Leases issued so far.
    pub attempt: u32,

    /// Attempts allowed before the job is terminally failed.
    pub max_attempts: u32,

    /// Earliest time the job may be leased.
    pub scheduled_at: DateTime<Utc>,

    /// Set while leased.
    pub lease_expires_at: Option<DateTime<Utc>>,

    /// Job this one continues.
    pub parent_id: Option<JobId>,

    /// When the job was created.
    pub created_at: DateTime<Utc>,

    /// Error from the last failed attempt.
    pub last_error: Option<String>,
}

impl JobRecord {
    /// Creates an immediately eligible record. The store decides the
    /// initial state when the record is created.
    pub fn new(payload: JobPayload, queue: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            queue: queue.into(),
            payload,
            state: JobState::Enqueued,
            attempt: 0,
            max_attempts: 1,
            scheduled_at: now,
            lease_expires_at: None,
            parent_id: None,
            created_at: now,
            last_error: None,
        }
    }

    /// Sets the earliest lease time.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = at;
        self
    }

    /// Sets the attempt budget.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Makes this job a continuation of `parent`.
    pub fn parent(mut self, parent: JobId) -> Self {
        self.parent_id = Some(parent);
        self
    }

    /// Returns true once every allowed attempt has been leased.
    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Create job context for execution.
    pub fn to_context(&self, pool_id: &str, worker_id: &str, started_at: DateTime<Utc>) -> JobContext {
        JobContext {
            job_id: self.id.clone(),
            kind: self.payload.kind.clone(),
            queue: self.queue.clone(),
            attempt: self.attempt,
            max_attempts: self.max_attempts,
            scheduled_at: self.scheduled_at,
            started_at,
            pool_id: pool_id.to_string(),
            worker_id: worker_id.to_string(),
        }
    }
}

/// Job execution context.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Job ID.
    pub job_id: JobId,

    /// Payload kind.
    pub kind: String,

    /// Queue name.
    pub queue: String,

    /// Current attempt number (1-based).
    pub attempt: u32,

    /// Maximum attempts allowed.
    pub max_attempts: u32,

    /// Job was scheduled at this time.
    pub scheduled_at: DateTime<Utc>,

    /// Job started executing at this time.
    pub started_at: DateTime<Utc>,

    /// Pool that leased the job.
    pub pool_id: String,

    /// Worker slot processing this job.
    pub worker_id: String,
}

impl JobContext {
    /// Returns true if this is the last attempt.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Returns remaining attempts.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt)
    }
}

/// Trait for typed job kinds.
///
/// # Example
///
/// ```rust,ignore
/// use meridian_jobs::{Job, JobContext, JobError};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct SendEmailJob {
///     to: String,
/// }
///
/// #[async_trait::async_trait]
/// impl Job for SendEmailJob {
///     const KIND: &'static str = "send_email";
///
///     async fn perform(&self, ctx: JobContext) -> Result<(), JobError> {
///         println!("Sending email to: {}", self.to);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Job: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique kind identifier used to look up the handler.
    const KIND: &'static str;

    /// Execute the job.
    async fn perform(&self, ctx: JobContext) -> Result<(), JobError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct TestJob {
        message: String,
    }

    #[async_trait]
    impl Job for TestJob {
        const KIND: &'static str = "test_job";

        async fn perform(&self, _ctx: JobContext) -> Result<(), JobError> {
            Ok(())
        }
    }

    #[test]
    fn test_job_id_generation() {
        let id1 = JobId::new();
        let id2 = JobId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_payload_from_job() {
        let job = TestJob {
            message: "Hello".to_string(),
        };

        let payload = JobPayload::from_job(&job).unwrap();
        assert_eq!(payload.kind, "test_job");
        assert_eq!(payload.decode::<TestJob>().unwrap(), job);
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Deleted.is_terminal());
        assert!(!JobState::Leased.is_terminal());
        assert!(!JobState::AwaitingParent.is_terminal());
    }

    #[test]
    fn test_job_context() {
        let now = Utc::now();
        let mut record = JobRecord::new(JobPayload::kind("noop"), "default", now).max_attempts(3);
        record.attempt = 1;
        let ctx = record.to_context("normal", "normal-0", now);

        assert_eq!(ctx.attempt, 1);
        assert_eq!(ctx.remaining_attempts(), 2);
        assert!(!ctx.is_last_attempt());

        record.attempt = 3;
        assert!(record.is_exhausted());
        assert!(record.to_context("normal", "normal-0", now).is_last_attempt());
    }

    #[test]
    fn test_max_attempts_floor() {
        let record = JobRecord::new(JobPayload::kind("noop"), "default", Utc::now()).max_attempts(0);
        assert_eq!(record.max_attempts, 1);
    }
}
