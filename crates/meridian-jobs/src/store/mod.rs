//! Job store contract.
//!
//! The store is the single source of truth for job state. Every mutation
//! the core performs goes through one of these operations, and each of
//! them is atomic: a concrete backend (relational, key-value, in-memory)
//! runs it as one transaction or under single-writer arbitration.

mod memory;

pub use memory::InMemoryJobStore;

use crate::error::JobResult;
use crate::job::{JobId, JobRecord};
use crate::queue::QueueStats;
use crate::recurring::RecurringDefinition;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Durable, transactional storage for job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persists a new job and returns its id.
    ///
    /// Jobs without a parent start `Enqueued`. A job with `parent_id` starts
    /// `AwaitingParent`, or `Enqueued` if the parent has already succeeded;
    /// the parent check and the child insert happen atomically. Fails with
    /// `DuplicateId` on id collision and `NotFound` for a missing parent.
    async fn create(&self, job: JobRecord) -> JobResult<JobId>;

    /// Creates the job for one recurring slot, or returns the id created
    /// earlier for the same `(definition_id, slot)`.
    async fn create_recurring_instance(
        &self,
        definition_id: &str,
        slot: DateTime<Utc>,
        job: JobRecord,
    ) -> JobResult<JobId>;

    /// Leases the eligible job with the smallest `scheduled_at` from the
    /// first non-empty queue in `queues` (ordered highest rank first).
    /// Increments `attempt`. Concurrent callers never receive the same job.
    async fn lease_next(&self, queues: &[String], lease_duration: Duration) -> JobResult<Option<JobRecord>>;

    /// Marks a leased job `Succeeded` and releases its continuations before
    /// returning. Returns the released child ids.
    ///
    /// `attempt` is the attempt number handed out by `lease_next` and fences
    /// the settle: once that lease has been reaped or superseded by a newer
    /// one, the call fails with `LeaseConflict` and changes nothing.
    async fn ack(&self, job_id: &JobId, attempt: u32) -> JobResult<Vec<JobId>>;

    /// Records a failed attempt. With `retry_at` the job returns to
    /// `Enqueued` at that time, otherwise it becomes terminally `Failed`.
    /// Fenced by `attempt` like [`ack`](Self::ack).
    async fn fail(
        &self,
        job_id: &JobId,
        attempt: u32,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> JobResult<()>;

    /// Returns leased jobs whose lease has expired to `Enqueued` (or
    /// `Failed` if they have no attempts left). Returns how many were
    /// touched.
    async fn reap_expired_leases(&self) -> JobResult<u64>;

    /// Attaches an existing, not yet leased job under `parent_id`.
    /// Rejects links that would close a cycle with `CyclicContinuation`.
    async fn link_child(&self, parent_id: &JobId, child_id: &JobId) -> JobResult<()>;

    /// Releases every child waiting on a succeeded parent. Idempotent.
    async fn on_parent_succeeded(&self, parent_id: &JobId) -> JobResult<Vec<JobId>>;

    /// Retention: moves a terminal job to `Deleted`.
    async fn delete(&self, job_id: &JobId) -> JobResult<()>;

    /// Fetches a job.
    async fn get(&self, job_id: &JobId) -> JobResult<Option<JobRecord>>;

    /// Direct continuations of a job.
    async fn children(&self, parent_id: &JobId) -> JobResult<Vec<JobId>>;

    /// Per-queue counts for inspection.
    async fn queue_stats(&self, queue: &str) -> JobResult<QueueStats>;

    /// Inserts or replaces a recurring definition.
    async fn save_recurring(&self, definition: RecurringDefinition) -> JobResult<()>;

    /// Fetches a recurring definition.
    async fn get_recurring(&self, id: &str) -> JobResult<Option<RecurringDefinition>>;

    /// Removes a recurring definition. Returns false if it did not exist.
    async fn remove_recurring(&self, id: &str) -> JobResult<bool>;

    /// All recurring definitions.
    async fn list_recurring(&self) -> JobResult<Vec<RecurringDefinition>>;

    /// Definitions with `next_fire_at <= now`.
    async fn due_recurring(&self, now: DateTime<Utc>) -> JobResult<Vec<RecurringDefinition>>;

    /// Moves `next_fire_at` from `fired_slot` to `next`. Returns false if
    /// the definition is gone or another ticker already advanced it.
    async fn advance_recurring(
        &self,
        id: &str,
        fired_slot: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
    ) -> JobResult<bool>;
}
