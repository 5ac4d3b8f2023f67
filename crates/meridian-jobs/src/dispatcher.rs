//! Producer-facing API: create, schedule and chain jobs.

use crate::clock::{self, Clock};
use crate::error::{JobError, JobResult};
use crate::job::{Job, JobId, JobPayload, JobRecord};
use crate::metrics::JobMetrics;
use crate::queue::{Priority, QueueRegistry, QueueStats, Tier};
use crate::recurring::RecurringDefinition;
use crate::store::JobStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Creates jobs in the store.
///
/// Routing goes through [`Tier`] handles resolved from the registry at
/// startup, so dispatch never fails on an unknown tier. Every job gets the
/// configured attempt budget.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    registry: Arc<QueueRegistry>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
}

impl Dispatcher {
    /// Creates a dispatcher.
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<QueueRegistry>,
        clock: Arc<dyn Clock>,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Resolves a tier label. Call at startup and keep the handle.
    pub fn tier(&self, label: &str) -> JobResult<Tier> {
        self.registry.tier(label)
    }

    /// Resolves a built-in priority tier.
    pub fn priority(&self, priority: Priority) -> JobResult<Tier> {
        self.registry.priority(priority)
    }

    /// Queue registry.
    pub fn registry(&self) -> &QueueRegistry {
        &self.registry
    }

    fn record(&self, payload: JobPayload, tier: &Tier) -> JobRecord {
        JobRecord::new(payload, tier.queue(), self.clock.now()).max_attempts(self.max_attempts)
    }

    async fn create(&self, record: JobRecord) -> JobResult<JobId> {
        let queue = record.queue.clone();
        let kind = record.payload.kind.clone();
        let scheduled_at = record.scheduled_at;
        let id = self.store.create(record).await?;
        JobMetrics::job_enqueued(&queue, &kind);
        debug!(job_id = %id, queue = %queue, kind = %kind, scheduled_at = %scheduled_at, "Dispatched job");
        Ok(id)
    }

    /// Fire-and-forget: eligible immediately.
    pub async fn enqueue(&self, payload: JobPayload, tier: &Tier) -> JobResult<JobId> {
        self.create(self.record(payload, tier)).await
    }

    /// Serializes and enqueues a typed job.
    pub async fn enqueue_job<J: Job>(&self, job: &J, tier: &Tier) -> JobResult<JobId> {
        self.enqueue(JobPayload::from_job(job)?, tier).await
    }

    /// Delayed job: eligible after `delay`.
    pub async fn schedule(&self, payload: JobPayload, tier: &Tier, delay: Duration) -> JobResult<JobId> {
        let at = clock::add(self.clock.now(), delay);
        self.schedule_at(payload, tier, at).await
    }

    /// Delayed job: eligible at `at`.
    pub async fn schedule_at(
        &self,
        payload: JobPayload,
        tier: &Tier,
        at: DateTime<Utc>,
    ) -> JobResult<JobId> {
        self.create(self.record(payload, tier).scheduled_at(at)).await
    }

    /// Continuation: runs after `parent_id` succeeds, or immediately if it
    /// already has.
    pub async fn continue_with(
        &self,
        parent_id: &JobId,
        payload: JobPayload,
        tier: &Tier,
    ) -> JobResult<JobId> {
        self.create(self.record(payload, tier).parent(parent_id.clone()))
            .await
    }

    /// Gates an existing, not yet leased job on `parent_id`.
    pub async fn attach_continuation(&self, parent_id: &JobId, child_id: &JobId) -> JobResult<()> {
        self.store.link_child(parent_id, child_id).await?;
        debug!(parent_id = %parent_id, child_id = %child_id, "Attached continuation");
        Ok(())
    }

    /// Creates or replaces a recurring definition evaluated in UTC.
    pub async fn add_recurring(
        &self,
        id: &str,
        cron: &str,
        payload: JobPayload,
        tier: &Tier,
    ) -> JobResult<RecurringDefinition> {
        self.add_recurring_with_offset(id, cron, payload, tier, 0).await
    }

    /// Creates or replaces a recurring definition evaluated at a fixed UTC
    /// offset. The cadence restarts from now.
    pub async fn add_recurring_with_offset(
        &self,
        id: &str,
        cron: &str,
        payload: JobPayload,
        tier: &Tier,
        utc_offset_secs: i32,
    ) -> JobResult<RecurringDefinition> {
        let definition = RecurringDefinition::new(
            id,
            cron,
            payload,
            tier.queue(),
            utc_offset_secs,
            self.clock.now(),
        )?;
        self.store.save_recurring(definition.clone()).await?;
        info!(
            definition_id = %id,
            cron = %cron,
            queue = %tier.queue(),
            next_fire_at = ?definition.next_fire_at,
            "Registered recurring job"
        );
        Ok(definition)
    }

    /// Removes a recurring definition. Already materialized jobs stay.
    pub async fn remove_recurring(&self, id: &str) -> JobResult<bool> {
        let removed = self.store.remove_recurring(id).await?;
        if removed {
            info!(definition_id = %id, "Removed recurring job");
        }
        Ok(removed)
    }

    /// Runs a recurring definition now without moving its cadence.
    pub async fn trigger_recurring(&self, id: &str) -> JobResult<JobId> {
        let definition = self
            .store
            .get_recurring(id)
            .await?
            .ok_or_else(|| JobError::NotFound(format!("recurring job {id}")))?;

        let record = JobRecord::new(definition.payload, definition.queue, self.clock.now())
            .max_attempts(self.max_attempts);
        let job_id = self.create(record).await?;
        info!(definition_id = %id, job_id = %job_id, "Triggered recurring job");
        Ok(job_id)
    }

    /// Creates the job for one recurring slot. Idempotent per
    /// `(definition, slot)`.
    pub(crate) async fn materialize(
        &self,
        definition: &RecurringDefinition,
        slot: DateTime<Utc>,
    ) -> JobResult<JobId> {
        let record = JobRecord::new(definition.payload.clone(), definition.queue.clone(), self.clock.now())
            .scheduled_at(slot)
            .max_attempts(self.max_attempts);
        let job_id = self
            .store
            .create_recurring_instance(&definition.id, slot, record)
            .await?;
        JobMetrics::job_enqueued(&definition.queue, &definition.payload.kind);
        Ok(job_id)
    }

    /// Fetches a job.
    pub async fn get_job(&self, id: &JobId) -> JobResult<Option<JobRecord>> {
        self.store.get(id).await
    }

    /// Retention: deletes a succeeded or failed job.
    pub async fn delete_job(&self, id: &JobId) -> JobResult<()> {
        self.store.delete(id).await?;
        debug!(job_id = %id, "Deleted job");
        Ok(())
    }

    /// Per-queue counts; also refreshes the queue gauges.
    pub async fn queue_stats(&self) -> JobResult<Vec<QueueStats>> {
        let mut all = Vec::new();
        for queue in self.registry.queue_names() {
            let stats = self.store.queue_stats(queue).await?;
            JobMetrics::update_queue(&stats);
            all.push(stats);
        }
        Ok(all)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}
