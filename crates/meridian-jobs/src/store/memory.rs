//! In-memory reference job store.

use super::JobStore;
use crate::clock::{add, Clock, SystemClock};
use crate::continuation::ContinuationGraph;
use crate::error::{JobError, JobResult};
use crate::job::{JobId, JobRecord, JobState};
use crate::queue::QueueStats;
use crate::recurring::RecurringDefinition;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Ready-index key: eligibility time, then insertion order.
type ReadyKey = (DateTime<Utc>, u64, JobId);

#[derive(Default)]
struct State {
    jobs: HashMap<JobId, JobRecord>,
    /// Insertion sequence per job; breaks `scheduled_at` ties FIFO.
    sequence: HashMap<JobId, u64>,
    next_sequence: u64,
    /// Enqueued jobs per queue.
    ready: HashMap<String, BTreeSet<ReadyKey>>,
    graph: ContinuationGraph,
    recurring: HashMap<String, RecurringDefinition>,
    recurring_slots: HashMap<(String, DateTime<Utc>), JobId>,
}

impl State {
    fn job(&self, id: &JobId) -> JobResult<&JobRecord> {
        self.jobs
            .get(id)
            .ok_or_else(|| JobError::NotFound(id.to_string()))
    }

    fn job_mut(&mut self, id: &JobId) -> JobResult<&mut JobRecord> {
        self.jobs
            .get_mut(id)
            .ok_or_else(|| JobError::NotFound(id.to_string()))
    }

    fn ready_key(&self, job: &JobRecord) -> ReadyKey {
        let seq = self.sequence.get(&job.id).copied().unwrap_or_default();
        (job.scheduled_at, seq, job.id.clone())
    }

    /// Moves a job to `Enqueued` and indexes it.
    fn make_ready(&mut self, id: &JobId) -> JobResult<()> {
        let job = self.job_mut(id)?;
        job.state = JobState::Enqueued;
        job.lease_expires_at = None;
        let queue = job.queue.clone();
        let key = self.ready_key(self.job(id)?);
        self.ready.entry(queue).or_default().insert(key);
        Ok(())
    }

    /// Removes an `Enqueued` job from its ready index.
    fn unready(&mut self, id: &JobId) -> JobResult<()> {
        let job = self.job(id)?;
        let key = self.ready_key(job);
        let queue = job.queue.clone();
        if let Some(set) = self.ready.get_mut(&queue) {
            set.remove(&key);
        }
        Ok(())
    }

    fn insert(&mut self, mut job: JobRecord) -> JobResult<JobId> {
        if self.jobs.contains_key(&job.id) {
            return Err(JobError::DuplicateId(job.id.to_string()));
        }

        let release_now = match &job.parent_id {
            Some(parent_id) => self.job(parent_id)?.state == JobState::Succeeded,
            None => true,
        };

        let id = job.id.clone();
        job.attempt = 0;
        job.lease_expires_at = None;
        job.state = JobState::AwaitingParent;

        self.sequence.insert(id.clone(), self.next_sequence);
        self.next_sequence += 1;
        if let Some(parent_id) = job.parent_id.clone() {
            self.graph.link(&parent_id, &id);
        }
        self.jobs.insert(id.clone(), job);

        if release_now {
            self.make_ready(&id)?;
        }
        Ok(id)
    }

    fn release_children(&mut self, parent_id: &JobId) -> JobResult<Vec<JobId>> {
        let waiting: Vec<JobId> = self
            .graph
            .children_of(parent_id)
            .iter()
            .filter(|child| {
                self.jobs
                    .get(*child)
                    .is_some_and(|job| job.state == JobState::AwaitingParent)
            })
            .cloned()
            .collect();

        for child in &waiting {
            self.make_ready(child)?;
        }
        Ok(waiting)
    }

    /// Checks that `attempt` is the lease currently held on the job.
    fn expect_lease(&self, id: &JobId, attempt: u32) -> JobResult<()> {
        let job = self.job(id)?;
        match job.state {
            JobState::Leased if job.attempt == attempt => Ok(()),
            _ if attempt > 0 && job.attempt > attempt => Err(JobError::LeaseConflict(format!(
                "lease {attempt} on job {id} was superseded by lease {}",
                job.attempt
            ))),
            JobState::Enqueued if attempt > 0 && job.attempt == attempt => Err(JobError::LeaseConflict(
                format!("lease {attempt} on job {id} expired and was reaped"),
            )),
            JobState::Leased => Err(JobError::LeaseConflict(format!(
                "job {id} is leased as attempt {}, not {attempt}",
                job.attempt
            ))),
            other => Err(JobError::invalid_state("leased", other)),
        }
    }

    /// Drops slot keys of `definition_id` older than its last fired slot,
    /// or all of them once the definition is gone.
    fn prune_slots(&mut self, definition_id: &str) {
        let last_fired = self
            .recurring
            .get(definition_id)
            .map(|def| def.last_fired_at);
        self.recurring_slots.retain(|(id, slot), _| {
            id != definition_id
                || match last_fired {
                    Some(Some(last)) => *slot >= last,
                    Some(None) => true,
                    None => false,
                }
        });
    }
}

/// Job store keeping all state in process memory.
///
/// One mutex guards jobs, continuation edges and recurring definitions,
/// which makes every trait operation a single transaction.
pub struct InMemoryJobStore {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
}

impl InMemoryJobStore {
    /// Creates a store on the wall clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates a store reading time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
        }
    }

    /// Snapshot of jobs, optionally filtered by state, oldest first.
    /// Deleted jobs come last.
    pub fn list_jobs(&self, state: Option<JobState>) -> Vec<JobRecord> {
        let guard = self.state.lock();
        let mut jobs: Vec<JobRecord> = guard
            .jobs
            .values()
            .filter(|job| state.map_or(true, |s| job.state == s))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| guard.sequence.get(&job.id).copied().unwrap_or(u64::MAX));
        jobs
    }

    /// Number of stored jobs, including deleted ones.
    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    /// Returns true if no jobs are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: JobRecord) -> JobResult<JobId> {
        let mut state = self.state.lock();
        let id = state.insert(job)?;
        debug!(job_id = %id, state = %state.job(&id)?.state, "Created job");
        Ok(id)
    }

    async fn create_recurring_instance(
        &self,
        definition_id: &str,
        slot: DateTime<Utc>,
        job: JobRecord,
    ) -> JobResult<JobId> {
        let mut state = self.state.lock();
        let key = (definition_id.to_string(), slot);
        if let Some(existing) = state.recurring_slots.get(&key) {
            debug!(definition_id, %slot, job_id = %existing, "Recurring slot already materialized");
            return Ok(existing.clone());
        }
        let id = state.insert(job)?;
        state.recurring_slots.insert(key, id.clone());
        Ok(id)
    }

    async fn lease_next(&self, queues: &[String], lease_duration: Duration) -> JobResult<Option<JobRecord>> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        for queue in queues {
            let Some(set) = state.ready.get_mut(queue) else {
                continue;
            };
            let eligible = matches!(set.first(), Some((scheduled_at, _, _)) if *scheduled_at <= now);
            if !eligible {
                continue;
            }
            let Some((_, _, id)) = set.pop_first() else {
                continue;
            };

            let job = state.job_mut(&id)?;
            job.state = JobState::Leased;
            job.attempt += 1;
            job.lease_expires_at = Some(add(now, lease_duration));
            debug!(job_id = %id, queue = %queue, attempt = job.attempt, "Leased job");
            return Ok(Some(job.clone()));
        }

        Ok(None)
    }

    async fn ack(&self, job_id: &JobId, attempt: u32) -> JobResult<Vec<JobId>> {
        let mut state = self.state.lock();
        state.expect_lease(job_id, attempt)?;

        let job = state.job_mut(job_id)?;
        job.state = JobState::Succeeded;
        job.lease_expires_at = None;

        let released = state.release_children(job_id)?;
        if !released.is_empty() {
            debug!(job_id = %job_id, released = released.len(), "Released continuations");
        }
        Ok(released)
    }

    async fn fail(
        &self,
        job_id: &JobId,
        attempt: u32,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> JobResult<()> {
        let mut state = self.state.lock();
        state.expect_lease(job_id, attempt)?;

        let job = state.job_mut(job_id)?;
        job.last_error = Some(error.to_string());
        job.lease_expires_at = None;

        match retry_at {
            Some(at) if !job.is_exhausted() => {
                job.scheduled_at = at;
                state.make_ready(job_id)?;
            }
            Some(_) => {
                warn!(job_id = %job_id, attempt = job.attempt, "Retry requested with no attempts left");
                job.state = JobState::Failed;
            }
            None => job.state = JobState::Failed,
        }
        Ok(())
    }

    async fn reap_expired_leases(&self) -> JobResult<u64> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        let expired: Vec<JobId> = state
            .jobs
            .values()
            .filter(|job| {
                job.state == JobState::Leased && job.lease_expires_at.is_some_and(|at| at < now)
            })
            .map(|job| job.id.clone())
            .collect();

        for id in &expired {
            let job = state.job_mut(id)?;
            job.last_error = Some("lease expired before the job was acknowledged".to_string());
            job.lease_expires_at = None;
            if job.is_exhausted() {
                warn!(job_id = %id, attempt = job.attempt, "Lease expired on final attempt");
                job.state = JobState::Failed;
            } else {
                warn!(job_id = %id, attempt = job.attempt, "Lease expired, job re-enqueued");
                state.make_ready(id)?;
            }
        }

        Ok(expired.len() as u64)
    }

    async fn link_child(&self, parent_id: &JobId, child_id: &JobId) -> JobResult<()> {
        let mut state = self.state.lock();
        let parent_state = state.job(parent_id)?.state;
        let child = state.job(child_id)?;

        if state.graph.would_cycle(parent_id, child_id) {
            return Err(JobError::CyclicContinuation {
                parent: parent_id.to_string(),
                child: child_id.to_string(),
            });
        }
        if child.parent_id.is_some() || state.graph.parent_of(child_id).is_some() {
            return Err(JobError::invalid_state("job without a parent", "continuation"));
        }
        if child.state != JobState::Enqueued {
            return Err(JobError::invalid_state("enqueued", child.state));
        }

        state.graph.link(parent_id, child_id);
        if parent_state != JobState::Succeeded {
            state.unready(child_id)?;
            state.job_mut(child_id)?.state = JobState::AwaitingParent;
        }
        state.job_mut(child_id)?.parent_id = Some(parent_id.clone());
        Ok(())
    }

    async fn on_parent_succeeded(&self, parent_id: &JobId) -> JobResult<Vec<JobId>> {
        let mut state = self.state.lock();
        let parent = state.job(parent_id)?;
        if parent.state != JobState::Succeeded {
            return Err(JobError::invalid_state("succeeded", parent.state));
        }
        state.release_children(parent_id)
    }

    async fn delete(&self, job_id: &JobId) -> JobResult<()> {
        let mut state = self.state.lock();
        let job = state.job_mut(job_id)?;
        match job.state {
            JobState::Succeeded | JobState::Failed => job.state = JobState::Deleted,
            JobState::Deleted => {}
            other => return Err(JobError::invalid_state("succeeded or failed", other)),
        }
        // Terminal jobs are never indexed again.
        state.sequence.remove(job_id);
        Ok(())
    }

    async fn get(&self, job_id: &JobId) -> JobResult<Option<JobRecord>> {
        Ok(self.state.lock().jobs.get(job_id).cloned())
    }

    async fn children(&self, parent_id: &JobId) -> JobResult<Vec<JobId>> {
        Ok(self.state.lock().graph.children_of(parent_id).to_vec())
    }

    async fn queue_stats(&self, queue: &str) -> JobResult<QueueStats> {
        let state = self.state.lock();
        let mut stats = QueueStats {
            queue: queue.to_string(),
            ..QueueStats::default()
        };
        for job in state.jobs.values().filter(|job| job.queue == queue) {
            match job.state {
                JobState::Enqueued => stats.enqueued += 1,
                JobState::Leased => stats.leased += 1,
                JobState::AwaitingParent => stats.awaiting_parent += 1,
                JobState::Succeeded => stats.succeeded += 1,
                JobState::Failed => stats.failed += 1,
                JobState::Deleted => {}
            }
        }
        Ok(stats)
    }

    async fn save_recurring(&self, definition: RecurringDefinition) -> JobResult<()> {
        self.state
            .lock()
            .recurring
            .insert(definition.id.clone(), definition);
        Ok(())
    }

    async fn get_recurring(&self, id: &str) -> JobResult<Option<RecurringDefinition>> {
        Ok(self.state.lock().recurring.get(id).cloned())
    }

    async fn remove_recurring(&self, id: &str) -> JobResult<bool> {
        let mut state = self.state.lock();
        let removed = state.recurring.remove(id).is_some();
        state.prune_slots(id);
        Ok(removed)
    }

    async fn list_recurring(&self) -> JobResult<Vec<RecurringDefinition>> {
        let mut definitions: Vec<RecurringDefinition> =
            self.state.lock().recurring.values().cloned().collect();
        definitions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(definitions)
    }

    async fn due_recurring(&self, now: DateTime<Utc>) -> JobResult<Vec<RecurringDefinition>> {
        let mut due: Vec<RecurringDefinition> = self
            .state
            .lock()
            .recurring
            .values()
            .filter(|def| def.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|def| def.next_fire_at);
        Ok(due)
    }

    async fn advance_recurring(
        &self,
        id: &str,
        fired_slot: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
    ) -> JobResult<bool> {
        let mut state = self.state.lock();
        let Some(definition) = state.recurring.get_mut(id) else {
            return Ok(false);
        };
        if definition.next_fire_at != Some(fired_slot) {
            return Ok(false);
        }
        definition.next_fire_at = next;
        definition.last_fired_at = Some(fired_slot);
        state.prune_slots(id);
        Ok(true)
    }
}
