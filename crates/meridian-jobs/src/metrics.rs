//! Job dispatch metrics.
//!
//! Recorded through the `metrics` facade; the host process decides which
//! recorder (if any) is installed.

use crate::queue::QueueStats;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric names.
pub mod names {
    /// Total jobs created.
    pub const JOBS_ENQUEUED_TOTAL: &str = "meridian_jobs_enqueued_total";
    /// Total leases handed to workers.
    pub const JOBS_LEASED_TOTAL: &str = "meridian_jobs_leased_total";
    /// Total jobs acknowledged as succeeded.
    pub const JOBS_SUCCEEDED_TOTAL: &str = "meridian_jobs_succeeded_total";
    /// Total jobs terminally failed.
    pub const JOBS_FAILED_TOTAL: &str = "meridian_jobs_failed_total";
    /// Total attempts re-enqueued for retry.
    pub const JOBS_RETRIED_TOTAL: &str = "meridian_jobs_retried_total";
    /// Total continuations released by a parent's success.
    pub const CONTINUATIONS_RELEASED_TOTAL: &str = "meridian_jobs_continuations_released_total";
    /// Total expired leases returned to their queue.
    pub const LEASES_REAPED_TOTAL: &str = "meridian_jobs_leases_reaped_total";

    /// Jobs per queue and state.
    pub const QUEUE_JOBS: &str = "meridian_jobs_queue_jobs";

    /// Job execution duration in seconds.
    pub const JOB_DURATION_SECONDS: &str = "meridian_jobs_duration_seconds";
    /// Time between `scheduled_at` and lease in seconds.
    pub const JOB_WAIT_TIME_SECONDS: &str = "meridian_jobs_wait_time_seconds";

    /// Worker slots currently executing a job.
    pub const WORKERS_BUSY: &str = "meridian_jobs_workers_busy";
    /// Configured worker slots.
    pub const WORKERS_CONCURRENCY: &str = "meridian_jobs_workers_concurrency";

    /// Recurring slots materialized.
    pub const RECURRING_FIRED_TOTAL: &str = "meridian_jobs_recurring_fired_total";
    /// Times missed recurring slots were skipped past the catch-up limit.
    pub const RECURRING_SKIPPED_TOTAL: &str = "meridian_jobs_recurring_skipped_total";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::JOBS_ENQUEUED_TOTAL, "Total number of jobs created");
    describe_counter!(names::JOBS_LEASED_TOTAL, "Total number of leases handed to workers");
    describe_counter!(
        names::JOBS_SUCCEEDED_TOTAL,
        "Total number of jobs that completed successfully"
    );
    describe_counter!(names::JOBS_FAILED_TOTAL, "Total number of jobs that failed terminally");
    describe_counter!(names::JOBS_RETRIED_TOTAL, "Total number of failed attempts scheduled for retry");
    describe_counter!(
        names::CONTINUATIONS_RELEASED_TOTAL,
        "Total number of continuations released"
    );
    describe_counter!(names::LEASES_REAPED_TOTAL, "Total number of expired leases reaped");

    describe_gauge!(names::QUEUE_JOBS, "Current number of jobs per queue and state");

    describe_histogram!(names::JOB_DURATION_SECONDS, "Job execution duration in seconds");
    describe_histogram!(
        names::JOB_WAIT_TIME_SECONDS,
        "Delay between a job becoming eligible and being leased"
    );

    describe_gauge!(names::WORKERS_BUSY, "Worker slots currently executing a job");
    describe_gauge!(names::WORKERS_CONCURRENCY, "Configured worker slots per pool");

    describe_counter!(names::RECURRING_FIRED_TOTAL, "Total number of recurring slots fired");
    describe_counter!(
        names::RECURRING_SKIPPED_TOTAL,
        "Total number of times missed recurring slots were skipped"
    );
}

/// Job lifecycle metrics recorder.
#[derive(Clone)]
pub struct JobMetrics;

impl JobMetrics {
    /// Record a job created.
    pub fn job_enqueued(queue: &str, kind: &str) {
        counter!(
            names::JOBS_ENQUEUED_TOTAL,
            "queue" => queue.to_string(),
            "kind" => kind.to_string()
        )
        .increment(1);
    }

    /// Record a lease and how long the job waited for it.
    pub fn job_leased(queue: &str, kind: &str, wait_time: Duration) {
        counter!(
            names::JOBS_LEASED_TOTAL,
            "queue" => queue.to_string(),
            "kind" => kind.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_WAIT_TIME_SECONDS,
            "queue" => queue.to_string()
        )
        .record(wait_time.as_secs_f64());
    }

    /// Record a job acknowledged.
    pub fn job_succeeded(queue: &str, kind: &str, duration: Duration) {
        counter!(
            names::JOBS_SUCCEEDED_TOTAL,
            "queue" => queue.to_string(),
            "kind" => kind.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "kind" => kind.to_string(),
            "status" => "succeeded"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a failed attempt that will be retried.
    pub fn job_retried(queue: &str, kind: &str, attempt: u32) {
        counter!(
            names::JOBS_RETRIED_TOTAL,
            "queue" => queue.to_string(),
            "kind" => kind.to_string(),
            "attempt" => attempt.to_string()
        )
        .increment(1);
    }

    /// Record a terminal failure.
    pub fn job_failed(queue: &str, kind: &str, duration: Duration) {
        counter!(
            names::JOBS_FAILED_TOTAL,
            "queue" => queue.to_string(),
            "kind" => kind.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "kind" => kind.to_string(),
            "status" => "failed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record continuations released by a parent.
    pub fn continuations_released(count: usize) {
        if count > 0 {
            counter!(names::CONTINUATIONS_RELEASED_TOTAL).increment(count as u64);
        }
    }

    /// Record expired leases returned by the reaper.
    pub fn leases_reaped(count: u64) {
        if count > 0 {
            counter!(names::LEASES_REAPED_TOTAL).increment(count);
        }
    }

    /// Update per-queue gauges from a stats snapshot.
    pub fn update_queue(stats: &QueueStats) {
        let states = [
            ("enqueued", stats.enqueued),
            ("leased", stats.leased),
            ("awaiting_parent", stats.awaiting_parent),
            ("succeeded", stats.succeeded),
            ("failed", stats.failed),
        ];
        for (state, count) in states {
            gauge!(
                names::QUEUE_JOBS,
                "queue" => stats.queue.clone(),
                "state" => state
            )
            .set(count as f64);
        }
    }
}

/// Worker metrics recorder.
#[derive(Clone)]
pub struct WorkerMetrics;

impl WorkerMetrics {
    /// Update slot gauges for a pool.
    pub fn update_workers(pool_id: &str, busy: u64, concurrency: usize) {
        gauge!(
            names::WORKERS_BUSY,
            "pool_id" => pool_id.to_string()
        )
        .set(busy as f64);

        gauge!(
            names::WORKERS_CONCURRENCY,
            "pool_id" => pool_id.to_string()
        )
        .set(concurrency as f64);
    }
}

/// Recurring scheduler metrics recorder.
#[derive(Clone)]
pub struct SchedulerMetrics;

impl SchedulerMetrics {
    /// Record a recurring slot materialized.
    pub fn recurring_fired(definition_id: &str) {
        counter!(
            names::RECURRING_FIRED_TOTAL,
            "definition_id" => definition_id.to_string()
        )
        .increment(1);
    }

    /// Record a definition jumping past missed slots.
    pub fn recurring_skipped(definition_id: &str) {
        counter!(
            names::RECURRING_SKIPPED_TOTAL,
            "definition_id" => definition_id.to_string()
        )
        .increment(1);
    }
}
