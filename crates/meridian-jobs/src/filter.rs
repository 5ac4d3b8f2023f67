//! Job filters: hooks that run around every job execution.
//!
//! Before-hooks run in registration order and after-hooks in reverse, so
//! filters nest like middleware. A before-hook error aborts the attempt
//! without running the job body; it is then treated like any other
//! execution failure.

use crate::error::JobError;
use crate::job::JobContext;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

/// Hook pair invoked around a job body.
#[async_trait]
pub trait JobFilter: Send + Sync {
    /// Filter name for logs.
    fn name(&self) -> &str;

    /// Runs before the body. Returning an error skips the body.
    async fn on_performing(&self, _ctx: &JobContext) -> Result<(), JobError> {
        Ok(())
    }

    /// Runs after the body, or after a later filter rejected the attempt.
    /// Observes the outcome; it cannot change it.
    async fn on_performed(&self, _ctx: &JobContext, _outcome: &Result<(), JobError>) {}
}

/// Ordered chain of filters.
#[derive(Clone, Default)]
pub struct FilterPipeline {
    filters: Vec<Arc<dyn JobFilter>>,
}

impl FilterPipeline {
    /// Creates an empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pipeline with the logging filter installed.
    pub fn default_chain() -> Self {
        Self::new().with(Arc::new(LoggingFilter))
    }

    /// Appends a filter.
    pub fn with(mut self, filter: Arc<dyn JobFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    /// Appends a filter in place.
    pub fn push(&mut self, filter: Arc<dyn JobFilter>) {
        self.filters.push(filter);
    }

    /// Number of installed filters.
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Returns true if no filters are installed.
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Runs `body` inside the chain and returns its outcome unchanged.
    ///
    /// Only filters whose before-hook succeeded get their after-hook.
    pub async fn run<F>(&self, ctx: &JobContext, body: F) -> Result<(), JobError>
    where
        F: Future<Output = Result<(), JobError>> + Send,
    {
        let mut entered = 0;
        let mut rejected = None;

        for filter in &self.filters {
            match filter.on_performing(ctx).await {
                Ok(()) => entered += 1,
                Err(e) => {
                    warn!(
                        job_id = %ctx.job_id,
                        filter = filter.name(),
                        error = %e,
                        "Filter rejected job"
                    );
                    rejected = Some(e);
                    break;
                }
            }
        }

        let outcome = match rejected {
            Some(e) => Err(e),
            None => body.await,
        };

        for filter in self.filters[..entered].iter().rev() {
            filter.on_performed(ctx, &outcome).await;
        }

        outcome
    }
}

impl std::fmt::Debug for FilterPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.filters.iter().map(|filter| filter.name()).collect();
        f.debug_struct("FilterPipeline").field("filters", &names).finish()
    }
}

/// Logs the start and end of every job.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingFilter;

#[async_trait]
impl JobFilter for LoggingFilter {
    fn name(&self) -> &str {
        "logging"
    }

    async fn on_performing(&self, ctx: &JobContext) -> Result<(), JobError> {
        info!(
            job_id = %ctx.job_id,
            kind = %ctx.kind,
            queue = %ctx.queue,
            attempt = ctx.attempt,
            worker_id = %ctx.worker_id,
            "Starting to perform job {}",
            ctx.job_id
        );
        Ok(())
    }

    async fn on_performed(&self, ctx: &JobContext, outcome: &Result<(), JobError>) {
        match outcome {
            Ok(()) => info!(job_id = %ctx.job_id, "Job {} has been performed", ctx.job_id),
            Err(e) => warn!(
                job_id = %ctx.job_id,
                attempt = ctx.attempt,
                error = %e,
                "Job {} failed",
                ctx.job_id
            ),
        }
    }
}
