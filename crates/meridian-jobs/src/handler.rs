//! Job kind registry.
//!
//! Workers look handlers up by `JobPayload::kind`. A handler receives the
//! raw payload and the execution context and returns a boxed future.

use crate::error::JobError;
use crate::job::{Job, JobContext, JobPayload};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::info;

/// Type-erased job handler.
pub type JobHandler =
    Arc<dyn Fn(JobPayload, JobContext) -> BoxFuture<'static, Result<(), JobError>> + Send + Sync>;

/// Registered handlers keyed by job kind.
#[derive(Clone, Default)]
pub struct JobHandlers {
    handlers: Arc<RwLock<HashMap<String, JobHandler>>>,
}

impl JobHandlers {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a typed job. The payload arguments are decoded into `J`
    /// before `perform` runs.
    pub fn register_job<J: Job>(&self) {
        let handler: JobHandler = Arc::new(|payload: JobPayload, ctx: JobContext| {
            async move {
                let job: J = payload.decode()?;
                job.perform(ctx).await
            }
            .boxed()
        });
        self.insert(J::KIND, handler);
    }

    /// Registers an async closure for `kind`.
    pub fn register_fn<F, Fut>(&self, kind: impl Into<String>, handler: F)
    where
        F: Fn(JobPayload, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        let handler: JobHandler = Arc::new(move |payload, ctx| handler(payload, ctx).boxed());
        self.insert(kind, handler);
    }

    /// Registers a blocking closure for `kind`; it runs on the blocking
    /// thread pool so it never stalls the runtime.
    pub fn register_blocking<F>(&self, kind: impl Into<String>, handler: F)
    where
        F: Fn(JobPayload, JobContext) -> Result<(), JobError> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let wrapped: JobHandler = Arc::new(move |payload, ctx| {
            let handler = handler.clone();
            async move {
                tokio::task::spawn_blocking(move || handler(payload, ctx))
                    .await
                    .map_err(|e| JobError::ExecutionFailed(format!("blocking job aborted: {e}")))?
            }
            .boxed()
        });
        self.insert(kind, wrapped);
    }

    /// Looks up the handler for `kind`.
    pub fn get(&self, kind: &str) -> Option<JobHandler> {
        self.handlers.read().get(kind).cloned()
    }

    /// Returns true if `kind` has a handler.
    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.read().contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.handlers.read().keys().cloned().collect();
        kinds.sort();
        kinds
    }

    fn insert(&self, kind: impl Into<String>, handler: JobHandler) {
        let kind = kind.into();
        info!(job_kind = %kind, "Registered job handler");
        self.handlers.write().insert(kind, handler);
    }
}

impl std::fmt::Debug for JobHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandlers")
            .field("kinds", &self.kinds())
            .finish()
    }
}
