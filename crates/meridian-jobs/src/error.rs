//! Job error types.

use thiserror::Error;

/// Result type for job operations.
pub type JobResult<T> = Result<T, JobError>;

/// Job-related errors.
#[derive(Debug, Error)]
pub enum JobError {
    /// Bad queue, pool or retry setup. Fatal at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Job (or recurring definition) does not exist.
    #[error("Job not found: {0}")]
    NotFound(String),

    /// Operation is not allowed in the job's current state.
    #[error("Invalid job state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// A job with this id already exists.
    #[error("Duplicate job id: {0}")]
    DuplicateId(String),

    /// Linking the continuation would close a cycle.
    #[error("Continuation {parent} -> {child} would create a cycle")]
    CyclicContinuation { parent: String, child: String },

    /// The store lost a leasing race; retry on the next poll.
    #[error("Lease conflict: {0}")]
    LeaseConflict(String),

    /// Job body returned an error or panicked.
    #[error("Job execution failed: {0}")]
    ExecutionFailed(String),

    /// No handler is registered for the payload kind.
    #[error("No handler registered for job kind: {0}")]
    UnknownJobKind(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Cron expression could not be parsed.
    #[error("Invalid cron expression '{expression}': {message}")]
    InvalidCron { expression: String, message: String },

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobError {
    /// Returns true if a job failing with this error may be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobError::ExecutionFailed(_) | JobError::LeaseConflict(_) | JobError::Internal(_)
        )
    }

    /// Returns true for errors that indicate broken call sequencing in the
    /// core rather than a problem with the job itself.
    pub fn is_programming_error(&self) -> bool {
        matches!(self, JobError::NotFound(_) | JobError::InvalidState { .. })
    }

    /// Shorthand for building an `InvalidState` error.
    pub(crate) fn invalid_state(expected: impl Into<String>, actual: impl ToString) -> Self {
        JobError::InvalidState {
            expected: expected.into(),
            actual: actual.to_string(),
        }
    }
}
