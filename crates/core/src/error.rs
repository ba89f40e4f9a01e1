//! Job engine error model.

use std::time::Duration;

use thiserror::Error;

/// Result type used across the job engine.
pub type JobForgeResult<T> = Result<T, JobError>;

/// Engine-level error.
///
/// Transitions never produce one of these for a failed guard (they no-op
/// instead). Validation failures are raised before any mutation; store
/// failures are mapped into `DuplicateJob`/`NotFound` by the infra layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Bad configuration or input (e.g. queue concurrency < 0, negative delay).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An alive job (or a job in the same fixed window) already carries this digest.
    #[error("duplicate job: unique digest {digest} is already taken")]
    DuplicateJob { digest: String },

    /// A referenced job or queue does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The job body failed.
    #[error("job execution failed: {0}")]
    Execution(String),

    /// The job body exceeded its timeout.
    #[error("job timed out after {0:?}")]
    Timeout(Duration),
}

impl JobError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn duplicate(digest: impl Into<String>) -> Self {
        Self::DuplicateJob {
            digest: digest.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }
}
