//! Execution collaborator: runs a job body and reports a [`JobResult`].
//!
//! Job code is resolved through an explicit [`JobRegistry`] keyed by the job's
//! `class`, populated at startup. Each run happens on its own tokio task so a
//! panicking handler cannot take the executor down, and every run observes a
//! [`CancellationToken`] so timeouts and cancels abort it promptly.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt as _;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use jobforge_core::{FailureReason, JobRecord, JobResult};

/// Why a run produced no [`JobResult`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    #[error("{message}")]
    Failed {
        message: String,
        stack: Option<String>,
    },
    #[error("job timed out after {0:?}")]
    Timeout(Duration),
    #[error("job aborted")]
    Aborted,
    #[error("job panicked: {0}")]
    Panicked(String),
    #[error("no handler registered for job class {0}")]
    UnknownJobClass(String),
}

impl ExecutionError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            stack: None,
        }
    }

    /// Capture an `anyhow` error; its cause chain becomes the stack.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let chain: Vec<String> = err
            .chain()
            .skip(1)
            .map(|cause| format!("caused by: {cause}"))
            .collect();
        Self::Failed {
            message: err.to_string(),
            stack: (!chain.is_empty()).then(|| chain.join("\n")),
        }
    }

    /// The entry recorded in the job's error list.
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            ExecutionError::Failed { message, stack } => FailureReason {
                message: message.clone(),
                stack: stack.clone(),
            },
            other => FailureReason::new(other.to_string()),
        }
    }
}

/// Runs job bodies.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Run `job` to completion.
    ///
    /// When `cancel` fires the run must stop promptly and return
    /// [`ExecutionError::Aborted`].
    async fn run(&self, job: JobRecord, cancel: CancellationToken) -> Result<JobResult, ExecutionError>;
}

#[async_trait]
impl<T: JobRunner + ?Sized> JobRunner for Arc<T> {
    async fn run(&self, job: JobRecord, cancel: CancellationToken) -> Result<JobResult, ExecutionError> {
        (**self).run(job, cancel).await
    }
}

/// What a handler returns: a plain value (the job completed with it) or an
/// explicit [`JobResult`] such as a snooze or a permanent failure.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Value(JsonValue),
    Result(JobResult),
}

impl JobOutcome {
    /// Completed without a result value.
    pub fn done() -> Self {
        Self::Value(JsonValue::Null)
    }

    pub fn into_result(self) -> JobResult {
        match self {
            JobOutcome::Value(value) => JobResult::completed(value),
            JobOutcome::Result(result) => result,
        }
    }
}

impl From<JsonValue> for JobOutcome {
    fn from(value: JsonValue) -> Self {
        Self::Value(value)
    }
}

impl From<JobResult> for JobOutcome {
    fn from(value: JobResult) -> Self {
        Self::Result(value)
    }
}

/// Input handed to a job handler.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job: JobRecord,
    /// Fires on timeout or cancel; long-running handlers should watch it.
    pub cancel: CancellationToken,
}

impl JobContext {
    pub fn args(&self) -> &[JsonValue] {
        &self.job.args
    }

    /// Deserialize positional argument `index`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> anyhow::Result<T> {
        let value = self
            .job
            .args
            .get(index)
            .ok_or_else(|| anyhow::anyhow!("job {} has no argument at index {index}", self.job.id))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Deserialize constructor argument `index`.
    pub fn constructor_arg<T: DeserializeOwned>(&self, index: usize) -> anyhow::Result<T> {
        let value = self.job.constructor_args.get(index).ok_or_else(|| {
            anyhow::anyhow!("job {} has no constructor argument at index {index}", self.job.id)
        })?;
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

type Handler = Arc<dyn Fn(JobContext) -> BoxFuture<'static, anyhow::Result<JobOutcome>> + Send + Sync>;

/// Maps job classes to async handlers.
#[derive(Clone, Default)]
pub struct JobRegistry {
    handlers: HashMap<String, Handler>,
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("classes", &self.classes())
            .finish()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `class`, replacing any previous one.
    pub fn register<F, Fut>(&mut self, class: impl Into<String>, handler: F)
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<JobOutcome>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |ctx: JobContext| handler(ctx).boxed());
        self.handlers.insert(class.into(), handler);
    }

    pub fn with_handler<F, Fut>(mut self, class: impl Into<String>, handler: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<JobOutcome>> + Send + 'static,
    {
        self.register(class, handler);
        self
    }

    pub fn contains(&self, class: &str) -> bool {
        self.handlers.contains_key(class)
    }

    /// Registered classes, sorted.
    pub fn classes(&self) -> Vec<&str> {
        let mut classes: Vec<_> = self.handlers.keys().map(String::as_str).collect();
        classes.sort_unstable();
        classes
    }
}

#[async_trait]
impl JobRunner for JobRegistry {
    async fn run(&self, job: JobRecord, cancel: CancellationToken) -> Result<JobResult, ExecutionError> {
        let handler = self
            .handlers
            .get(&job.class)
            .cloned()
            .ok_or_else(|| ExecutionError::UnknownJobClass(job.class.clone()))?;

        let ctx = JobContext {
            job,
            cancel: cancel.clone(),
        };
        let mut task = tokio::spawn(handler(ctx));

        tokio::select! {
            joined = &mut task => match joined {
                Ok(Ok(outcome)) => Ok(outcome.into_result()),
                Ok(Err(err)) => Err(ExecutionError::from_anyhow(&err)),
                Err(join_err) if join_err.is_panic() => {
                    Err(ExecutionError::Panicked(panic_message(join_err.into_panic())))
                }
                Err(_) => Err(ExecutionError::Aborted),
            },
            _ = cancel.cancelled() => {
                task.abort();
                Err(ExecutionError::Aborted)
            }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
