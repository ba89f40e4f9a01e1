//! Job record data model.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::backoff::BackoffStrategy;
use crate::error::{JobError, JobForgeResult};
use crate::id::{JobId, WorkerId};
use crate::uniqueness::UniquenessConfig;

/// Queue used when a job does not name one.
pub const DEFAULT_QUEUE: &str = "default";

/// Attempts granted to a job that does not set `max_attempts`.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Lifecycle state of a job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Queued, waiting to be claimed once `available_at` has passed
    Waiting,
    /// Claimed by a worker, not started yet
    Claimed,
    /// Currently being executed
    Running,
    /// Finished successfully
    Completed,
    /// Finished with a permanent failure (or out of attempts)
    Failed,
    /// Canceled by an operator or the application
    Canceled,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Waiting,
        JobState::Claimed,
        JobState::Running,
        JobState::Completed,
        JobState::Failed,
        JobState::Canceled,
    ];

    /// `waiting`, `claimed` or `running`: the job has not reached a terminal state.
    pub fn is_alive(&self) -> bool {
        matches!(self, JobState::Waiting | JobState::Claimed | JobState::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Claimed => "claimed",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Canceled => "canceled",
        }
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobState {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| JobError::validation(format!("unknown job state: {s}")))
    }
}

/// Why an attempt failed, as captured into the job's error list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub message: String,
    pub stack: Option<String>,
}

impl FailureReason {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Capture an error and its `source()` chain (the chain becomes the stack).
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        let mut chain = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            chain.push(format!("caused by: {cause}"));
            source = cause.source();
        }

        Self {
            message: error.to_string(),
            stack: (!chain.is_empty()).then(|| chain.join("\n")),
        }
    }
}

impl From<&str> for FailureReason {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for FailureReason {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Record of a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub message: String,
    pub stack: Option<String>,
    pub attempt: u32,
    pub attempted_at: Option<DateTime<Utc>>,
    pub attempt_by: Option<String>,
}

/// Outcome of executing a job body, as reported by the execution collaborator.
///
/// Each variant maps onto exactly one transition; see `Transition::from`.
#[derive(Debug, Clone, PartialEq)]
pub enum JobResult {
    /// Finished; `result` is persisted on the record.
    Completed { result: JsonValue },
    /// Permanent failure; no more attempts.
    Failed { error: FailureReason },
    /// Transient failure; retried after `delay` (or the job's backoff).
    Retry {
        error: FailureReason,
        delay: Option<Duration>,
    },
    /// Not ready yet; put back without consuming an attempt.
    Snooze { delay: Duration },
}

impl JobResult {
    pub fn completed(result: impl Into<JsonValue>) -> Self {
        Self::Completed {
            result: result.into(),
        }
    }

    pub fn failed(error: impl Into<FailureReason>) -> Self {
        Self::Failed {
            error: error.into(),
        }
    }

    pub fn retry(error: impl Into<FailureReason>) -> Self {
        Self::Retry {
            error: error.into(),
            delay: None,
        }
    }

    pub fn retry_after(error: impl Into<FailureReason>, delay: Duration) -> Self {
        Self::Retry {
            error: error.into(),
            delay: Some(delay),
        }
    }

    pub fn snooze(delay: Duration) -> Self {
        Self::Snooze { delay }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            JobResult::Completed { .. } => "completed",
            JobResult::Failed { .. } => "failed",
            JobResult::Retry { .. } => "retry",
            JobResult::Snooze { .. } => "snooze",
        }
    }
}

/// A persisted background job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Store-assigned identifier (`JobId::UNASSIGNED` until inserted)
    pub id: JobId,
    pub queue: String,
    pub state: JobState,
    /// Stable job type identifier, resolved through the handler registry
    pub class: String,
    pub args: Vec<JsonValue>,
    pub constructor_args: Vec<JsonValue>,
    /// Number of run attempts so far
    pub attempt: u32,
    pub max_attempts: u32,
    pub inserted_at: DateTime<Utc>,
    /// Earliest time the job may be claimed (`None` means immediately)
    pub available_at: Option<DateTime<Utc>>,
    pub attempted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    /// Maximum run duration per attempt
    pub timeout: Option<Duration>,
    pub result: Option<JsonValue>,
    pub errors: Vec<ErrorRecord>,
    pub unique_digest: Option<String>,
    pub uniqueness_config: Option<UniquenessConfig>,
    pub backoff_strategy: BackoffStrategy,
    /// Base delay for retries (the constant delay under `BackoffStrategy::Fixed`)
    pub retry_delay: Option<Duration>,
}

impl JobRecord {
    pub fn is_alive(&self) -> bool {
        self.state.is_alive()
    }

    /// Waiting and past its `available_at`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Waiting && self.available_at.is_none_or(|at| at <= now)
    }

    /// Store-side claim: `waiting` → `claimed` for `worker`.
    ///
    /// Backends call this while holding whatever exclusive lock makes the claim
    /// atomic; it is not a lifecycle transition of its own.
    pub fn mark_claimed(&mut self, worker: &WorkerId, now: DateTime<Utc>) {
        self.state = JobState::Claimed;
        self.claimed_at = Some(now);
        self.claimed_by = Some(worker.to_string());
    }

    /// Recompute `unique_digest` from `uniqueness_config` (cleared when absent).
    pub fn refresh_digest(&mut self, now: DateTime<Utc>) {
        self.unique_digest = match &self.uniqueness_config {
            Some(config) => config.digest(self, now),
            None => None,
        };
    }

    pub(crate) fn push_error(&mut self, reason: &FailureReason) {
        self.errors.push(ErrorRecord {
            message: reason.message.clone(),
            stack: reason.stack.clone(),
            attempt: self.attempt,
            attempted_at: self.attempted_at,
            attempt_by: self.claimed_by.clone(),
        });
    }
}

/// Descriptor used to enqueue a job.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub queue: String,
    pub class: String,
    pub args: Vec<JsonValue>,
    pub constructor_args: Vec<JsonValue>,
    pub max_attempts: u32,
    pub timeout: Option<Duration>,
    pub available_at: Option<DateTime<Utc>>,
    delay: Option<Duration>,
    pub uniqueness: Option<UniquenessConfig>,
    pub backoff_strategy: BackoffStrategy,
    pub retry_delay: Option<Duration>,
}

impl NewJob {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            class: class.into(),
            args: Vec::new(),
            constructor_args: Vec::new(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            timeout: None,
            available_at: None,
            delay: None,
            uniqueness: None,
            backoff_strategy: BackoffStrategy::default(),
            retry_delay: None,
        }
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = JsonValue>) -> Self {
        self.args = args.into_iter().collect();
        self
    }

    pub fn arg(mut self, arg: impl Into<JsonValue>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn constructor_args(mut self, args: impl IntoIterator<Item = JsonValue>) -> Self {
        self.constructor_args = args.into_iter().collect();
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Earliest claim time. Overrides any earlier `delay`.
    pub fn available_at(mut self, at: DateTime<Utc>) -> Self {
        self.available_at = Some(at);
        self.delay = None;
        self
    }

    /// Delay relative to the enqueue time. Overrides any earlier `available_at`.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self.available_at = None;
        self
    }

    pub fn unique(mut self, config: UniquenessConfig) -> Self {
        self.uniqueness = Some(config);
        self
    }

    pub fn backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    pub fn validate(&self) -> JobForgeResult<()> {
        if self.class.trim().is_empty() {
            return Err(JobError::validation("job class must not be empty"));
        }
        if self.queue.trim().is_empty() {
            return Err(JobError::validation("queue name must not be empty"));
        }
        if self.max_attempts < 1 {
            return Err(JobError::validation("max_attempts must be at least 1"));
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(JobError::validation("timeout must be greater than zero"));
        }
        if self.backoff_strategy == BackoffStrategy::Fixed && self.retry_delay.is_none() {
            return Err(JobError::validation(
                "fixed backoff requires a retry_delay",
            ));
        }
        Ok(())
    }

    /// Build the `waiting` record to insert, digest included.
    pub fn into_record(self, now: DateTime<Utc>) -> JobForgeResult<JobRecord> {
        self.validate()?;

        let available_at = match self.delay {
            Some(delay) => Some(crate::transition::after(now, delay)),
            None => self.available_at.or(Some(now)),
        };

        let mut record = JobRecord {
            id: JobId::UNASSIGNED,
            queue: self.queue,
            state: JobState::Waiting,
            class: self.class,
            args: self.args,
            constructor_args: self.constructor_args,
            attempt: 0,
            max_attempts: self.max_attempts,
            inserted_at: now,
            available_at,
            attempted_at: None,
            completed_at: None,
            failed_at: None,
            canceled_at: None,
            claimed_at: None,
            claimed_by: None,
            timeout: self.timeout,
            result: None,
            errors: Vec::new(),
            unique_digest: None,
            uniqueness_config: self.uniqueness,
            backoff_strategy: self.backoff_strategy,
            retry_delay: self.retry_delay,
        };
        record.refresh_digest(now);
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_job_builds_waiting_record() {
        let now = Utc::now();
        let job = NewJob::new("send_email")
            .queue("mail")
            .arg(json!("a@example.com"))
            .max_attempts(3)
            .into_record(now)
            .unwrap();

        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.queue, "mail");
        assert_eq!(job.attempt, 0);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.available_at, Some(now));
        assert!(job.unique_digest.is_none());
        assert!(job.is_claimable(now));
    }

    #[test]
    fn delayed_job_is_not_claimable_before_its_time() {
        let now = Utc::now();
        let job = NewJob::new("report")
            .delay(Duration::from_secs(60))
            .into_record(now)
            .unwrap();

        assert!(!job.is_claimable(now));
        assert!(job.is_claimable(now + chrono::Duration::seconds(61)));
    }

    #[test]
    fn validation_rejects_bad_descriptors() {
        assert!(NewJob::new("").validate().is_err());
        assert!(NewJob::new("x").queue(" ").validate().is_err());
        assert!(NewJob::new("x").max_attempts(0).validate().is_err());
        assert!(NewJob::new("x").timeout(Duration::ZERO).validate().is_err());
        assert!(
            NewJob::new("x")
                .backoff(BackoffStrategy::Fixed)
                .validate()
                .is_err()
        );
        assert!(NewJob::new("x").validate().is_ok());
    }

    #[test]
    fn state_round_trips_through_strings() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("zombie".parse::<JobState>().is_err());
    }

    #[test]
    fn failure_reason_captures_source_chain() {
        #[derive(Debug, thiserror::Error)]
        #[error("outer")]
        struct Outer(#[source] std::io::Error);

        let err = Outer(std::io::Error::other("disk full"));
        let reason = FailureReason::from_error(&err);
        assert_eq!(reason.message, "outer");
        assert_eq!(reason.stack.as_deref(), Some("caused by: disk full"));
    }
}
