//! Job state machine.
//!
//! ```text
//!            claim (store)        Run
//! waiting ───────────────▶ claimed ──────▶ running ──▶ completed | failed | canceled
//!    ▲                        │                │
//!    │        Release         │   Retry/Snooze │
//!    ├────────────────────────┘                │
//!    └─────────────────────────────────────────┘
//!    ▲
//!    └── Rerun (from completed | failed | canceled)
//! ```
//!
//! Every transition is a pure step `apply(job, now) -> job'` behind a guard.
//! A failed guard is not an error: the record comes back untouched and the
//! caller observes that nothing changed. After a successful step the unique
//! digest is recomputed, since the alive strategy depends on the state.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use crate::error::{JobError, JobForgeResult};
use crate::job::{FailureReason, JobRecord, JobResult, JobState};

#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// `claimed` → `running`, counting one attempt.
    Run,
    /// `running` → `completed` with a result.
    Complete { result: JsonValue },
    /// `running` → `failed`, recording the error.
    Fail { reason: FailureReason },
    /// `running` → `waiting` after a delay, or `failed` when out of attempts.
    Retry {
        reason: FailureReason,
        delay: Option<Duration>,
    },
    /// Any state → `waiting` after `delay`, giving back the current attempt.
    Snooze { delay: Duration },
    /// `waiting` | `running` → `canceled`.
    Cancel,
    /// `completed` | `failed` | `canceled` → `waiting`, granting one more attempt if needed.
    Rerun,
    /// `claimed` → `waiting`, dropping the claim without touching `attempt`.
    Release,
}

impl Transition {
    pub fn complete(result: impl Into<JsonValue>) -> Self {
        Self::Complete {
            result: result.into(),
        }
    }

    pub fn fail(reason: impl Into<FailureReason>) -> Self {
        Self::Fail {
            reason: reason.into(),
        }
    }

    pub fn retry(reason: impl Into<FailureReason>) -> Self {
        Self::Retry {
            reason: reason.into(),
            delay: None,
        }
    }

    pub fn retry_after(reason: impl Into<FailureReason>, delay: Duration) -> Self {
        Self::Retry {
            reason: reason.into(),
            delay: Some(delay),
        }
    }

    pub fn snooze(delay: Duration) -> Self {
        Self::Snooze { delay }
    }

    /// Snooze from a signed millisecond delay, rejecting negatives.
    pub fn snooze_millis(delay_ms: i64) -> JobForgeResult<Self> {
        let delay_ms = u64::try_from(delay_ms).map_err(|_| {
            JobError::validation(format!("snooze delay must not be negative (got {delay_ms}ms)"))
        })?;
        Ok(Self::snooze(Duration::from_millis(delay_ms)))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Transition::Run => "run",
            Transition::Complete { .. } => "complete",
            Transition::Fail { .. } => "fail",
            Transition::Retry { .. } => "retry",
            Transition::Snooze { .. } => "snooze",
            Transition::Cancel => "cancel",
            Transition::Rerun => "rerun",
            Transition::Release => "release",
        }
    }

    /// Guard: whether this transition applies to `job` in its current state.
    pub fn should_run(&self, job: &JobRecord) -> bool {
        use JobState::*;

        match self {
            Transition::Run => job.state == Claimed,
            Transition::Complete { .. } | Transition::Fail { .. } | Transition::Retry { .. } => {
                job.state == Running
            }
            Transition::Snooze { .. } => true,
            Transition::Cancel => matches!(job.state, Waiting | Running),
            Transition::Rerun => matches!(job.state, Completed | Failed | Canceled),
            Transition::Release => job.state == Claimed,
        }
    }

    /// Apply the transition. Returns `job` unchanged when the guard fails.
    pub fn apply(&self, mut job: JobRecord, now: DateTime<Utc>) -> JobRecord {
        if !self.should_run(&job) {
            return job;
        }

        match self {
            Transition::Run => {
                job.state = JobState::Running;
                job.attempted_at = Some(now);
                job.attempt += 1;
            }
            Transition::Complete { result } => {
                job.state = JobState::Completed;
                job.completed_at = Some(now);
                job.result = Some(result.clone());
            }
            Transition::Fail { reason } => {
                job.push_error(reason);
                job.state = JobState::Failed;
                job.failed_at = Some(now);
            }
            Transition::Retry { reason, delay } => {
                job.push_error(reason);
                if job.attempt >= job.max_attempts {
                    job.state = JobState::Failed;
                    job.failed_at = Some(now);
                } else {
                    let delay = delay.unwrap_or_else(|| {
                        job.backoff_strategy.delay_for(job.attempt, job.retry_delay)
                    });
                    job.state = JobState::Waiting;
                    job.available_at = Some(after(now, delay));
                }
            }
            Transition::Snooze { delay } => {
                clear_terminal(&mut job);
                job.state = JobState::Waiting;
                job.attempt = job.attempt.saturating_sub(1);
                job.available_at = Some(after(now, *delay));
            }
            Transition::Cancel => {
                job.state = JobState::Canceled;
                job.canceled_at = Some(now);
            }
            Transition::Rerun => {
                clear_terminal(&mut job);
                job.state = JobState::Waiting;
                job.available_at = Some(now);
                if job.attempt >= job.max_attempts {
                    job.max_attempts = job.attempt + 1;
                }
            }
            Transition::Release => {
                job.state = JobState::Waiting;
                job.available_at = Some(now);
                job.claimed_at = None;
                job.claimed_by = None;
            }
        }

        if job.uniqueness_config.is_some() {
            job.refresh_digest(now);
        }
        job
    }

    /// [`Transition::apply`] at the current wall-clock time.
    pub fn apply_now(&self, job: JobRecord) -> JobRecord {
        self.apply(job, Utc::now())
    }
}

impl From<JobResult> for Transition {
    fn from(value: JobResult) -> Self {
        match value {
            JobResult::Completed { result } => Transition::Complete { result },
            JobResult::Failed { error } => Transition::Fail { reason: error },
            JobResult::Retry { error, delay } => Transition::Retry {
                reason: error,
                delay,
            },
            JobResult::Snooze { delay } => Transition::Snooze { delay },
        }
    }
}

pub(crate) fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn clear_terminal(job: &mut JobRecord) {
    job.completed_at = None;
    job.failed_at = None;
    job.canceled_at = None;
    job.result = None;
}
