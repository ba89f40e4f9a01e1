//! Periodic maintenance: stale-job recovery and retention cleanup.
//!
//! Both routines are meant to be driven by an external schedule (cron, a
//! `tokio::time::interval` in the host application). They only talk to the
//! [`JobStore`], so any worker process may run them.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use jobforge_core::{JobRecord, JobState, Transition};

use super::store::{JobStore, JobStoreError};
use crate::config::StaleJobPolicy;

const STALE_REASON: &str = "stale job released";

/// Outcome of a [`release_stale`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StaleReport {
    /// Claimed jobs that never started, returned to `waiting`
    pub released: usize,
    /// Interrupted runs recorded as a failed attempt
    pub retried: usize,
    /// Jobs whose update failed; they are picked up again next run
    pub skipped: usize,
}

impl StaleReport {
    pub fn total(&self) -> usize {
        self.released + self.retried
    }
}

/// Return jobs abandoned by crashed workers to the queue.
///
/// A stale `claimed` job never ran, so it is released without touching its
/// attempt count. A stale `running` job lost its attempt: it is retried with
/// no delay, or failed when that was its last attempt.
pub async fn release_stale(store: &dyn JobStore, policy: &StaleJobPolicy) -> Result<StaleReport, JobStoreError> {
    let stale = store.find_stale(policy.max_stale, policy.max_claimed).await?;
    let mut report = StaleReport::default();

    for job in stale {
        let id = job.id;
        let state = job.state;
        let Some(transition) = recovery_for(&job) else {
            continue;
        };

        let updated = transition.apply_now(job);
        match store.update(&updated).await {
            Ok(_) if state == JobState::Claimed => report.released += 1,
            Ok(_) => report.retried += 1,
            Err(e) => {
                warn!(job_id = %id, error = %e, "failed to release stale job");
                report.skipped += 1;
            }
        }
    }

    if report.total() > 0 || report.skipped > 0 {
        info!(
            released = report.released,
            retried = report.retried,
            skipped = report.skipped,
            "released stale jobs"
        );
    }
    Ok(report)
}

fn recovery_for(job: &JobRecord) -> Option<Transition> {
    match job.state {
        JobState::Claimed => Some(Transition::Release),
        JobState::Running => Some(Transition::retry_after(STALE_REASON, std::time::Duration::ZERO)),
        _ => None,
    }
}

/// Delete terminal jobs that finished before `cutoff`.
pub async fn cleanup_finished(store: &dyn JobStore, cutoff: DateTime<Utc>) -> Result<u64, JobStoreError> {
    let deleted = store.delete_finished_before(cutoff).await?;
    if deleted > 0 {
        info!(deleted, cutoff = %cutoff, "cleaned up finished jobs");
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use jobforge_core::NewJob;
    use std::time::Duration;

    fn policy() -> StaleJobPolicy {
        StaleJobPolicy {
            max_stale: Duration::from_secs(600),
            max_claimed: Duration::from_secs(60),
        }
    }

    async fn insert(store: &InMemoryJobStore, job: NewJob) -> JobRecord {
        store.insert(job.into_record(Utc::now()).unwrap()).await.unwrap()
    }

    /// Force a job into `state`, with its claim/attempt timestamps `age` in the past.
    async fn age(store: &InMemoryJobStore, mut job: JobRecord, state: JobState, age: chrono::Duration) -> JobRecord {
        let at = Utc::now() - age;
        job.state = state;
        job.claimed_at = Some(at);
        job.claimed_by = Some("crashed".to_string());
        if state == JobState::Running {
            job.attempted_at = Some(at);
            job.attempt += 1;
        }
        store.update(&job).await.unwrap()
    }

    #[tokio::test]
    async fn stale_claimed_job_is_released_without_an_attempt() {
        let store = InMemoryJobStore::new();
        let job = insert(&store, NewJob::new("x")).await;
        let job = age(&store, job, JobState::Claimed, chrono::Duration::minutes(5)).await;

        let report = release_stale(&store, &policy()).await.unwrap();
        assert_eq!(report.released, 1);

        let job = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.attempt, 0);
        assert!(job.claimed_at.is_none() && job.claimed_by.is_none());
    }

    #[tokio::test]
    async fn stale_running_job_is_retried_with_an_error_entry() {
        let store = InMemoryJobStore::new();
        let job = insert(&store, NewJob::new("x").max_attempts(3)).await;
        let job = age(&store, job, JobState::Running, chrono::Duration::minutes(30)).await;

        let report = release_stale(&store, &policy()).await.unwrap();
        assert_eq!(report.retried, 1);

        let job = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.errors.len(), 1);
        assert_eq!(job.errors[0].message, STALE_REASON);
        assert!(job.is_claimable(Utc::now()));
    }

    #[tokio::test]
    async fn stale_last_attempt_fails() {
        let store = InMemoryJobStore::new();
        let job = insert(&store, NewJob::new("x").max_attempts(1)).await;
        let job = age(&store, job, JobState::Running, chrono::Duration::minutes(30)).await;

        release_stale(&store, &policy()).await.unwrap();

        let job = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.failed_at.is_some());
    }

    #[tokio::test]
    async fn job_timeout_overrides_max_stale() {
        let store = InMemoryJobStore::new();
        let short = insert(&store, NewJob::new("x").timeout(Duration::from_secs(10))).await;
        let long = insert(&store, NewJob::new("x")).await;
        age(&store, short, JobState::Running, chrono::Duration::minutes(1)).await;
        age(&store, long, JobState::Running, chrono::Duration::minutes(1)).await;

        let report = release_stale(&store, &policy()).await.unwrap();
        assert_eq!(report.retried, 1);
    }

    #[tokio::test]
    async fn fresh_jobs_are_left_alone() {
        let store = InMemoryJobStore::new();
        let job = insert(&store, NewJob::new("x")).await;
        age(&store, job, JobState::Claimed, chrono::Duration::seconds(5)).await;

        assert_eq!(release_stale(&store, &policy()).await.unwrap(), StaleReport::default());
    }

    #[tokio::test]
    async fn cleanup_removes_only_old_terminal_jobs() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let mut old = insert(&store, NewJob::new("x")).await;
        old.state = JobState::Completed;
        old.completed_at = Some(now - chrono::Duration::days(40));
        store.update(&old).await.unwrap();

        let mut recent = insert(&store, NewJob::new("x")).await;
        recent.state = JobState::Failed;
        recent.failed_at = Some(now - chrono::Duration::days(1));
        store.update(&recent).await.unwrap();

        let waiting = insert(&store, NewJob::new("x")).await;

        let deleted = cleanup_finished(&store, now - chrono::Duration::days(30)).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get(old.id).await.unwrap().is_none());
        assert!(store.get(recent.id).await.unwrap().is_some());
        assert!(store.get(waiting.id).await.unwrap().is_some());
    }
}
