//! Executor manager: slot accounting and single-job execution.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use jobforge_core::{JobId, JobRecord, JobResult, JobState, QueueConfig, Transition};

use super::runner::{ExecutionError, JobRunner};
use super::store::{JobStore, JobStoreError};

/// Slot count reported for queues with unlimited concurrency.
///
/// Callers cap claims with their own batch limit.
pub const UNLIMITED_SLOTS: usize = usize::MAX;

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_retried: u64,
    pub jobs_snoozed: u64,
    pub jobs_aborted: u64,
    pub jobs_released: u64,
    pub current_running: usize,
}

#[derive(Debug, Default)]
struct Slots {
    global: HashMap<JobId, CancellationToken>,
    by_queue: HashMap<String, HashSet<JobId>>,
}

/// Tracks concurrency slots and runs claimed jobs.
///
/// The active-id sets are the only in-process shared state; they live behind
/// one mutex so reserving a slot and counting free ones never interleave.
pub struct ExecutorManager {
    store: Arc<dyn JobStore>,
    runner: Arc<dyn JobRunner>,
    max_concurrent_jobs: usize,
    slots: Mutex<Slots>,
    stats: Mutex<ExecutorStats>,
}

/// A reserved slot in both the queue set and the global set.
///
/// Dropping the lease frees the slot, whichever path the execution takes.
pub struct SlotLease {
    manager: Arc<ExecutorManager>,
    queue: String,
    job_id: JobId,
    cancel: CancellationToken,
}

impl SlotLease {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        let mut slots = self.manager.lock_slots();
        slots.global.remove(&self.job_id);
        if let Some(active) = slots.by_queue.get_mut(&self.queue) {
            active.remove(&self.job_id);
            if active.is_empty() {
                slots.by_queue.remove(&self.queue);
            }
        }
    }
}

impl std::fmt::Debug for SlotLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotLease")
            .field("queue", &self.queue)
            .field("job_id", &self.job_id)
            .finish()
    }
}

/// How a run ended, before bookkeeping.
enum RunEnd {
    Result(JobResult),
    Error(ExecutionError),
}

impl ExecutorManager {
    pub fn new(store: Arc<dyn JobStore>, runner: Arc<dyn JobRunner>, max_concurrent_jobs: usize) -> Self {
        Self {
            store,
            runner,
            max_concurrent_jobs,
            slots: Mutex::new(Slots::default()),
            stats: Mutex::new(ExecutorStats::default()),
        }
    }

    fn lock_slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_stats(&self) -> MutexGuard<'_, ExecutorStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_concurrent_jobs(&self) -> usize {
        self.max_concurrent_jobs
    }

    /// Free slots for `queue`; [`UNLIMITED_SLOTS`] when its concurrency is 0.
    pub fn available_slots_by_queue(&self, queue: &QueueConfig) -> usize {
        Self::queue_slots(&self.lock_slots(), queue)
    }

    pub fn available_slots_global(&self) -> usize {
        self.max_concurrent_jobs
            .saturating_sub(self.lock_slots().global.len())
    }

    fn queue_slots(slots: &Slots, queue: &QueueConfig) -> usize {
        if queue.is_unlimited() {
            return UNLIMITED_SLOTS;
        }
        let active = slots.by_queue.get(&queue.name).map_or(0, HashSet::len);
        (queue.concurrency as usize).saturating_sub(active)
    }

    /// Number of jobs executing right now.
    pub fn active_count(&self) -> usize {
        self.lock_slots().global.len()
    }

    pub fn active_in_queue(&self, queue: &str) -> usize {
        self.lock_slots().by_queue.get(queue).map_or(0, HashSet::len)
    }

    pub fn is_active(&self, job_id: JobId) -> bool {
        self.lock_slots().global.contains_key(&job_id)
    }

    /// Reserve one queue slot and one global slot for `job_id`.
    ///
    /// Returns `None` when either is exhausted or the job already holds one.
    pub fn reserve(self: &Arc<Self>, queue: &QueueConfig, job_id: JobId) -> Option<SlotLease> {
        let mut slots = self.lock_slots();
        if slots.global.contains_key(&job_id)
            || slots.global.len() >= self.max_concurrent_jobs
            || Self::queue_slots(&slots, queue) == 0
        {
            return None;
        }

        let cancel = CancellationToken::new();
        slots.global.insert(job_id, cancel.clone());
        slots
            .by_queue
            .entry(queue.name.clone())
            .or_default()
            .insert(job_id);

        Some(SlotLease {
            manager: Arc::clone(self),
            queue: queue.name.clone(),
            job_id,
            cancel,
        })
    }

    /// Fire the abort signal of an executing job. Returns whether it was active here.
    pub fn abort(&self, job_id: JobId) -> bool {
        match self.lock_slots().global.get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Abort every executing job.
    pub fn abort_all(&self) -> usize {
        let slots = self.lock_slots();
        for token in slots.global.values() {
            token.cancel();
        }
        slots.global.len()
    }

    pub fn stats(&self) -> ExecutorStats {
        let mut stats = self.lock_stats().clone();
        stats.current_running = self.active_count();
        stats
    }

    /// Run one claimed job to completion and persist its final transition.
    ///
    /// Without a free queue or global slot the job is not run: it is released
    /// back to `waiting` so a later pass claims it again.
    pub async fn execute(self: &Arc<Self>, queue: &QueueConfig, job: JobRecord) -> Result<JobRecord, JobStoreError> {
        match self.reserve(queue, job.id) {
            Some(lease) => self.run_leased(lease, job).await,
            None => self.release(job).await,
        }
    }

    /// Put a claimed job back to `waiting` without consuming an attempt.
    pub async fn release(&self, job: JobRecord) -> Result<JobRecord, JobStoreError> {
        debug!(job_id = %job.id, queue = %job.queue, "no free slot; releasing claimed job");
        let released = self.store.update(&Transition::Release.apply_now(job)).await?;
        self.lock_stats().jobs_released += 1;
        Ok(released)
    }

    /// [`ExecutorManager::execute`] for a job whose slot is already reserved.
    pub async fn run_leased(&self, lease: SlotLease, job: JobRecord) -> Result<JobRecord, JobStoreError> {
        let job = Transition::Run.apply_now(job);
        if job.state != JobState::Running {
            warn!(job_id = %job.id, state = %job.state, "job is not claimed; skipping execution");
            return Ok(job);
        }
        let job = self.store.update(&job).await?;

        debug!(
            job_id = %job.id,
            queue = %job.queue,
            class = %job.class,
            attempt = job.attempt,
            "running job"
        );

        let end = self.run_with_timeout(&job, lease.cancel.clone()).await;

        let transition = match end {
            RunEnd::Result(result) => Transition::from(result),
            RunEnd::Error(err) => {
                if matches!(err, ExecutionError::Aborted | ExecutionError::Timeout(_))
                    && self.was_canceled(job.id).await
                {
                    info!(job_id = %job.id, "job was canceled while running; skipping bookkeeping");
                    self.record(|s| s.jobs_aborted += 1);
                    drop(lease);
                    return self
                        .store
                        .get(job.id)
                        .await?
                        .ok_or(JobStoreError::NotFound(job.id));
                }
                warn!(job_id = %job.id, queue = %job.queue, error = %err, "job attempt failed");
                if matches!(err, ExecutionError::Aborted) {
                    self.record(|s| s.jobs_aborted += 1);
                }
                Transition::retry(err.failure_reason())
            }
        };

        let finished = transition.apply_now(job);
        let persisted = self.store.update(&finished).await;
        drop(lease);

        let persisted = persisted.inspect_err(|e| {
            error!(job_id = %finished.id, transition = transition.name(), error = %e, "failed to persist job transition");
        })?;

        self.record(|s| {
            s.jobs_processed += 1;
            match persisted.state {
                JobState::Completed => s.jobs_completed += 1,
                JobState::Failed => s.jobs_failed += 1,
                JobState::Waiting if matches!(transition, Transition::Snooze { .. }) => s.jobs_snoozed += 1,
                JobState::Waiting => s.jobs_retried += 1,
                _ => {}
            }
        });
        debug!(
            job_id = %persisted.id,
            transition = transition.name(),
            state = %persisted.state,
            "job finished"
        );
        Ok(persisted)
    }

    async fn run_with_timeout(&self, job: &JobRecord, cancel: CancellationToken) -> RunEnd {
        let run = self.runner.run(job.clone(), cancel.clone());
        tokio::pin!(run);

        let outcome = match job.timeout {
            Some(timeout) => {
                tokio::select! {
                    outcome = &mut run => outcome,
                    _ = tokio::time::sleep(timeout) => {
                        cancel.cancel();
                        // Let the runner observe the abort; a result that beat it still counts.
                        match run.await {
                            Ok(result) => Ok(result),
                            Err(_) => Err(ExecutionError::Timeout(timeout)),
                        }
                    }
                }
            }
            None => run.await,
        };

        match outcome {
            Ok(result) => RunEnd::Result(result),
            Err(err) => RunEnd::Error(err),
        }
    }

    async fn was_canceled(&self, job_id: JobId) -> bool {
        match self.store.get(job_id).await {
            Ok(Some(job)) => job.state == JobState::Canceled,
            Ok(None) => false,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "could not re-read job after abort");
                false
            }
        }
    }

    fn record(&self, update: impl FnOnce(&mut ExecutorStats)) {
        update(&mut self.lock_stats());
    }
}
