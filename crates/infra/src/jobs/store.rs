//! Job storage: the store contract and the in-memory backend.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use jobforge_core::{JobError, JobId, JobRecord, JobState, QueueConfig, WorkerId};

/// Job store abstraction.
///
/// The store is the authority for job state. Claims must be exclusive across
/// every process sharing the store, and at most one alive job may carry a given
/// `unique_digest`.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new `waiting` record and assign its id.
    ///
    /// Fails with `DuplicateJob` when an alive job already holds the digest.
    async fn insert(&self, job: JobRecord) -> Result<JobRecord, JobStoreError>;

    /// Get a job by id.
    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError>;

    /// Persist a transitioned record. Fails with `NotFound` for unknown ids.
    async fn update(&self, job: &JobRecord) -> Result<JobRecord, JobStoreError>;

    /// Atomically claim up to `limit` claimable jobs of `queue` for `worker`,
    /// oldest insertion first.
    async fn claim(
        &self,
        queue: &str,
        limit: usize,
        worker: &WorkerId,
    ) -> Result<Vec<JobRecord>, JobStoreError>;

    async fn get_queue_config(&self, name: &str) -> Result<Option<QueueConfig>, JobStoreError>;

    async fn upsert_queue_config(&self, config: &QueueConfig) -> Result<QueueConfig, JobStoreError>;

    /// Store `config` unless its queue already has one; returns whichever is stored.
    async fn create_queue_config(&self, config: &QueueConfig) -> Result<QueueConfig, JobStoreError>;

    async fn list_queue_configs(&self) -> Result<Vec<QueueConfig>, JobStoreError>;

    /// Distinct queue names that hold at least one claimable job right now.
    async fn list_distinct_queues(&self) -> Result<Vec<String>, JobStoreError>;

    /// Jobs whose worker looks gone.
    ///
    /// Running jobs whose `attempted_at` is older than their own timeout (or
    /// `max_stale` without one); claimed jobs whose `claimed_at` is older than
    /// `max_claimed`.
    async fn find_stale(
        &self,
        max_stale: Duration,
        max_claimed: Duration,
    ) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Delete terminal jobs that finished before `cutoff`. Returns the number deleted.
    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, JobStoreError>;

    /// Job counts per state, optionally restricted to one queue.
    async fn count_by_state(&self, queue: Option<&str>) -> Result<JobCounts, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("queue not found: {0}")]
    QueueNotFound(String),
    #[error("duplicate job: unique digest {digest} is already taken")]
    DuplicateJob { digest: String },
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<JobStoreError> for JobError {
    fn from(value: JobStoreError) -> Self {
        match value {
            JobStoreError::NotFound(id) => JobError::not_found(format!("job {id}")),
            JobStoreError::QueueNotFound(name) => JobError::not_found(format!("queue {name}")),
            JobStoreError::DuplicateJob { digest } => JobError::DuplicateJob { digest },
            JobStoreError::Storage(msg) => JobError::execution(format!("storage error: {msg}")),
        }
    }
}

/// Job counts by lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub claimed: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub canceled: u64,
}

impl JobCounts {
    pub fn get(&self, state: JobState) -> u64 {
        match state {
            JobState::Waiting => self.waiting,
            JobState::Claimed => self.claimed,
            JobState::Running => self.running,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
            JobState::Canceled => self.canceled,
        }
    }

    pub fn add(&mut self, state: JobState, n: u64) {
        let slot = match state {
            JobState::Waiting => &mut self.waiting,
            JobState::Claimed => &mut self.claimed,
            JobState::Running => &mut self.running,
            JobState::Completed => &mut self.completed,
            JobState::Failed => &mut self.failed,
            JobState::Canceled => &mut self.canceled,
        };
        *slot += n;
    }

    pub fn total(&self) -> u64 {
        JobState::ALL.iter().map(|s| self.get(*s)).sum()
    }
}

/// In-memory job store for tests/dev.
///
/// Every mutation happens under the jobs write lock, which is what makes
/// `claim` exclusive and the digest check atomic with the write.
#[derive(Debug)]
pub struct InMemoryJobStore {
    jobs: RwLock<BTreeMap<JobId, JobRecord>>,
    queues: RwLock<HashMap<String, QueueConfig>>,
    next_id: AtomicI64,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(BTreeMap::new()),
            queues: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Snapshot of every stored job, ordered by id.
    pub fn all_jobs(&self) -> Vec<JobRecord> {
        self.read_jobs().values().cloned().collect()
    }

    fn read_jobs(&self) -> RwLockReadGuard<'_, BTreeMap<JobId, JobRecord>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_jobs(&self) -> RwLockWriteGuard<'_, BTreeMap<JobId, JobRecord>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_queues(&self) -> RwLockReadGuard<'_, HashMap<String, QueueConfig>> {
        self.queues.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_queues(&self) -> RwLockWriteGuard<'_, HashMap<String, QueueConfig>> {
        self.queues.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Alive-digest constraint: no other alive job may share `job`'s digest.
fn check_unique(jobs: &BTreeMap<JobId, JobRecord>, job: &JobRecord) -> Result<(), JobStoreError> {
    let Some(digest) = job.unique_digest.as_deref() else {
        return Ok(());
    };
    if !job.is_alive() {
        return Ok(());
    }
    let taken = jobs.values().any(|other| {
        other.id != job.id && other.is_alive() && other.unique_digest.as_deref() == Some(digest)
    });
    if taken {
        return Err(JobStoreError::DuplicateJob {
            digest: digest.to_string(),
        });
    }
    Ok(())
}

fn older_than(at: Option<DateTime<Utc>>, window: Duration, now: DateTime<Utc>) -> bool {
    let Some(limit) = chrono::Duration::from_std(window)
        .ok()
        .and_then(|w| now.checked_sub_signed(w))
    else {
        return false;
    };
    at.is_some_and(|at| at < limit)
}

fn finished_at(job: &JobRecord) -> Option<DateTime<Utc>> {
    job.completed_at.or(job.failed_at).or(job.canceled_at)
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, mut job: JobRecord) -> Result<JobRecord, JobStoreError> {
        let mut jobs = self.write_jobs();
        check_unique(&jobs, &job)?;

        job.id = JobId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        Ok(self.read_jobs().get(&id).cloned())
    }

    async fn update(&self, job: &JobRecord) -> Result<JobRecord, JobStoreError> {
        let mut jobs = self.write_jobs();
        if !jobs.contains_key(&job.id) {
            return Err(JobStoreError::NotFound(job.id));
        }
        check_unique(&jobs, job)?;

        jobs.insert(job.id, job.clone());
        Ok(job.clone())
    }

    async fn claim(
        &self,
        queue: &str,
        limit: usize,
        worker: &WorkerId,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut jobs = self.write_jobs();
        let now = Utc::now();

        let mut candidates: Vec<_> = jobs
            .values()
            .filter(|j| j.queue == queue && j.is_claimable(now))
            .map(|j| (j.inserted_at, j.id))
            .collect();

        // FIFO by insertion, id as tie-breaker
        candidates.sort();
        candidates.truncate(limit);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            if let Some(job) = jobs.get_mut(&id) {
                job.mark_claimed(worker, now);
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn get_queue_config(&self, name: &str) -> Result<Option<QueueConfig>, JobStoreError> {
        Ok(self.read_queues().get(name).cloned())
    }

    async fn upsert_queue_config(&self, config: &QueueConfig) -> Result<QueueConfig, JobStoreError> {
        self.write_queues()
            .insert(config.name.clone(), config.clone());
        Ok(config.clone())
    }

    async fn create_queue_config(&self, config: &QueueConfig) -> Result<QueueConfig, JobStoreError> {
        Ok(self
            .write_queues()
            .entry(config.name.clone())
            .or_insert_with(|| config.clone())
            .clone())
    }

    async fn list_queue_configs(&self) -> Result<Vec<QueueConfig>, JobStoreError> {
        let mut configs: Vec<_> = self.read_queues().values().cloned().collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(configs)
    }

    async fn list_distinct_queues(&self) -> Result<Vec<String>, JobStoreError> {
        let now = Utc::now();
        let names: HashSet<String> = self
            .read_jobs()
            .values()
            .filter(|j| j.is_claimable(now))
            .map(|j| j.queue.clone())
            .collect();

        let mut names: Vec<_> = names.into_iter().collect();
        names.sort();
        Ok(names)
    }

    async fn find_stale(
        &self,
        max_stale: Duration,
        max_claimed: Duration,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        let now = Utc::now();
        let stale = self
            .read_jobs()
            .values()
            .filter(|j| match j.state {
                JobState::Running => older_than(j.attempted_at, j.timeout.unwrap_or(max_stale), now),
                JobState::Claimed => older_than(j.claimed_at, max_claimed, now),
                _ => false,
            })
            .cloned()
            .collect();
        Ok(stale)
    }

    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let mut jobs = self.write_jobs();
        let before = jobs.len();
        jobs.retain(|_, j| !(j.state.is_terminal() && finished_at(j).is_some_and(|at| at < cutoff)));
        Ok((before - jobs.len()) as u64)
    }

    async fn count_by_state(&self, queue: Option<&str>) -> Result<JobCounts, JobStoreError> {
        let mut counts = JobCounts::default();
        for job in self.read_jobs().values() {
            if queue.is_none_or(|q| job.queue == q) {
                counts.add(job.state, 1);
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl<T: JobStore + ?Sized> JobStore for Arc<T> {
    async fn insert(&self, job: JobRecord) -> Result<JobRecord, JobStoreError> {
        (**self).insert(job).await
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        (**self).get(id).await
    }

    async fn update(&self, job: &JobRecord) -> Result<JobRecord, JobStoreError> {
        (**self).update(job).await
    }

    async fn claim(
        &self,
        queue: &str,
        limit: usize,
        worker: &WorkerId,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).claim(queue, limit, worker).await
    }

    async fn get_queue_config(&self, name: &str) -> Result<Option<QueueConfig>, JobStoreError> {
        (**self).get_queue_config(name).await
    }

    async fn upsert_queue_config(&self, config: &QueueConfig) -> Result<QueueConfig, JobStoreError> {
        (**self).upsert_queue_config(config).await
    }

    async fn create_queue_config(&self, config: &QueueConfig) -> Result<QueueConfig, JobStoreError> {
        (**self).create_queue_config(config).await
    }

    async fn list_queue_configs(&self) -> Result<Vec<QueueConfig>, JobStoreError> {
        (**self).list_queue_configs().await
    }

    async fn list_distinct_queues(&self) -> Result<Vec<String>, JobStoreError> {
        (**self).list_distinct_queues().await
    }

    async fn find_stale(
        &self,
        max_stale: Duration,
        max_claimed: Duration,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).find_stale(max_stale, max_claimed).await
    }

    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, JobStoreError> {
        (**self).delete_finished_before(cutoff).await
    }

    async fn count_by_state(&self, queue: Option<&str>) -> Result<JobCounts, JobStoreError> {
        (**self).count_by_state(queue).await
    }
}
