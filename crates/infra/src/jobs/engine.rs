//! Engine: the explicit context object tying store, configuration, queue
//! manager and executor together.
//!
//! There is no process-wide state. Applications build one `Engine` at startup,
//! register their handlers in the runner, and share the engine (usually behind
//! an `Arc`) between the code that enqueues jobs and the worker loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use jobforge_core::{JobError, JobForgeResult, JobId, JobRecord, NewJob, QueueConfig, Transition};

use super::dispatcher::{Dispatcher, DispatcherConfig, DispatcherHandle};
use super::executor::{ExecutorManager, ExecutorStats};
use super::maintenance::{self, StaleReport};
use super::postgres::PostgresJobStore;
use super::queue_manager::QueueManager;
use super::runner::JobRunner;
use super::store::{JobCounts, JobStore};
use crate::config::EngineConfig;

pub struct Engine {
    store: Arc<dyn JobStore>,
    config: EngineConfig,
    queues: Arc<QueueManager>,
    executor: Arc<ExecutorManager>,
}

impl Engine {
    pub fn new(store: Arc<dyn JobStore>, runner: Arc<dyn JobRunner>, config: EngineConfig) -> JobForgeResult<Self> {
        config.validate()?;

        let queues = Arc::new(QueueManager::new(
            Arc::clone(&store),
            config.queue_defaults,
            config.queues.clone(),
        ));
        let executor = Arc::new(ExecutorManager::new(
            Arc::clone(&store),
            runner,
            config.max_concurrent_jobs,
        ));

        info!(
            worker = %config.worker_id,
            max_concurrent_jobs = config.max_concurrent_jobs,
            declared_queues = config.queues.len(),
            "job engine initialized"
        );

        Ok(Self {
            store,
            config,
            queues,
            executor,
        })
    }

    /// Engine backed by PostgreSQL at `config.database_url`, schema migrated.
    pub async fn connect_postgres(runner: Arc<dyn JobRunner>, config: EngineConfig) -> JobForgeResult<Self> {
        let url = config
            .database_url
            .as_deref()
            .ok_or_else(|| JobError::validation("database_url is required for the postgres store"))?;

        let store = PostgresJobStore::connect(url).await?;
        store.migrate().await?;
        Self::new(Arc::new(store), runner, config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn queues(&self) -> &Arc<QueueManager> {
        &self.queues
    }

    pub fn executor(&self) -> &Arc<ExecutorManager> {
        &self.executor
    }

    /// Insert a job, creating its queue config on first reference.
    pub async fn enqueue(&self, job: NewJob) -> JobForgeResult<JobRecord> {
        let record = job.into_record(Utc::now())?;
        self.queues.resolve(&record.queue).await?;

        let record = self.store.insert(record).await?;
        debug!(job_id = %record.id, queue = %record.queue, class = %record.class, "job enqueued");
        Ok(record)
    }

    pub async fn get_job(&self, id: JobId) -> JobForgeResult<JobRecord> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| JobError::not_found(format!("job {id}")))
    }

    /// Cancel a waiting or running job.
    ///
    /// A running job executing in this process is aborted; one running
    /// elsewhere stops when its own executor next observes the record. Jobs in
    /// any other state come back unchanged.
    pub async fn cancel_job(&self, id: JobId) -> JobForgeResult<JobRecord> {
        let job = self.transition(id, Transition::Cancel).await?;
        if self.executor.abort(id) {
            info!(job_id = %id, "aborted running job after cancel");
        }
        Ok(job)
    }

    /// Put a finished job back in its queue.
    pub async fn rerun_job(&self, id: JobId) -> JobForgeResult<JobRecord> {
        self.transition(id, Transition::Rerun).await
    }

    pub async fn snooze_job(&self, id: JobId, delay: Duration) -> JobForgeResult<JobRecord> {
        self.transition(id, Transition::snooze(delay)).await
    }

    /// Apply `transition` to the stored job. A failed guard is not persisted.
    async fn transition(&self, id: JobId, transition: Transition) -> JobForgeResult<JobRecord> {
        let job = self.get_job(id).await?;
        if !transition.should_run(&job) {
            debug!(job_id = %id, state = %job.state, transition = transition.name(), "transition not applicable");
            return Ok(job);
        }

        let job = self.store.update(&transition.apply_now(job)).await?;
        info!(job_id = %id, transition = transition.name(), state = %job.state, "job transitioned");
        Ok(job)
    }

    pub async fn pause_queue(&self, name: &str) -> JobForgeResult<QueueConfig> {
        self.queues.pause(name).await
    }

    pub async fn resume_queue(&self, name: &str) -> JobForgeResult<QueueConfig> {
        self.queues.resume(name).await
    }

    pub async fn set_queue_concurrency(&self, name: &str, concurrency: u32) -> JobForgeResult<QueueConfig> {
        self.queues.set_concurrency(name, concurrency).await
    }

    pub async fn set_queue_priority(&self, name: &str, priority: i32) -> JobForgeResult<QueueConfig> {
        self.queues.set_priority(name, priority).await
    }

    pub async fn list_queues(&self) -> JobForgeResult<Vec<QueueConfig>> {
        Ok(self.queues.list().await?)
    }

    /// A dispatcher sharing this engine's executor, so every dispatcher built
    /// from one engine draws on the same global slot budget.
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(
            Arc::clone(&self.store),
            Arc::clone(&self.queues),
            Arc::clone(&self.executor),
            DispatcherConfig {
                worker_id: self.config.worker_id.clone(),
                idle_interval: self.config.idle_interval,
                shutdown_poll_interval: self.config.shutdown_poll_interval,
                max_claim_batch: self.config.max_claim_batch,
            },
        ))
    }

    /// Start a dispatcher in the background.
    pub fn start(&self) -> DispatcherHandle {
        self.dispatcher().start_background()
    }

    pub async fn release_stale(&self) -> JobForgeResult<StaleReport> {
        Ok(maintenance::release_stale(self.store.as_ref(), &self.config.stale).await?)
    }

    /// Delete terminal jobs older than `cleanup_after`.
    pub async fn cleanup_finished(&self) -> JobForgeResult<u64> {
        let cutoff = chrono::Duration::from_std(self.config.cleanup_after)
            .ok()
            .and_then(|after| Utc::now().checked_sub_signed(after))
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        Ok(maintenance::cleanup_finished(self.store.as_ref(), cutoff).await?)
    }

    pub async fn counts(&self, queue: Option<&str>) -> JobForgeResult<JobCounts> {
        Ok(self.store.count_by_state(queue).await?)
    }

    pub fn executor_stats(&self) -> ExecutorStats {
        self.executor.stats()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
