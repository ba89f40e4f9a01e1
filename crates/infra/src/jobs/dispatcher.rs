//! Dispatch loop: claims work under the concurrency limits and hands it to the executor.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use jobforge_core::{JobRecord, QueueConfig, WorkerId};

use super::executor::ExecutorManager;
use super::queue_manager::QueueManager;
use super::store::{JobStore, JobStoreError};

/// Settings for one dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub worker_id: WorkerId,
    pub idle_interval: Duration,
    pub shutdown_poll_interval: Duration,
    pub max_claim_batch: usize,
}

/// Top-level scheduling loop of a worker process.
///
/// Each pass walks the runnable queues in priority order, claims up to
/// `min(queue slots, global slots)` jobs per queue and starts them without
/// waiting for them to finish. A pass that starts nothing is followed by an
/// idle sleep.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    queues: Arc<QueueManager>,
    executor: Arc<ExecutorManager>,
    config: DispatcherConfig,
    stopped: CancellationToken,
    /// Set while [`Dispatcher::run`] is inside its loop.
    looping: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        queues: Arc<QueueManager>,
        executor: Arc<ExecutorManager>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            queues,
            executor,
            config,
            stopped: CancellationToken::new(),
            looping: AtomicBool::new(false),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    /// Run passes until [`Dispatcher::stop`] is called.
    pub async fn run(&self) {
        info!(worker = %self.config.worker_id, "dispatcher started");
        let _looping = LoopingGuard::enter(&self.looping);

        while !self.stopped.is_cancelled() {
            let started = match self.tick().await {
                Ok(started) => started,
                Err(e) => {
                    error!(worker = %self.config.worker_id, error = %e, "dispatch pass failed");
                    0
                }
            };

            if started == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.idle_interval) => {}
                    _ = self.stopped.cancelled() => {}
                }
            } else {
                tokio::task::yield_now().await;
            }
        }

        info!(worker = %self.config.worker_id, "dispatcher stopped");
    }

    /// One dispatch pass. Returns the number of jobs started.
    pub async fn tick(&self) -> Result<usize, JobStoreError> {
        let queues = self.queues.runnable_queues().await?;
        let mut started = 0;

        for queue in queues {
            if self.stopped.is_cancelled() {
                break;
            }

            let slots = self
                .executor
                .available_slots_by_queue(&queue)
                .min(self.executor.available_slots_global());
            if slots == 0 {
                continue;
            }

            let limit = slots.min(self.config.max_claim_batch);
            let jobs = match self.store.claim(&queue.name, limit, &self.config.worker_id).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    error!(queue = %queue.name, error = %e, "failed to claim jobs");
                    continue;
                }
            };
            if self.stopped.is_cancelled() {
                // Stopped while the claim was in flight: hand the jobs back.
                self.release_all(&queue, jobs).await;
                break;
            }
            if !jobs.is_empty() {
                debug!(queue = %queue.name, claimed = jobs.len(), limit, "claimed jobs");
            }

            for job in jobs {
                if self.start(&queue, job).await {
                    started += 1;
                }
            }
        }

        Ok(started)
    }

    async fn release_all(&self, queue: &QueueConfig, jobs: Vec<JobRecord>) {
        for job in jobs {
            let job_id = job.id;
            if let Err(e) = self.executor.release(job).await {
                error!(queue = %queue.name, job_id = %job_id, error = %e, "failed to release claimed job");
            }
        }
    }

    /// Reserve a slot and spawn the execution; release the job when no slot is left.
    async fn start(&self, queue: &QueueConfig, job: JobRecord) -> bool {
        let Some(lease) = self.executor.reserve(queue, job.id) else {
            if let Err(e) = self.executor.release(job).await {
                error!(queue = %queue.name, error = %e, "failed to release claimed job");
            }
            return false;
        };

        let executor = Arc::clone(&self.executor);
        tokio::spawn(async move {
            let job_id = job.id;
            if let Err(e) = executor.run_leased(lease, job).await {
                error!(job_id = %job_id, error = %e, "job bookkeeping failed");
            }
        });
        true
    }

    /// Stop claiming, then wait until the loop has left its current pass and
    /// no job is executing.
    pub async fn stop(&self) {
        self.stopped.cancel();

        while self.looping.load(Ordering::Acquire) {
            tokio::time::sleep(self.config.shutdown_poll_interval).await;
        }

        let active = self.executor.active_count();
        if active > 0 {
            info!(active, "dispatcher stopping; waiting for in-flight jobs");
        }
        while self.executor.active_count() > 0 {
            tokio::time::sleep(self.config.shutdown_poll_interval).await;
        }
    }

    /// Spawn [`Dispatcher::run`] on the runtime.
    pub fn start_background(self: Arc<Self>) -> DispatcherHandle {
        let dispatcher = Arc::clone(&self);
        let join = tokio::spawn(async move { dispatcher.run().await });
        DispatcherHandle {
            dispatcher: self,
            join,
        }
    }
}

/// Clears the looping flag however `run` exits.
struct LoopingGuard<'a>(&'a AtomicBool);

impl<'a> LoopingGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for LoopingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Handle to a dispatcher running in the background.
#[derive(Debug)]
pub struct DispatcherHandle {
    dispatcher: Arc<Dispatcher>,
    join: JoinHandle<()>,
}

impl DispatcherHandle {
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Graceful shutdown: stop claiming, join the loop, then wait for in-flight jobs.
    pub async fn shutdown(self) {
        self.dispatcher.stopped.cancel();
        if let Err(e) = self.join.await {
            error!(error = %e, "dispatcher task ended abnormally");
        }
        self.dispatcher.stop().await;
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
