//! Engine configuration.

use std::str::FromStr;
use std::time::Duration;

use jobforge_core::{JobError, JobForgeResult, QueueConfig, QueueDefaults, WorkerId};

/// Liveness windows used by stale-job recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleJobPolicy {
    /// A running job without its own timeout is stale after this long.
    pub max_stale: Duration,
    /// A claimed job that never started is stale after this long.
    pub max_claimed: Duration,
}

impl Default for StaleJobPolicy {
    fn default() -> Self {
        Self {
            max_stale: Duration::from_secs(10 * 60),
            max_claimed: Duration::from_secs(60),
        }
    }
}

/// Configuration shared by the dispatcher, queue manager and executor.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Identity recorded in `claimed_by`
    pub worker_id: WorkerId,
    /// Global cap on concurrently executing jobs in this process
    pub max_concurrent_jobs: usize,
    /// Dispatcher sleep after a pass that claimed nothing
    pub idle_interval: Duration,
    /// How often `stop` checks for in-flight jobs
    pub shutdown_poll_interval: Duration,
    /// Upper bound on a single claim request
    pub max_claim_batch: usize,
    /// Fallback for queues with no stored or declared configuration
    pub queue_defaults: QueueDefaults,
    /// Statically declared queues
    pub queues: Vec<QueueConfig>,
    pub stale: StaleJobPolicy,
    /// Terminal jobs older than this are removed by `cleanup_finished`
    pub cleanup_after: Duration,
    /// Connection string for the Postgres store, when one is used
    pub database_url: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_id: WorkerId::generate(),
            max_concurrent_jobs: 10,
            idle_interval: Duration::from_secs(1),
            shutdown_poll_interval: Duration::from_millis(500),
            max_claim_batch: 20,
            queue_defaults: QueueDefaults::default(),
            queues: Vec::new(),
            stale: StaleJobPolicy::default(),
            cleanup_after: Duration::from_secs(30 * 24 * 60 * 60),
            database_url: None,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `JOBFORGE_*` environment variables and `DATABASE_URL`.
    ///
    /// Unparsable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(worker_id) = lookup("JOBFORGE_WORKER_ID").filter(|v| !v.trim().is_empty()) {
            config.worker_id = WorkerId::new(worker_id);
        }
        if let Some(v) = parse_var(&lookup, "JOBFORGE_MAX_CONCURRENT_JOBS") {
            config.max_concurrent_jobs = v;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "JOBFORGE_IDLE_INTERVAL_MS") {
            config.idle_interval = Duration::from_millis(ms);
        }
        if let Some(v) = parse_var(&lookup, "JOBFORGE_MAX_CLAIM_BATCH") {
            config.max_claim_batch = v;
        }
        config.database_url = lookup("DATABASE_URL");

        config
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<WorkerId>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max;
        self
    }

    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    pub fn with_shutdown_poll_interval(mut self, interval: Duration) -> Self {
        self.shutdown_poll_interval = interval;
        self
    }

    pub fn with_max_claim_batch(mut self, max: usize) -> Self {
        self.max_claim_batch = max;
        self
    }

    pub fn with_queue_defaults(mut self, defaults: QueueDefaults) -> Self {
        self.queue_defaults = defaults;
        self
    }

    /// Declare a queue statically. Later declarations of the same name win.
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queues.retain(|q| q.name != queue.name);
        self.queues.push(queue);
        self
    }

    pub fn with_stale_policy(mut self, policy: StaleJobPolicy) -> Self {
        self.stale = policy;
        self
    }

    pub fn with_cleanup_after(mut self, after: Duration) -> Self {
        self.cleanup_after = after;
        self
    }

    pub fn validate(&self) -> JobForgeResult<()> {
        if self.max_concurrent_jobs < 1 {
            return Err(JobError::validation("max_concurrent_jobs must be at least 1"));
        }
        if self.max_claim_batch < 1 {
            return Err(JobError::validation("max_claim_batch must be at least 1"));
        }
        if self.worker_id.as_str().trim().is_empty() {
            return Err(JobError::validation("worker_id must not be empty"));
        }
        for queue in &self.queues {
            queue.validate()?;
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "ignoring invalid environment value; using default");
            None
        }
    }
}
