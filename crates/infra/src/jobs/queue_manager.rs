//! Queue resolution and administration.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use jobforge_core::{JobForgeResult, QueueConfig, QueueDefaults, QueueState};

use super::store::{JobStore, JobStoreError};

/// Resolves effective queue configuration and lists runnable queues.
///
/// Nothing is cached: every dispatch pass re-reads the store, so pauses and
/// priority edits made by another process take effect on the next pass.
pub struct QueueManager {
    store: Arc<dyn JobStore>,
    defaults: QueueDefaults,
    declared: HashMap<String, QueueConfig>,
}

impl QueueManager {
    pub fn new(store: Arc<dyn JobStore>, defaults: QueueDefaults, declared: Vec<QueueConfig>) -> Self {
        Self {
            store,
            defaults,
            declared: declared.into_iter().map(|q| (q.name.clone(), q)).collect(),
        }
    }

    /// Stored config for `name`, created from the declared config or the
    /// defaults on first reference. A config another process stored in the
    /// meantime wins over the one built here.
    pub async fn resolve(&self, name: &str) -> Result<QueueConfig, JobStoreError> {
        if let Some(config) = self.store.get_queue_config(name).await? {
            return Ok(config);
        }

        let config = self
            .declared
            .get(name)
            .cloned()
            .unwrap_or_else(|| QueueConfig::from_defaults(name, &self.defaults));
        debug!(queue = %name, concurrency = config.concurrency, priority = config.priority, "creating queue config");
        self.store.create_queue_config(&config).await
    }

    /// Active queues with claimable work, highest priority first.
    pub async fn runnable_queues(&self) -> Result<Vec<QueueConfig>, JobStoreError> {
        let names = self.store.list_distinct_queues().await?;

        let mut queues = Vec::with_capacity(names.len());
        for name in names {
            let config = self.resolve(&name).await?;
            if !config.is_paused() {
                queues.push(config);
            }
        }

        queues.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(queues)
    }

    pub async fn list(&self) -> Result<Vec<QueueConfig>, JobStoreError> {
        self.store.list_queue_configs().await
    }

    pub async fn pause(&self, name: &str) -> JobForgeResult<QueueConfig> {
        self.modify(name, |q| q.state = QueueState::Paused).await
    }

    pub async fn resume(&self, name: &str) -> JobForgeResult<QueueConfig> {
        self.modify(name, |q| q.state = QueueState::Active).await
    }

    /// `0` makes the queue unlimited.
    pub async fn set_concurrency(&self, name: &str, concurrency: u32) -> JobForgeResult<QueueConfig> {
        self.modify(name, |q| q.concurrency = concurrency).await
    }

    pub async fn set_priority(&self, name: &str, priority: i32) -> JobForgeResult<QueueConfig> {
        self.modify(name, |q| q.priority = priority).await
    }

    async fn modify(&self, name: &str, change: impl FnOnce(&mut QueueConfig)) -> JobForgeResult<QueueConfig> {
        let mut config = self.resolve(name).await?;
        change(&mut config);
        config.validate()?;

        let config = self.store.upsert_queue_config(&config).await?;
        info!(
            queue = %config.name,
            state = config.state.as_str(),
            concurrency = config.concurrency,
            priority = config.priority,
            "queue updated"
        );
        Ok(config)
    }
}
