//! Background job engine: storage, execution and scheduling.
//!
//! ## Components
//!
//! - `JobStore`: persistence contract, with in-memory and PostgreSQL backends
//! - `JobRunner` / `JobRegistry`: resolve a job class to its handler and run it
//! - `QueueManager`: effective queue configuration and runnable queues
//! - `ExecutorManager`: concurrency slots and single-job execution
//! - `Dispatcher`: the claim loop
//! - `maintenance`: stale-job recovery and retention cleanup
//! - `Engine`: context object wiring the above together

pub mod dispatcher;
pub mod engine;
pub mod executor;
pub mod maintenance;
pub mod postgres;
pub mod queue_manager;
pub mod runner;
pub mod store;

pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherHandle};
pub use engine::Engine;
pub use executor::{ExecutorManager, ExecutorStats, SlotLease, UNLIMITED_SLOTS};
pub use maintenance::{StaleReport, cleanup_finished, release_stale};
pub use postgres::PostgresJobStore;
pub use queue_manager::QueueManager;
pub use runner::{ExecutionError, JobContext, JobOutcome, JobRegistry, JobRunner};
pub use store::{InMemoryJobStore, JobCounts, JobStore, JobStoreError};
