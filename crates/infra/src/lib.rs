//! `jobforge-infra`: storage backends, execution and the worker runtime.

pub mod config;
pub mod jobs;

pub use config::{EngineConfig, StaleJobPolicy};
pub use jobs::{Engine, InMemoryJobStore, JobRegistry, JobStore, PostgresJobStore};
