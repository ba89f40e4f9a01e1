//! `jobforge-core` — job lifecycle building blocks.
//!
//! This crate contains the **pure** parts of the job engine: the job record and
//! queue configuration data model, the state machine (transitions and their
//! guards), retry backoff and deduplication digests. Nothing here performs IO;
//! storage, execution and scheduling live in `jobforge-infra`.

pub mod backoff;
pub mod error;
pub mod id;
pub mod job;
pub mod queue;
pub mod transition;
pub mod uniqueness;

pub use backoff::{BackoffStrategy, backoff_delay, backoff_delay_with_jitter};
pub use error::{JobError, JobForgeResult};
pub use id::{JobId, WorkerId};
pub use job::{ErrorRecord, FailureReason, JobRecord, JobResult, JobState, NewJob};
pub use queue::{QueueConfig, QueueDefaults, QueueState};
pub use transition::Transition;
pub use uniqueness::{TimePeriod, UniquenessConfig};
