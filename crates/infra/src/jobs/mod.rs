//! Background job system with retry, backoff, and dead-job handling.
//!
//! ## Design
//!
//! - Jobs are persisted rows claimed atomically, delivered at least once
//! - Failed jobs go back to `pending` with backoff until the retry budget is spent
//! - Exhausted jobs end `dead` and wait for an operator (`retry_dead`)
//! - `running` rows abandoned by a crashed worker are recovered without
//!   charging an attempt
//!
//! ## Components
//!
//! - `JobStore`: persistence (`InMemoryJobStore`, `SqliteJobStore`)
//! - `JobQueue`: enqueue, claim-and-run, maintenance
//! - `HandlerRegistry`: job type → handler
//! - `JobProcessor`: polling loop that drives the queue

#[cfg(test)]
#[macro_use]
mod contract;

pub mod handlers;
pub mod processor;
pub mod queue;
pub mod registry;
pub mod sqlite;
pub mod store;
pub mod types;

pub use handlers::{build_handler_registry, HandlerDependencies};
pub use processor::{JobProcessor, ProcessorStats};
pub use queue::{JobEnqueuer, JobOutcome, JobQueue, QueueError};
pub use registry::{HandlerError, HandlerRegistry, JobHandler};
pub use sqlite::SqliteJobStore;
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use types::{
    BackoffPolicy, BackoffStrategy, EnqueueOptions, JobPayload, JobRecord, JobStats, JobStatus,
    JobType, KNOWN_JOB_TYPES,
};
