//! Durable multi-tenant job queue.
//!
//! - [`JobStore`]: atomic insert / claim / conditional update / tenant-scoped read,
//!   with in-memory and Postgres implementations
//! - [`EnqueueService`] and [`StatusReader`]: the client-facing operations
//! - [`Dispatcher`]: the claim-execute-record loop
//! - [`RetryPolicy`] and [`HandlerRegistry`]: what the loop does on failure and
//!   how it finds the code for a job type

mod enqueue;
mod error;
mod executor;
pub mod handlers;
mod postgres;
mod registry;
mod retry;
mod status;
mod store;
mod types;

pub use enqueue::{EnqueueReceipt, EnqueueRequest, EnqueueService, MAX_IDEMPOTENCY_KEY_LEN};
pub use error::JobServiceError;
pub use executor::{
    Dispatcher, DispatcherConfig, DispatcherHandle, DispatcherStats, IdleBackoff, JobOutcome, Tick,
};
pub use postgres::PostgresJobStore;
pub use registry::{FnHandler, HandlerError, HandlerRegistry, JobHandler};
pub use retry::{BackoffStrategy, MAX_ERROR_LEN, RetryDecision, RetryPolicy};
pub use status::StatusReader;
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use types::{DEFAULT_MAX_ATTEMPTS, InsertOutcome, Job, NewJob, StatusUpdate};
