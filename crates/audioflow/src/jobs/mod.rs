pub mod breaker;
pub mod config;
pub mod dispatch;
pub mod executor;
pub mod model;
pub mod retry;
pub mod store;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use config::{estimate_duration, JobConfig, DEFAULT_ESTIMATED_DURATION};
pub use dispatch::{DispatchHandle, ExecutionBackend, InlineBackend, PoolBackend};
pub use executor::{structure_result, JobExecutor, Outcome};
pub use model::{Job, JobFilter, JobPatch, JobStatus, NewJob, StatusCounts};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use store::{cutoff_days, JobStore, MemoryJobStore, PgJobStore};
