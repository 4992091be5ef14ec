use std::sync::Arc;

use async_trait::async_trait;

use crate::error::JobError;
use crate::jobs::executor::{JobExecutor, Outcome};
use crate::jobs::model::Job;
use crate::jobs::store::JobStore;
use crate::notify::{JobEvent, StatusNotifier};

/// Where a submitted job went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchHandle {
    /// Enqueued on a named queue for an out-of-process worker.
    Pool { queue: String },
    /// Executed in-process; sentinel handle.
    Inline,
}

/// Execution strategy, chosen once at construction. Both implementations
/// are observably equivalent through the job store: same transitions, same
/// notifications.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn submit(&self, job: &Job) -> Result<DispatchHandle, JobError>;
}

/// Hands jobs to the worker pool by marking them queued; the relational
/// store is the queue. An enqueue failure marks the job failed rather than
/// leaving it stuck pending.
pub struct PoolBackend {
    store: Arc<dyn JobStore>,
    notifier: Arc<StatusNotifier>,
}

impl PoolBackend {
    pub fn new(store: Arc<dyn JobStore>, notifier: Arc<StatusNotifier>) -> Self {
        Self { store, notifier }
    }
}

#[async_trait]
impl ExecutionBackend for PoolBackend {
    async fn submit(&self, job: &Job) -> Result<DispatchHandle, JobError> {
        match self.store.mark_queued(job.id).await {
            Ok(()) => {
                tracing::info!(job_id = %job.id, queue = %job.queue, "job enqueued");
                Ok(DispatchHandle::Pool {
                    queue: job.queue.clone(),
                })
            }
            Err(e) => {
                let message = format!("enqueue failed: {e}");
                tracing::error!(job_id = %job.id, %message, "queue unavailable");
                // Best effort: the same store just failed, but a partial
                // outage may still let the terminal write through.
                if let Err(fail_err) = self
                    .store
                    .fail(job.id, "QUEUE_UNAVAILABLE", &message, None)
                    .await
                {
                    tracing::error!(job_id = %job.id, error = %fail_err, "could not mark job failed");
                }
                if let Ok(fresh) = self.store.load(job.id).await {
                    self.notifier
                        .send_to_owner(fresh.owner_id, &JobEvent::error(&fresh))
                        .await;
                }
                Err(JobError::QueueUnavailable(message))
            }
        }
    }
}

/// Runs the executor on the caller's runtime, sleeping through retry
/// backoff. No independent timeout: the caller's own deadline applies.
pub struct InlineBackend {
    store: Arc<dyn JobStore>,
    executor: Arc<JobExecutor>,
}

impl InlineBackend {
    pub fn new(store: Arc<dyn JobStore>, executor: Arc<JobExecutor>) -> Self {
        Self { store, executor }
    }
}

#[async_trait]
impl ExecutionBackend for InlineBackend {
    async fn submit(&self, job: &Job) -> Result<DispatchHandle, JobError> {
        let id = job.id;
        loop {
            self.store.mark_queued(id).await?;
            let Some(running) = self.store.begin_attempt(id).await? else {
                // No longer runnable; a cancellation in between wins.
                return Ok(DispatchHandle::Inline);
            };
            match self.executor.run(running).await {
                Outcome::Retry { delay } | Outcome::CircuitOpen { delay } => {
                    tokio::time::sleep(delay).await;
                }
                Outcome::Completed | Outcome::Failed | Outcome::Cancelled => {
                    return Ok(DispatchHandle::Inline);
                }
            }
        }
    }
}
