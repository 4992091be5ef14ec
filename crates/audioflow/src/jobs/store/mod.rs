use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::JobError;
use crate::jobs::model::{Job, JobFilter, JobPatch, NewJob, StatusCounts};

pub mod memory;
pub mod pg;

pub use memory::MemoryJobStore;
pub use pg::PgJobStore;

/// Durable record of job state.
///
/// The owner-scoped surface is what API handlers see: every read and write
/// takes the owner id and a mismatch is indistinguishable from a missing
/// job. The unscoped methods below it belong to the execution machinery
/// (dispatcher, workers, executor), which only ever holds jobs it obtained
/// legitimately.
///
/// All transition methods are guarded: a cancellation observed
/// mid-execution wins over any later "running" or progress write, and no
/// write moves a job out of a terminal state except `reset_for_retry`.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, new: NewJob) -> Result<Job, JobError>;

    async fn get(&self, id: Uuid, owner: Uuid) -> Result<Job, JobError>;

    /// Per-field last-writer-wins merge of the patch.
    async fn update(&self, id: Uuid, owner: Uuid, patch: JobPatch) -> Result<Job, JobError>;

    /// Jobs for one owner, most recent first.
    async fn list(&self, owner: Uuid, filter: JobFilter) -> Result<Vec<Job>, JobError>;

    /// Valid from any non-terminal state; "already terminal" otherwise.
    async fn cancel(&self, id: Uuid, owner: Uuid) -> Result<Job, JobError>;

    /// User-initiated retry, valid from failed/cancelled only. Resets to
    /// pending and clears the previous outcome; `retry_count` is preserved
    /// as an audit trail.
    async fn reset_for_retry(&self, id: Uuid, owner: Uuid) -> Result<Job, JobError>;

    // ---- execution machinery ----

    async fn load(&self, id: Uuid) -> Result<Job, JobError>;

    /// pending -> queued. A job cancelled in between is left untouched.
    async fn mark_queued(&self, id: Uuid) -> Result<(), JobError>;

    /// pending/queued -> running, stamping `started_at` on the first
    /// attempt. Returns the refreshed job, or `None` when the job is no
    /// longer runnable (cancel wins).
    async fn begin_attempt(&self, id: Uuid) -> Result<Option<Job>, JobError>;

    /// Progress merge while running only; progress never regresses.
    async fn update_progress(&self, id: Uuid, progress: i32, step: &str)
        -> Result<(), JobError>;

    /// running -> completed with result and actual duration.
    async fn complete(
        &self,
        id: Uuid,
        result: Value,
        actual_duration: i32,
    ) -> Result<(), JobError>;

    /// any non-terminal -> failed with error code/message.
    async fn fail(
        &self,
        id: Uuid,
        code: &str,
        message: &str,
        actual_duration: Option<i32>,
    ) -> Result<(), JobError>;

    /// running -> pending with progress reset and `run_at` pushed out for
    /// backoff. `retry_count` is the new value to record (unchanged for a
    /// circuit-breaker deferral).
    async fn schedule_retry(
        &self,
        id: Uuid,
        retry_count: i32,
        message: &str,
        run_at: DateTime<Utc>,
    ) -> Result<(), JobError>;

    /// Pool mode: lease exactly one due queued job for this worker.
    async fn claim(
        &self,
        queue: &str,
        worker_id: &str,
        lease_seconds: i64,
    ) -> Result<Option<Job>, JobError>;

    /// Re-queue running jobs whose lease expired (dead worker recovery).
    async fn reap_expired_leases(&self) -> Result<u64, JobError>;

    /// Age-based retention cleanup; the only way jobs are ever destroyed.
    async fn purge_terminal_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, JobError>;

    async fn status_counts(&self) -> Result<StatusCounts, JobError>;
}

/// Convenience: compute cutoff like "now - N days".
pub fn cutoff_days(days: i64) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::days(days)
}
