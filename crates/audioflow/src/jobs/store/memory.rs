use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::JobError;
use crate::jobs::model::{Job, JobFilter, JobPatch, JobStatus, NewJob, StatusCounts};
use crate::jobs::store::JobStore;

/// In-process job store with the same transition guards as the Postgres
/// implementation. Used by the test suites and by inline deployments that
/// run without a database.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn actual_duration_since(started_at: Option<DateTime<Utc>>) -> Option<i32> {
    started_at.map(|t| (Utc::now() - t).num_seconds().max(0) as i32)
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, new: NewJob) -> Result<Job, JobError> {
        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            owner_id: new.owner_id,
            kind: new.kind,
            queue: new.queue,
            status: JobStatus::Pending.as_str().to_string(),
            progress: 0,
            current_step: Some("Queued for processing".to_string()),
            config: new.config,
            result: None,
            error_message: None,
            error_code: None,
            retry_count: 0,
            max_retries: new.max_retries,
            run_at: now,
            locked_by: None,
            lock_expires_at: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            estimated_duration: new.estimated_duration,
            actual_duration: None,
            updated_at: now,
        };
        self.jobs.lock().await.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: Uuid, owner: Uuid) -> Result<Job, JobError> {
        let jobs = self.jobs.lock().await;
        jobs.get(&id)
            .filter(|j| j.owner_id == owner)
            .cloned()
            .ok_or(JobError::NotFound)
    }

    async fn update(&self, id: Uuid, owner: Uuid, patch: JobPatch) -> Result<Job, JobError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(&id)
            .filter(|j| j.owner_id == owner)
            .ok_or(JobError::NotFound)?;

        if let Some(progress) = patch.progress {
            job.progress = progress;
        }
        if let Some(step) = patch.current_step {
            job.current_step = Some(step);
        }
        if let Some(result) = patch.result {
            job.result = Some(result);
        }
        if let Some(message) = patch.error_message {
            job.error_message = Some(message);
        }
        if let Some(code) = patch.error_code {
            job.error_code = Some(code);
        }
        if let Some(estimated) = patch.estimated_duration {
            job.estimated_duration = Some(estimated);
        }
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn list(&self, owner: Uuid, filter: JobFilter) -> Result<Vec<Job>, JobError> {
        let jobs = self.jobs.lock().await;
        let limit = filter.limit.unwrap_or(100).clamp(1, 500) as usize;

        let mut out: Vec<Job> = jobs
            .values()
            .filter(|j| j.owner_id == owner)
            .filter(|j| {
                filter
                    .status
                    .as_deref()
                    .map(|s| j.status == s)
                    .unwrap_or(true)
            })
            .filter(|j| filter.kind.as_deref().map(|k| j.kind == k).unwrap_or(true))
            .cloned()
            .collect();

        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        out.truncate(limit);
        Ok(out)
    }

    async fn cancel(&self, id: Uuid, owner: Uuid) -> Result<Job, JobError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(&id)
            .filter(|j| j.owner_id == owner)
            .ok_or(JobError::NotFound)?;

        if let Some(status) = job.status_enum() {
            if status.is_terminal() {
                return Err(JobError::already_terminal(status));
            }
        }

        job.status = JobStatus::Cancelled.as_str().to_string();
        job.current_step = Some("cancelled".to_string());
        job.completed_at = Some(Utc::now());
        if job.actual_duration.is_none() {
            job.actual_duration = actual_duration_since(job.started_at);
        }
        job.locked_by = None;
        job.lock_expires_at = None;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn reset_for_retry(&self, id: Uuid, owner: Uuid) -> Result<Job, JobError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(&id)
            .filter(|j| j.owner_id == owner)
            .ok_or(JobError::NotFound)?;

        match job.status_enum() {
            Some(status) if status.allows_user_retry() => {}
            _ => {
                return Err(JobError::InvalidTransition(format!(
                    "retry only valid from failed or cancelled (status: {})",
                    job.status
                )))
            }
        }

        job.status = JobStatus::Pending.as_str().to_string();
        job.progress = 0;
        job.current_step = Some("Queued for retry".to_string());
        job.result = None;
        job.error_message = None;
        job.error_code = None;
        job.started_at = None;
        job.completed_at = None;
        job.actual_duration = None;
        job.run_at = Utc::now();
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn load(&self, id: Uuid) -> Result<Job, JobError> {
        let jobs = self.jobs.lock().await;
        jobs.get(&id).cloned().ok_or(JobError::NotFound)
    }

    async fn mark_queued(&self, id: Uuid) -> Result<(), JobError> {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.get_mut(&id) {
            if job.status == JobStatus::Pending.as_str() {
                job.status = JobStatus::Queued.as_str().to_string();
                job.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn begin_attempt(&self, id: Uuid) -> Result<Option<Job>, JobError> {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        let runnable = matches!(
            job.status_enum(),
            Some(JobStatus::Pending) | Some(JobStatus::Queued)
        );
        if !runnable {
            return Ok(None);
        }
        job.status = JobStatus::Running.as_str().to_string();
        if job.started_at.is_none() {
            job.started_at = Some(Utc::now());
        }
        job.updated_at = Utc::now();
        Ok(Some(job.clone()))
    }

    async fn update_progress(
        &self,
        id: Uuid,
        progress: i32,
        step: &str,
    ) -> Result<(), JobError> {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.get_mut(&id) {
            if job.status == JobStatus::Running.as_str() {
                job.progress = job.progress.max(progress.clamp(0, 100));
                job.current_step = Some(step.to_string());
                job.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn complete(
        &self,
        id: Uuid,
        result: Value,
        actual_duration: i32,
    ) -> Result<(), JobError> {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.get_mut(&id) {
            if job.status == JobStatus::Running.as_str() {
                job.status = JobStatus::Completed.as_str().to_string();
                job.progress = 100;
                job.current_step = Some("completed".to_string());
                job.result = Some(result);
                job.completed_at = Some(Utc::now());
                job.actual_duration = Some(actual_duration);
                job.locked_by = None;
                job.lock_expires_at = None;
                job.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn fail(
        &self,
        id: Uuid,
        code: &str,
        message: &str,
        actual_duration: Option<i32>,
    ) -> Result<(), JobError> {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.get_mut(&id) {
            if !job.is_terminal() {
                job.status = JobStatus::Failed.as_str().to_string();
                job.current_step = Some("failed".to_string());
                job.error_code = Some(code.to_string());
                job.error_message = Some(message.to_string());
                job.completed_at = Some(Utc::now());
                job.actual_duration = actual_duration.or(job.actual_duration);
                job.locked_by = None;
                job.lock_expires_at = None;
                job.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn schedule_retry(
        &self,
        id: Uuid,
        retry_count: i32,
        message: &str,
        run_at: DateTime<Utc>,
    ) -> Result<(), JobError> {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.get_mut(&id) {
            if job.status == JobStatus::Running.as_str() {
                job.status = JobStatus::Pending.as_str().to_string();
                job.progress = 0;
                job.retry_count = retry_count;
                job.current_step = Some("Queued for retry".to_string());
                job.error_message = Some(message.to_string());
                job.run_at = run_at;
                job.locked_by = None;
                job.lock_expires_at = None;
                job.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn claim(
        &self,
        queue: &str,
        worker_id: &str,
        lease_seconds: i64,
    ) -> Result<Option<Job>, JobError> {
        let mut jobs = self.jobs.lock().await;
        let now = Utc::now();

        let candidate = jobs
            .values()
            .filter(|j| {
                j.queue == queue && j.status == JobStatus::Queued.as_str() && j.run_at <= now
            })
            .min_by_key(|j| (j.run_at, j.created_at))
            .map(|j| j.id);

        let Some(job) = candidate.and_then(|id| jobs.get_mut(&id)) else {
            return Ok(None);
        };
        job.status = JobStatus::Running.as_str().to_string();
        job.locked_by = Some(worker_id.to_string());
        job.lock_expires_at = Some(now + chrono::Duration::seconds(lease_seconds));
        if job.started_at.is_none() {
            job.started_at = Some(now);
        }
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn reap_expired_leases(&self) -> Result<u64, JobError> {
        let mut jobs = self.jobs.lock().await;
        let now = Utc::now();
        let mut reaped = 0;
        for job in jobs.values_mut() {
            if job.status == JobStatus::Running.as_str()
                && job.lock_expires_at.map(|t| t < now).unwrap_or(false)
            {
                job.status = JobStatus::Queued.as_str().to_string();
                job.locked_by = None;
                job.lock_expires_at = None;
                job.updated_at = now;
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    async fn purge_terminal_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, JobError> {
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|_, j| {
            !(j.is_terminal() && j.completed_at.map(|t| t < cutoff).unwrap_or(false))
        });
        Ok((before - jobs.len()) as u64)
    }

    async fn status_counts(&self) -> Result<StatusCounts, JobError> {
        let jobs = self.jobs.lock().await;
        let mut counts = StatusCounts::default();
        for job in jobs.values() {
            counts.record(&job.status, 1);
        }
        Ok(counts)
    }
}
