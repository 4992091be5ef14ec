use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::jobs::model::{Job, StatusCounts};

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub kind: Option<String>,
    pub queue: Option<String>,
    pub config: Value,
    pub max_retries: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct CreateJobResponse {
    pub job_id: Uuid,
    pub estimated_duration: i32,
}

/// Owner-facing projection of a job row.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub job_id: Uuid,
    pub kind: String,
    pub queue: String,
    pub status: String,
    pub progress: i32,
    pub current_step: Option<String>,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    pub result: Option<Value>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub estimated_duration: Option<i32>,
    pub actual_duration: Option<i32>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            kind: job.kind,
            queue: job.queue,
            status: job.status,
            progress: job.progress,
            current_step: job.current_step,
            error_message: job.error_message,
            error_code: job.error_code,
            result: job.result,
            retry_count: job.retry_count,
            max_retries: job.max_retries,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            estimated_duration: job.estimated_duration,
            actual_duration: job.actual_duration,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub kind: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ListJobsResponse {
    pub items: Vec<JobView>,
}

#[derive(Debug, Serialize)]
pub struct JobActionResponse {
    pub job_id: Uuid,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub now_utc: DateTime<Utc>,
    pub jobs: StatusCounts,
    pub active_connections: usize,
    pub active_owners: usize,
}
