use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// A unit of asynchronous transcription work with persisted state.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub kind: String,
    pub queue: String,
    pub status: String,
    pub progress: i32,
    pub current_step: Option<String>,
    pub config: Value,
    pub result: Option<Value>,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,

    /// Earliest time the job may run; pushed forward for retry backoff.
    pub run_at: DateTime<Utc>,
    pub locked_by: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub estimated_duration: Option<i32>,
    pub actual_duration: Option<i32>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn status_enum(&self) -> Option<JobStatus> {
        JobStatus::parse(&self.status)
    }

    pub fn is_terminal(&self) -> bool {
        self.status_enum().map(|s| s.is_terminal()).unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub owner_id: Uuid,
    pub kind: String,
    pub queue: String,
    pub config: Value,
    pub max_retries: i32,
    pub estimated_duration: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal states are only left via an explicit user retry().
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// States a user-initiated retry() accepts.
    pub fn allows_user_retry(&self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Cancelled)
    }
}

/// Partial update with per-field last-writer-wins merge. Status changes go
/// through the guarded transition methods on the store; a patch can never
/// pull a job out of a terminal state.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub progress: Option<i32>,
    pub current_step: Option<String>,
    pub result: Option<Value>,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    pub estimated_duration: Option<i32>,
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<String>,
    pub kind: Option<String>,
    pub limit: Option<i64>,
}

/// Per-status totals for /metrics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub queued: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
}

impl StatusCounts {
    pub fn record(&mut self, status: &str, count: i64) {
        match status {
            "pending" => self.pending += count,
            "queued" => self.queued += count,
            "running" => self.running += count,
            "completed" => self.completed += count,
            "failed" => self.failed += count,
            "cancelled" => self.cancelled += count,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        for s in [
            JobStatus::Pending,
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(JobStatus::parse("dlq"), None);
    }

    #[test]
    fn terminal_and_retryable_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Running.is_terminal());

        assert!(JobStatus::Failed.allows_user_retry());
        assert!(JobStatus::Cancelled.allows_user_retry());
        assert!(!JobStatus::Completed.allows_user_retry());
        assert!(!JobStatus::Pending.allows_user_retry());
    }
}
