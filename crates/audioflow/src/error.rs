use crate::jobs::model::JobStatus;

/// Failure taxonomy for the job pipeline.
///
/// Every error carries a stable SCREAMING_SNAKE code that ends up in the
/// job row (`error_code`) and on the real-time channel, so clients can
/// branch on it without parsing messages.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Bad job config. Never retried, surfaced synchronously to the caller.
    #[error("invalid config: {0}")]
    Validation(String),

    /// Unknown job id, or the job belongs to a different owner.
    #[error("job not found")]
    NotFound,

    /// Operation not valid from the job's current state, e.g. cancelling a
    /// job that is already terminal.
    #[error("{0}")]
    InvalidTransition(String),

    /// I/O trouble, engine 5xx, engine unreachable. Retryable per policy.
    #[error("transient failure [{code}]: {message}")]
    Transient { code: &'static str, message: String },

    /// Malformed input, unsupported format, engine 4xx. Never retried.
    #[error("permanent failure [{code}]: {message}")]
    Permanent { code: &'static str, message: String },

    /// The worker pool queue could not accept the job. Terminal.
    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),

    /// Retry budget exhausted; wraps the last transient failure.
    #[error("failed after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<JobError>,
    },

    /// Store or other infrastructure failure. Treated as transient.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl JobError {
    pub fn transient(code: &'static str, message: impl Into<String>) -> Self {
        Self::Transient {
            code,
            message: message.into(),
        }
    }

    pub fn permanent(code: &'static str, message: impl Into<String>) -> Self {
        Self::Permanent {
            code,
            message: message.into(),
        }
    }

    pub fn already_terminal(status: JobStatus) -> Self {
        Self::InvalidTransition(format!("already terminal: {}", status.as_str()))
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION",
            Self::NotFound => "NOT_FOUND",
            Self::InvalidTransition(_) => "INVALID_STATE",
            Self::Transient { code, .. } => code,
            Self::Permanent { code, .. } => code,
            Self::QueueUnavailable(_) => "QUEUE_UNAVAILABLE",
            Self::RetryExhausted { .. } => "RETRY_EXHAUSTED",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Whether this failure class is eligible for retry at all. The retry
    /// policy additionally checks the attempt budget.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Internal(_))
    }
}

impl From<sqlx::Error> for JobError {
    fn from(e: sqlx::Error) -> Self {
        Self::Internal(e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(JobError::Validation("x".into()).code(), "VALIDATION");
        assert_eq!(JobError::NotFound.code(), "NOT_FOUND");
        assert_eq!(
            JobError::transient("ENGINE_ERROR", "upstream 503").code(),
            "ENGINE_ERROR"
        );
        assert_eq!(
            JobError::QueueUnavailable("pool down".into()).code(),
            "QUEUE_UNAVAILABLE"
        );
    }

    #[test]
    fn only_transient_and_internal_are_retryable() {
        assert!(JobError::transient("IO", "read failed").is_retryable());
        assert!(JobError::Internal(anyhow::anyhow!("db gone")).is_retryable());

        assert!(!JobError::Validation("bad".into()).is_retryable());
        assert!(!JobError::NotFound.is_retryable());
        assert!(!JobError::permanent("BAD_INPUT", "not audio").is_retryable());
        assert!(!JobError::QueueUnavailable("x".into()).is_retryable());

        let exhausted = JobError::RetryExhausted {
            attempts: 3,
            source: Box::new(JobError::transient("TIMEOUT", "engine timeout")),
        };
        assert!(!exhausted.is_retryable());
        assert_eq!(exhausted.code(), "RETRY_EXHAUSTED");
    }

    #[test]
    fn retry_exhausted_keeps_the_cause_visible() {
        let err = JobError::RetryExhausted {
            attempts: 4,
            source: Box::new(JobError::transient("ENGINE_ERROR", "whisper 502")),
        };
        let msg = err.to_string();
        assert!(msg.contains("4 attempts"));
        assert!(msg.contains("whisper 502"));
    }
}
