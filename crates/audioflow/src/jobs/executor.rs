use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::engine::{TranscriptOutput, TranscriptionEngine};
use crate::error::JobError;
use crate::jobs::breaker::CircuitBreaker;
use crate::jobs::config::JobConfig;
use crate::jobs::model::{Job, JobStatus};
use crate::jobs::retry::RetryPolicy;
use crate::jobs::store::JobStore;
use crate::notify::{JobEvent, StatusNotifier};

/// How one attempt ended. `Retry` and `CircuitOpen` ask the caller (inline
/// backend or pool worker) to reschedule after `delay`; the job row has
/// already been reset to pending with `run_at` pushed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed,
    Retry { delay: Duration },
    CircuitOpen { delay: Duration },
    Cancelled,
}

enum StepAbort {
    Cancelled,
    CircuitOpen,
    Failed(JobError),
}

impl From<JobError> for StepAbort {
    fn from(e: JobError) -> Self {
        StepAbort::Failed(e)
    }
}

/// Drives one job through the step pipeline, consulting the retry policy
/// and circuit breaker, updating the store and emitting lifecycle events.
///
/// Execution errors never escape: every failure is classified into the
/// retry path or a terminal "failed".
pub struct JobExecutor {
    store: Arc<dyn JobStore>,
    engine: Arc<dyn TranscriptionEngine>,
    notifier: Arc<StatusNotifier>,
    retry: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
}

impl JobExecutor {
    pub fn new(
        store: Arc<dyn JobStore>,
        engine: Arc<dyn TranscriptionEngine>,
        notifier: Arc<StatusNotifier>,
        retry: RetryPolicy,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            store,
            engine,
            notifier,
            retry,
            breaker,
        }
    }

    /// Run one attempt of a job that is already in the running state.
    pub async fn run(&self, job: Job) -> Outcome {
        match self.run_steps(&job).await {
            Ok(result) => self.conclude_success(&job, result).await,
            Err(StepAbort::Cancelled) => {
                tracing::info!(job_id = %job.id, "cancellation observed at checkpoint, stopping");
                Outcome::Cancelled
            }
            Err(StepAbort::CircuitOpen) => self.defer_for_circuit(&job).await,
            Err(StepAbort::Failed(err)) => self.fail_attempt(&job, err).await,
        }
    }

    async fn run_steps(&self, job: &Job) -> Result<Value, StepAbort> {
        let config = JobConfig::validate(&job.config)?;

        self.checkpoint(job, 5, "loading input").await?;
        let audio = tokio::fs::read(&config.input_path).await.map_err(|e| {
            StepAbort::Failed(match e.kind() {
                std::io::ErrorKind::NotFound => JobError::permanent(
                    "INPUT_NOT_FOUND",
                    format!("audio file not found: {}", config.input_path),
                ),
                _ => JobError::transient(
                    "IO",
                    format!("failed to read {}: {e}", config.input_path),
                ),
            })
        })?;

        self.checkpoint(job, 50, "transcribing").await?;
        if !self.breaker.can_execute() {
            return Err(StepAbort::CircuitOpen);
        }
        let output = match self.engine.transcribe(&audio, &config).await {
            Ok(output) => {
                self.breaker.record_success();
                output
            }
            Err(err) => {
                self.breaker.record_failure(&err);
                return Err(StepAbort::Failed(err));
            }
        };

        self.checkpoint(job, 80, "structuring output").await?;
        let result = structure_result(&output, &config);

        self.checkpoint(job, 95, "persisting results").await?;
        Ok(result)
    }

    /// Progress checkpoint between steps; also the cancellation boundary.
    /// Once "cancelled" is observed in the store the executor must not
    /// advance further.
    async fn checkpoint(&self, job: &Job, progress: i32, step: &str) -> Result<(), StepAbort> {
        let current = self.store.load(job.id).await?;
        if current.status == JobStatus::Cancelled.as_str() {
            return Err(StepAbort::Cancelled);
        }

        self.store.update_progress(job.id, progress, step).await?;
        self.notifier
            .send_to_owner(job.owner_id, &JobEvent::progress(job.id, progress, step))
            .await;
        Ok(())
    }

    async fn conclude_success(&self, job: &Job, result: Value) -> Outcome {
        let duration = duration_since_start(job);
        if let Err(e) = self.store.complete(job.id, result, duration).await {
            tracing::error!(job_id = %job.id, error = %e, "failed to record completion");
            return Outcome::Failed;
        }

        match self.store.load(job.id).await {
            Ok(fresh) if fresh.status == JobStatus::Completed.as_str() => {
                self.notifier
                    .send_to_owner(fresh.owner_id, &JobEvent::status(&fresh))
                    .await;
                self.notifier
                    .send_to_owner(fresh.owner_id, &JobEvent::transcript_ready(&fresh))
                    .await;
                tracing::info!(job_id = %job.id, duration_secs = duration, "job completed");
                Outcome::Completed
            }
            Ok(fresh) => {
                // The guarded write lost to a cancellation.
                tracing::info!(job_id = %job.id, status = %fresh.status, "completion superseded");
                Outcome::Cancelled
            }
            Err(_) => Outcome::Completed,
        }
    }

    /// The breaker refused the engine call. Push the job back out past the
    /// recovery window; this consumes no retry budget.
    async fn defer_for_circuit(&self, job: &Job) -> Outcome {
        let delay = self.breaker.recovery_timeout();
        let run_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60));
        let message = "Execution deferred: transcription engine circuit open";

        tracing::warn!(job_id = %job.id, delay_secs = delay.as_secs(), "circuit open, deferring job");
        if let Err(e) = self
            .store
            .schedule_retry(job.id, job.retry_count, message, run_at)
            .await
        {
            tracing::error!(job_id = %job.id, error = %e, "failed to defer job");
            return Outcome::Failed;
        }
        self.emit_fresh_status(job.id, job.owner_id).await;
        Outcome::CircuitOpen { delay }
    }

    /// Classify a failed attempt: reschedule if the failure is transient
    /// and budget remains, otherwise record a terminal failure. Also used
    /// by the pool worker when the hard wall-clock limit kills an attempt.
    pub async fn fail_attempt(&self, job: &Job, err: JobError) -> Outcome {
        let attempt = (job.retry_count + 1).max(1) as u32;
        let budget = self
            .retry
            .clone()
            .with_max_attempts(job.max_retries.max(0) as u32 + 1);

        if budget.should_retry(&err, attempt) {
            let mut rng = StdRng::from_entropy();
            let delay_secs = budget.calculate_delay(attempt, &mut rng);
            let delay = Duration::from_secs_f64(delay_secs);
            let retry_count = job.retry_count + 1;
            let message = format!("Retry {}/{}: {}", retry_count, job.max_retries, err);
            let run_at = Utc::now() + chrono::Duration::milliseconds((delay_secs * 1000.0) as i64);

            tracing::warn!(
                job_id = %job.id,
                attempt,
                delay_secs,
                error = %err,
                "attempt failed, scheduling retry"
            );
            if let Err(e) = self
                .store
                .schedule_retry(job.id, retry_count, &message, run_at)
                .await
            {
                tracing::error!(job_id = %job.id, error = %e, "failed to schedule retry");
                return Outcome::Failed;
            }
            self.emit_fresh_status(job.id, job.owner_id).await;
            Outcome::Retry { delay }
        } else {
            let final_err = if err.is_retryable() {
                budget.exhausted(err, attempt)
            } else {
                err
            };
            let code = final_err.code();
            let message = final_err.to_string();
            let duration = duration_since_start(job);

            tracing::error!(job_id = %job.id, code, %message, "job failed permanently");
            if let Err(e) = self
                .store
                .fail(job.id, code, &message, Some(duration))
                .await
            {
                tracing::error!(job_id = %job.id, error = %e, "failed to record failure");
            }
            if let Ok(fresh) = self.store.load(job.id).await {
                self.notifier
                    .send_to_owner(fresh.owner_id, &JobEvent::status(&fresh))
                    .await;
                self.notifier
                    .send_to_owner(fresh.owner_id, &JobEvent::error(&fresh))
                    .await;
            }
            Outcome::Failed
        }
    }

    async fn emit_fresh_status(&self, job_id: Uuid, owner: Uuid) {
        if let Ok(fresh) = self.store.load(job_id).await {
            self.notifier
                .send_to_owner(owner, &JobEvent::status(&fresh))
                .await;
        }
    }
}

fn duration_since_start(job: &Job) -> i32 {
    job.started_at
        .map(|t| (Utc::now() - t).num_seconds().max(0) as i32)
        .unwrap_or(0)
}

/// Shape the raw engine output into the stored result: full text, typed
/// segments, per-speaker totals and summary statistics.
pub fn structure_result(output: &TranscriptOutput, config: &JobConfig) -> Value {
    #[derive(Default)]
    struct SpeakerStats {
        total_time: f64,
        segment_count: u64,
        words: u64,
    }

    let mut speakers: BTreeMap<String, SpeakerStats> = BTreeMap::new();
    let mut confidence_sum = 0.0;
    let mut confidence_count = 0u64;
    let mut segments = Vec::with_capacity(output.segments.len());

    for (i, segment) in output.segments.iter().enumerate() {
        let speaker = if config.enable_diarization {
            segment.speaker.clone()
        } else {
            None
        };

        if let Some(id) = &speaker {
            let stats = speakers.entry(id.clone()).or_default();
            stats.total_time += (segment.end - segment.start).max(0.0);
            stats.segment_count += 1;
            stats.words += segment.text.split_whitespace().count() as u64;
        }
        if let Some(c) = segment.confidence {
            confidence_sum += c;
            confidence_count += 1;
        }

        segments.push(json!({
            "id": i,
            "start": segment.start,
            "end": segment.end,
            "text": segment.text.trim(),
            "speaker": speaker,
            "confidence": segment.confidence,
        }));
    }

    let average_confidence = if confidence_count > 0 {
        confidence_sum / confidence_count as f64
    } else {
        0.0
    };

    let speakers_json: BTreeMap<&String, Value> = speakers
        .iter()
        .map(|(id, s)| {
            (
                id,
                json!({
                    "total_time": s.total_time,
                    "segment_count": s.segment_count,
                    "words": s.words,
                }),
            )
        })
        .collect();

    json!({
        "transcript_text": output.text,
        "language": output.language.clone().unwrap_or_else(|| "en".to_string()),
        "segments": segments,
        "speakers": speakers_json,
        "statistics": {
            "total_segments": output.segments.len(),
            "total_words": output.text.split_whitespace().count(),
            "average_confidence": average_confidence,
            "speakers_detected": speakers.len(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TranscriptSegment;
    use serde_json::json;

    fn config() -> JobConfig {
        JobConfig::validate(&json!({"input_path": "/tmp/a.wav"})).unwrap()
    }

    fn output() -> TranscriptOutput {
        TranscriptOutput {
            text: "hello there general kenobi".to_string(),
            segments: vec![
                TranscriptSegment {
                    start: 0.0,
                    end: 1.5,
                    text: " hello there ".to_string(),
                    speaker: Some("speaker_0".to_string()),
                    confidence: Some(0.8),
                },
                TranscriptSegment {
                    start: 1.5,
                    end: 3.0,
                    text: "general kenobi".to_string(),
                    speaker: Some("speaker_1".to_string()),
                    confidence: Some(0.6),
                },
            ],
            language: Some("en".to_string()),
        }
    }

    #[test]
    fn structured_result_aggregates_statistics() {
        let result = structure_result(&output(), &config());

        assert_eq!(result["transcript_text"], "hello there general kenobi");
        assert_eq!(result["language"], "en");
        assert_eq!(result["statistics"]["total_segments"], 2);
        assert_eq!(result["statistics"]["total_words"], 4);
        assert_eq!(result["statistics"]["speakers_detected"], 2);
        let avg = result["statistics"]["average_confidence"].as_f64().unwrap();
        assert!((avg - 0.7).abs() < 1e-9);

        // segment text is trimmed and ids are positional
        assert_eq!(result["segments"][0]["id"], 0);
        assert_eq!(result["segments"][0]["text"], "hello there");
        assert_eq!(result["speakers"]["speaker_0"]["words"], 2);
    }

    #[test]
    fn diarization_off_drops_speaker_attribution() {
        let cfg = JobConfig::validate(
            &json!({"input_path": "/tmp/a.wav", "enable_diarization": false}),
        )
        .unwrap();
        let result = structure_result(&output(), &cfg);

        assert_eq!(result["statistics"]["speakers_detected"], 0);
        assert!(result["segments"][0]["speaker"].is_null());
    }

    #[test]
    fn empty_output_is_well_formed() {
        let out = TranscriptOutput {
            text: String::new(),
            segments: vec![],
            language: None,
        };
        let result = structure_result(&out, &config());
        assert_eq!(result["language"], "en");
        assert_eq!(result["statistics"]["total_words"], 0);
        assert_eq!(result["statistics"]["average_confidence"], 0.0);
    }
}
