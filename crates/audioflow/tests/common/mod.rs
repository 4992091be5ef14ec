#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use audioflow::engine::{TranscriptOutput, TranscriptSegment, TranscriptionEngine};
use audioflow::error::JobError;
use audioflow::jobs::breaker::{BreakerConfig, CircuitBreaker};
use audioflow::jobs::config::JobConfig;
use audioflow::jobs::executor::JobExecutor;
use audioflow::jobs::model::{Job, NewJob};
use audioflow::jobs::retry::{BackoffStrategy, RetryPolicy};
use audioflow::jobs::store::{JobStore, MemoryJobStore};
use audioflow::notify::{Connection, StatusNotifier};

/// Scripted engine: pops pre-loaded responses, succeeds with a canned
/// transcript once the script runs out.
pub struct MockEngine {
    responses: Mutex<VecDeque<Result<TranscriptOutput, JobError>>>,
    calls: AtomicU32,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(VecDeque::new()),
            calls: AtomicU32::new(0),
        })
    }

    pub fn push_ok(&self, text: &str) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Ok(sample_output(text)));
    }

    pub fn push_transient(&self, code: &'static str, message: &str) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Err(JobError::transient(code, message.to_string())));
    }

    pub fn push_permanent(&self, code: &'static str, message: &str) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Err(JobError::permanent(code, message.to_string())));
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TranscriptionEngine for MockEngine {
    async fn transcribe(
        &self,
        _audio: &[u8],
        _config: &JobConfig,
    ) -> Result<TranscriptOutput, JobError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(sample_output("hello world")))
    }
}

pub fn sample_output(text: &str) -> TranscriptOutput {
    TranscriptOutput {
        text: text.to_string(),
        segments: vec![TranscriptSegment {
            start: 0.0,
            end: 2.0,
            text: text.to_string(),
            speaker: Some("speaker_0".to_string()),
            confidence: Some(0.9),
        }],
        language: Some("en".to_string()),
    }
}

/// Recording connection with a failure switch, for fan-out assertions.
#[derive(Default)]
pub struct RecordingConnection {
    pub sent: Mutex<Vec<String>>,
    pub fail: AtomicBool,
}

impl RecordingConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let conn = Self::default();
        conn.fail.store(true, Ordering::SeqCst);
        Arc::new(conn)
    }

    pub fn received(&self) -> Vec<serde_json::Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|s| serde_json::from_str(s).unwrap())
            .collect()
    }
}

impl Connection for RecordingConnection {
    fn send(&self, text: &str) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("simulated write failure");
        }
        self.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

/// Fast backoff so retry scenarios finish in milliseconds.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: 0.005,
        max_delay: 0.01,
        strategy: BackoffStrategy::Exponential,
        multiplier: 2.0,
        jitter: 0.0,
    }
}

pub fn breaker() -> Arc<CircuitBreaker> {
    Arc::new(CircuitBreaker::new(BreakerConfig::default()))
}

pub fn executor(
    store: Arc<dyn JobStore>,
    engine: Arc<dyn TranscriptionEngine>,
    notifier: Arc<StatusNotifier>,
    breaker: Arc<CircuitBreaker>,
) -> Arc<JobExecutor> {
    Arc::new(JobExecutor::new(
        store,
        engine,
        notifier,
        fast_retry(),
        breaker,
    ))
}

/// Drop a small fake audio file under the temp dir and return its path.
pub fn temp_audio_file(tag: &str) -> String {
    let path = std::env::temp_dir().join(format!("audioflow-test-{tag}-{}.wav", Uuid::new_v4()));
    std::fs::write(&path, b"RIFF0000WAVEfmt fake audio payload").unwrap();
    path.to_string_lossy().into_owned()
}

pub fn memory_store() -> Arc<MemoryJobStore> {
    Arc::new(MemoryJobStore::new())
}

pub async fn create_job(
    store: &Arc<MemoryJobStore>,
    owner: Uuid,
    input_path: &str,
    max_retries: i32,
) -> Job {
    store
        .create(NewJob {
            owner_id: owner,
            kind: "transcription".to_string(),
            queue: "audio_processing".to_string(),
            config: json!({ "input_path": input_path }),
            max_retries,
            estimated_duration: Some(60),
        })
        .await
        .unwrap()
}

/// Transition a pending job to running the way a backend would.
pub async fn start_job(store: &Arc<MemoryJobStore>, id: Uuid) -> Job {
    store.mark_queued(id).await.unwrap();
    store.begin_attempt(id).await.unwrap().expect("job runnable")
}
