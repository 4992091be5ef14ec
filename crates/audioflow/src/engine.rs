use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::JobError;
use crate::jobs::config::JobConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(default)]
    pub speaker: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptOutput {
    pub text: String,
    #[serde(default)]
    pub segments: Vec<TranscriptSegment>,
    #[serde(default)]
    pub language: Option<String>,
}

/// The unreliable downstream. Implementations translate their failure
/// modes into the taxonomy: connectivity/5xx problems are `Transient`,
/// rejected input is `Permanent`.
#[async_trait]
pub trait TranscriptionEngine: Send + Sync {
    async fn transcribe(
        &self,
        audio: &[u8],
        config: &JobConfig,
    ) -> Result<TranscriptOutput, JobError>;
}

/// HTTP client for a whisper-compatible inference service.
pub struct HttpTranscriptionEngine {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTranscriptionEngine {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }

    fn build_form(audio: &[u8], config: &JobConfig) -> Result<reqwest::multipart::Form, JobError> {
        let part = reqwest::multipart::Part::bytes(audio.to_vec())
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| JobError::Internal(e.into()))?;

        let language = if config.language == "auto" {
            String::new()
        } else {
            config.language.clone()
        };

        Ok(reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", config.model.clone())
            .text("response_format", "json")
            .text("language", language)
            .text(
                "diarize",
                if config.enable_diarization { "true" } else { "false" },
            )
            .text("temperature", config.temperature.to_string())
            .text("beam_size", config.beam_size.to_string())
            .text("initial_prompt", config.initial_prompt.clone()))
    }
}

#[async_trait]
impl TranscriptionEngine for HttpTranscriptionEngine {
    async fn transcribe(
        &self,
        audio: &[u8],
        config: &JobConfig,
    ) -> Result<TranscriptOutput, JobError> {
        let form = Self::build_form(audio, config)?;

        let response = self
            .client
            .post(format!("{}/inference", self.base_url))
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    JobError::transient("TIMEOUT", format!("engine request timed out: {e}"))
                } else {
                    JobError::transient("ENGINE_UNAVAILABLE", format!("engine unreachable: {e}"))
                }
            })?;

        let status = response.status();
        if status.is_success() {
            response
                .json::<TranscriptOutput>()
                .await
                .map_err(|e| {
                    JobError::transient("ENGINE_ERROR", format!("bad engine response: {e}"))
                })
        } else if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            Err(JobError::permanent(
                "ENGINE_REJECTED",
                format!("engine rejected input ({status}): {body}"),
            ))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(JobError::transient(
                "ENGINE_ERROR",
                format!("engine error ({status}): {body}"),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn transcript_output_parses_a_typical_engine_response() {
        let raw = json!({
            "text": "hello world",
            "segments": [
                {"start": 0.0, "end": 1.2, "text": "hello", "confidence": 0.9},
                {"start": 1.2, "end": 2.0, "text": "world", "speaker": "speaker_0"}
            ],
            "language": "en"
        });
        let out: TranscriptOutput = serde_json::from_value(raw).unwrap();
        assert_eq!(out.text, "hello world");
        assert_eq!(out.segments.len(), 2);
        assert_eq!(out.segments[1].speaker.as_deref(), Some("speaker_0"));
        assert_eq!(out.language.as_deref(), Some("en"));
    }

    #[test]
    fn missing_optional_fields_are_fine() {
        let out: TranscriptOutput = serde_json::from_value(json!({"text": "hi"})).unwrap();
        assert!(out.segments.is_empty());
        assert!(out.language.is_none());
    }
}
