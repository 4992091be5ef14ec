use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::JobError;

pub const SUPPORTED_MODELS: &[&str] = &["tiny", "base", "small", "medium", "large"];
pub const SUPPORTED_LANGUAGES: &[&str] = &[
    "auto", "en", "es", "fr", "de", "it", "pt", "ru", "ja", "ko", "zh",
];

fn default_model() -> String {
    "base".to_string()
}

fn default_language() -> String {
    "auto".to_string()
}

fn default_true() -> bool {
    true
}

fn default_beam_size() -> i32 {
    5
}

/// Validated job configuration. `input_path` is required; everything else
/// has a default. Unknown extra fields are tolerated and preserved through
/// `extra` so callers can round-trip what they sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub input_path: String,

    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_true")]
    pub enable_diarization: bool,
    #[serde(default = "default_true")]
    pub enable_timestamps: bool,
    #[serde(default)]
    pub temperature: f64,
    #[serde(default = "default_beam_size")]
    pub beam_size: i32,
    #[serde(default = "default_true")]
    pub word_timestamps: bool,
    #[serde(default)]
    pub initial_prompt: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl JobConfig {
    /// Parse and normalize a raw config map. Type mismatches and a missing
    /// `input_path` are `Validation` errors; out-of-range numeric options
    /// are clamped and unrecognized model/language values fall back to
    /// their defaults rather than failing the request.
    pub fn validate(raw: &Value) -> Result<Self, JobError> {
        if !raw.is_object() {
            return Err(JobError::Validation("config must be an object".into()));
        }

        let mut cfg: JobConfig = serde_json::from_value(raw.clone())
            .map_err(|e| JobError::Validation(e.to_string()))?;

        if cfg.input_path.trim().is_empty() {
            return Err(JobError::Validation("input_path is required".into()));
        }

        if !SUPPORTED_MODELS.contains(&cfg.model.as_str()) {
            cfg.model = default_model();
        }
        if !SUPPORTED_LANGUAGES.contains(&cfg.language.as_str()) {
            cfg.language = default_language();
        }
        cfg.temperature = cfg.temperature.clamp(0.0, 1.0);
        cfg.beam_size = cfg.beam_size.clamp(1, 5);

        Ok(cfg)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }
}

/// Estimated processing time in seconds from input size and config:
/// 30 s per MB scaled by model tier, 1.5x with diarization, at least a
/// minute.
pub fn estimate_duration(size_bytes: u64, cfg: &JobConfig) -> i32 {
    let model_multiplier = match cfg.model.as_str() {
        "tiny" => 0.5,
        "base" => 1.0,
        "small" => 2.0,
        "medium" => 4.0,
        "large" => 8.0,
        _ => 1.0,
    };
    let diarization_multiplier = if cfg.enable_diarization { 1.5 } else { 1.0 };

    let size_mb = size_bytes as f64 / (1024.0 * 1024.0);
    let estimated = size_mb * 30.0 * model_multiplier * diarization_multiplier;

    (estimated as i32).max(60)
}

/// Fallback when the input cannot be statted.
pub const DEFAULT_ESTIMATED_DURATION: i32 = 300;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = JobConfig::validate(&json!({"input_path": "/data/a.wav"})).unwrap();
        assert_eq!(cfg.model, "base");
        assert_eq!(cfg.language, "auto");
        assert!(cfg.enable_diarization);
        assert_eq!(cfg.beam_size, 5);
        assert_eq!(cfg.temperature, 0.0);
    }

    #[test]
    fn missing_input_path_is_rejected() {
        assert!(matches!(
            JobConfig::validate(&json!({"model": "base"})),
            Err(JobError::Validation(_))
        ));
        assert!(matches!(
            JobConfig::validate(&json!({"input_path": "  "})),
            Err(JobError::Validation(_))
        ));
    }

    #[test]
    fn mistyped_recognized_field_is_rejected() {
        let err = JobConfig::validate(&json!({
            "input_path": "/data/a.wav",
            "beam_size": "five"
        }))
        .unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
    }

    #[test]
    fn unknown_optional_fields_are_tolerated_and_preserved() {
        let cfg = JobConfig::validate(&json!({
            "input_path": "/data/a.wav",
            "customer_ref": "acme-42"
        }))
        .unwrap();
        assert_eq!(
            cfg.extra.get("customer_ref"),
            Some(&json!("acme-42"))
        );
        // survives re-serialization
        let v = cfg.to_value();
        assert_eq!(v["customer_ref"], json!("acme-42"));
    }

    #[test]
    fn out_of_range_values_are_normalized() {
        let cfg = JobConfig::validate(&json!({
            "input_path": "/data/a.wav",
            "model": "enormous",
            "language": "tlh",
            "temperature": 7.5,
            "beam_size": 99
        }))
        .unwrap();
        assert_eq!(cfg.model, "base");
        assert_eq!(cfg.language, "auto");
        assert_eq!(cfg.temperature, 1.0);
        assert_eq!(cfg.beam_size, 5);
    }

    #[test]
    fn duration_estimate_scales_with_model_and_diarization() {
        let base = JobConfig::validate(&json!({
            "input_path": "/data/a.wav",
            "enable_diarization": false
        }))
        .unwrap();
        // 10 MB * 30 s/MB = 300 s
        assert_eq!(estimate_duration(10 * 1024 * 1024, &base), 300);

        let large = JobConfig::validate(&json!({
            "input_path": "/data/a.wav",
            "model": "large",
            "enable_diarization": false
        }))
        .unwrap();
        assert_eq!(estimate_duration(10 * 1024 * 1024, &large), 2400);

        // tiny files never estimate below one minute
        assert_eq!(estimate_duration(1024, &base), 60);
    }
}
