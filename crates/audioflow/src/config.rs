#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Jobs are enqueued for out-of-process workers.
    Pool,
    /// Jobs run on the request-handling runtime.
    Inline,
}

impl ExecutionMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "pool" => Some(ExecutionMode::Pool),
            "inline" => Some(ExecutionMode::Inline),
            _ => None,
        }
    }
}

/// Runtime configuration, loaded from the environment once at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub api_addr: String,
    pub mode: ExecutionMode,
    pub queue: String,
    pub whisper_url: String,
    pub worker_id: String,
    pub lease_seconds: i64,
    pub migrate_on_startup: bool,
    pub keepalive_interval_secs: u64,
    pub retention_days: i64,
    pub maintenance_interval_secs: u64,
    pub default_max_retries: i32,
    pub engine_timeout_secs: u64,
    pub soft_time_limit_secs: u64,
    pub hard_time_limit_secs: u64,
    pub reap_interval_ms: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL is missing"))?;

        let api_addr = env_or_fallback("AUDIOFLOW_API_ADDR", "API_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8000".to_string());

        let mode = env_or_fallback("AUDIOFLOW_MODE", "EXECUTION_MODE")
            .and_then(|s| ExecutionMode::parse(&s))
            .unwrap_or(ExecutionMode::Pool);

        let queue = env_or_fallback("AUDIOFLOW_QUEUE", "QUEUE")
            .unwrap_or_else(|| "audio_processing".to_string());

        let whisper_url = env_or_fallback("AUDIOFLOW_WHISPER_URL", "WHISPER_SERVICE_URL")
            .unwrap_or_else(|| "http://localhost:8080".to_string());

        let worker_id = env_or_fallback("AUDIOFLOW_WORKER_ID", "WORKER_ID")
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "worker-1".to_string());

        let lease_seconds = env_or_fallback("AUDIOFLOW_LEASE_SECONDS", "LEASE_SECONDS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(60);

        let migrate_on_startup = env_bool("AUDIOFLOW_MIGRATE_ON_STARTUP").unwrap_or(false);

        let keepalive_interval_secs = env_or_fallback("AUDIOFLOW_KEEPALIVE_SECS", "KEEPALIVE_SECS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        let retention_days = env_or_fallback("AUDIOFLOW_RETENTION_DAYS", "RETENTION_DAYS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(7);

        let maintenance_interval_secs =
            env_or_fallback("AUDIOFLOW_MAINTENANCE_INTERVAL_SECS", "MAINTENANCE_INTERVAL_SECS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(60);

        let default_max_retries = env_or_fallback("AUDIOFLOW_MAX_RETRIES", "MAX_RETRIES")
            .and_then(|s| s.parse().ok())
            .unwrap_or(3);

        let engine_timeout_secs =
            env_or_fallback("AUDIOFLOW_ENGINE_TIMEOUT_SECS", "ENGINE_TIMEOUT_SECS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(300);

        // Wall-clock limits for pool-mode attempts: warn at the soft limit,
        // kill at the hard limit.
        let soft_time_limit_secs =
            env_or_fallback("AUDIOFLOW_SOFT_TIME_LIMIT_SECS", "SOFT_TIME_LIMIT_SECS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(3300);

        let hard_time_limit_secs =
            env_or_fallback("AUDIOFLOW_HARD_TIME_LIMIT_SECS", "HARD_TIME_LIMIT_SECS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(3600);

        let reap_interval_ms = env_or_fallback("AUDIOFLOW_REAP_INTERVAL_MS", "REAP_INTERVAL_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(5_000);

        Ok(Self {
            database_url,
            api_addr,
            mode,
            queue,
            whisper_url,
            worker_id,
            lease_seconds,
            migrate_on_startup,
            keepalive_interval_secs,
            retention_days,
            maintenance_interval_secs,
            default_max_retries,
            engine_timeout_secs,
            soft_time_limit_secs,
            hard_time_limit_secs,
            reap_interval_ms,
        })
    }
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}
