use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::JobError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

struct Inner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<Instant>,
}

/// Circuit breaker guarding calls to the transcription engine.
///
/// closed -> open once `failure_threshold` guarded failures accumulate;
/// open -> half_open after `recovery_timeout` since the last failure;
/// half_open -> closed after 2 consecutive successes, back to open on any
/// failure. Shared by reference across executors; construct one per
/// protected downstream, never a process-wide global.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_at: None,
            }),
        }
    }

    pub fn recovery_timeout(&self) -> Duration {
        self.config.recovery_timeout
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    /// Fast-reject check. A refusal here does not consume retry budget.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let recovered = inner
                    .last_failure_at
                    .map(|t| t.elapsed() >= self.config.recovery_timeout)
                    .unwrap_or(true);
                if recovered {
                    inner.state = BreakerState::HalfOpen;
                    inner.success_count = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= 2 {
                    inner.state = BreakerState::Closed;
                    inner.failure_count = 0;
                }
            }
            BreakerState::Closed => {
                inner.failure_count = 0;
            }
            BreakerState::Open => {}
        }
    }

    /// Only failures in the guarded class (transient/infrastructure) count
    /// toward the threshold; client errors say nothing about engine health.
    pub fn record_failure(&self, failure: &JobError) {
        if !failure.is_retryable() {
            return;
        }

        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.failure_count += 1;
        inner.last_failure_at = Some(Instant::now());

        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                tracing::warn!("circuit breaker re-opened by failure while half-open");
            }
            BreakerState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    tracing::warn!(
                        failures = inner.failure_count,
                        "circuit breaker opened"
                    );
                }
            }
            BreakerState::Open => {}
        }
    }
}
