use rand::Rng;

use crate::error::JobError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    Fixed,
    Exponential,
    ExponentialJitter,
}

/// Retry decisions and backoff delays. Pure policy: callers supply the
/// attempt number (1-based) and an `Rng` for jitter so tests stay
/// deterministic.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: f64,
    pub max_delay: f64,
    pub strategy: BackoffStrategy,
    pub multiplier: f64,
    /// Jitter as a fraction of the computed delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: 1.0,
            max_delay: 60.0,
            strategy: BackoffStrategy::ExponentialJitter,
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Tuning for calls into the transcription engine.
    pub fn for_engine() -> Self {
        Self {
            max_attempts: 5,
            base_delay: 2.0,
            max_delay: 30.0,
            ..Self::default()
        }
    }

    /// Tuning for local file operations.
    pub fn for_io() -> Self {
        Self {
            max_attempts: 3,
            base_delay: 0.5,
            max_delay: 5.0,
            strategy: BackoffStrategy::Exponential,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Client/input failures never retry; transient failures retry while
    /// the attempt budget lasts.
    pub fn should_retry(&self, failure: &JobError, attempt: u32) -> bool {
        failure.is_retryable() && attempt < self.max_attempts
    }

    /// Delay in seconds before the next attempt. `attempt` is the 1-based
    /// number of the attempt that just failed.
    pub fn calculate_delay(&self, attempt: u32, rng: &mut impl Rng) -> f64 {
        let attempt = attempt.max(1);

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                self.base_delay * self.multiplier.powi(attempt as i32 - 1)
            }
            BackoffStrategy::ExponentialJitter => {
                let exponential = self.base_delay * self.multiplier.powi(attempt as i32 - 1);
                let capped = exponential.min(self.max_delay);
                let jitter_range = capped * self.jitter;
                capped + rng.gen_range(-jitter_range..=jitter_range)
            }
        };

        delay.min(self.max_delay).max(0.0)
    }

    /// Wrap the last underlying failure once the budget is spent.
    pub fn exhausted(&self, last: JobError, attempts: u32) -> JobError {
        JobError::RetryExhausted {
            attempts,
            source: Box::new(last),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    fn exponential() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 10,
            base_delay: 1.0,
            max_delay: 60.0,
            strategy: BackoffStrategy::Exponential,
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    #[test]
    fn exponential_doubles_then_caps() {
        let policy = exponential();
        let mut rng = rng();

        assert_eq!(policy.calculate_delay(1, &mut rng), 1.0);
        assert_eq!(policy.calculate_delay(2, &mut rng), 2.0);
        assert_eq!(policy.calculate_delay(3, &mut rng), 4.0);
        assert_eq!(policy.calculate_delay(4, &mut rng), 8.0);
        // 2^9 = 512s, capped at 60s
        assert_eq!(policy.calculate_delay(10, &mut rng), 60.0);
    }

    #[test]
    fn fixed_ignores_attempt_number() {
        let policy = RetryPolicy {
            strategy: BackoffStrategy::Fixed,
            base_delay: 3.0,
            ..exponential()
        };
        let mut rng = rng();
        assert_eq!(policy.calculate_delay(1, &mut rng), 3.0);
        assert_eq!(policy.calculate_delay(9, &mut rng), 3.0);
    }

    #[test]
    fn jitter_stays_within_band_and_never_negative() {
        let policy = RetryPolicy {
            strategy: BackoffStrategy::ExponentialJitter,
            jitter: 0.5,
            ..exponential()
        };
        let mut rng = rng();
        for attempt in 1..=12 {
            let base: f64 = 1.0 * 2.0f64.powi(attempt - 1);
            let capped = base.min(60.0);
            let delay = policy.calculate_delay(attempt as u32, &mut rng);
            assert!(delay >= 0.0);
            assert!(delay <= 60.0);
            assert!(delay >= capped * 0.5 - 1e-9 || capped >= 60.0);
        }
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let policy = RetryPolicy {
            strategy: BackoffStrategy::ExponentialJitter,
            jitter: 0.0,
            ..exponential()
        };
        let mut rng = rng();
        assert_eq!(policy.calculate_delay(3, &mut rng), 4.0);
    }

    #[test]
    fn transient_retries_until_budget_runs_out() {
        let policy = RetryPolicy::default().with_max_attempts(3);
        let transient = JobError::transient("ENGINE_ERROR", "503");

        assert!(policy.should_retry(&transient, 1));
        assert!(policy.should_retry(&transient, 2));
        assert!(!policy.should_retry(&transient, 3));
    }

    #[test]
    fn client_errors_never_retry() {
        let policy = RetryPolicy::default();
        assert!(!policy.should_retry(&JobError::Validation("bad".into()), 1));
        assert!(!policy.should_retry(&JobError::NotFound, 1));
        assert!(!policy.should_retry(&JobError::permanent("BAD_INPUT", "not audio"), 1));
    }

    #[test]
    fn exhausted_wraps_cause_and_attempt_count() {
        let policy = RetryPolicy::default().with_max_attempts(4);
        let err = policy.exhausted(JobError::transient("TIMEOUT", "engine timeout"), 4);
        match err {
            JobError::RetryExhausted { attempts, source } => {
                assert_eq!(attempts, 4);
                assert_eq!(source.code(), "TIMEOUT");
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
    }
}
