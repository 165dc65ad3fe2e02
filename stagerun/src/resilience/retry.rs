//! Retry policy with exponential backoff and optional jitter.
//!
//! The delay before attempt `n + 1` is
//! `min(max_delay, initial_delay * exponential_base^(n - 1))`, unless the
//! failing error carries an explicit retry-after signal, which wins.

use crate::errors::{ConfigurationError, StageError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Jitter strategy applied on top of the computed backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// Deterministic delays.
    #[default]
    None,
    /// Random from 0 to delay.
    Full,
    /// Half fixed, half random.
    Equal,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_exponential_base() -> f64 {
    2.0
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Growth factor between consecutive delays.
    #[serde(default = "default_exponential_base")]
    pub exponential_base: f64,
    /// Jitter strategy.
    #[serde(default)]
    pub jitter: JitterStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            exponential_base: default_exponential_base(),
            jitter: JitterStrategy::None,
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A config that makes exactly one attempt.
    #[must_use]
    pub fn no_retry() -> Self {
        Self::default().with_max_attempts(1)
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the initial delay.
    #[must_use]
    pub fn with_initial_delay_ms(mut self, delay: u64) -> Self {
        self.initial_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the exponential base.
    #[must_use]
    pub fn with_exponential_base(mut self, base: f64) -> Self {
        self.exponential_base = base;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter = strategy;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_attempts < 1 {
            return Err(ConfigurationError::new("retry.max_attempts must be >= 1"));
        }
        if !self.exponential_base.is_finite() || self.exponential_base < 1.0 {
            return Err(ConfigurationError::new("retry.exponential_base must be >= 1"));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(ConfigurationError::new(
                "retry.initial_delay_ms must not exceed retry.max_delay_ms",
            ));
        }
        Ok(())
    }

    /// Computed backoff before the attempt following failed attempt `attempt`
    /// (1-based), without jitter.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let raw = self.initial_delay_ms as f64 * self.exponential_base.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(self.max_delay_ms as f64)
        } else {
            self.max_delay_ms as f64
        };
        Duration::from_millis(capped.max(0.0) as u64)
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        let jittered = match self.jitter {
            JitterStrategy::None => millis,
            JitterStrategy::Full => {
                if millis == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=millis)
                }
            }
            JitterStrategy::Equal => {
                let half = millis / 2;
                if half == 0 {
                    millis
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
        };
        Duration::from_millis(jittered)
    }
}

/// Classifies errors as retryable.
pub type RetryPredicate = Arc<dyn Fn(&StageError) -> bool + Send + Sync>;

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry(Duration),
    /// No more attempts left.
    GiveUp,
    /// Don't retry, the error is not retryable.
    NotRetryable,
}

/// Per-invocation retry bookkeeping.
///
/// Lives for one stage execution and is discarded once the stage finalizes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryState {
    /// Attempts made so far.
    pub attempt: u32,
    /// Delay scheduled after the most recent failure.
    pub last_delay: Option<Duration>,
}

impl RetryState {
    /// Creates a new retry state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the start of a new attempt and returns its 1-based number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }
}

/// A retry configuration paired with a retryable-error predicate.
#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    predicate: Option<RetryPredicate>,
}

impl RetryPolicy {
    /// Creates a policy using [`StageError::is_retryable`] as the predicate.
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            predicate: None,
        }
    }

    /// Replaces the retryable-error predicate.
    #[must_use]
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&StageError) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Uses a shared predicate, if one is given.
    #[must_use]
    pub fn with_shared_predicate(mut self, predicate: Option<RetryPredicate>) -> Self {
        if predicate.is_some() {
            self.predicate = predicate;
        }
        self
    }

    /// Returns the underlying configuration.
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Returns true if the error may be retried.
    #[must_use]
    pub fn is_retryable(&self, error: &StageError) -> bool {
        self.predicate
            .as_ref()
            .map_or_else(|| error.is_retryable(), |p| p(error))
    }

    /// Delay before the next attempt after `attempt` failed with `error`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, error: &StageError) -> Duration {
        error.retry_after().unwrap_or_else(|| {
            self.config
                .apply_jitter(self.config.backoff_delay(attempt))
        })
    }

    /// Decides what to do after the attempt recorded in `state` failed.
    #[must_use]
    pub fn decide(&self, state: &RetryState, error: &StageError) -> RetryDecision {
        if !self.is_retryable(error) {
            return RetryDecision::NotRetryable;
        }
        if state.attempt >= self.config.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(self.delay_for(state.attempt, error))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .field("custom_predicate", &self.predicate.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.initial_delay_ms, 1000);
        assert_eq!(config.max_delay_ms, 30_000);
        assert!((config.exponential_base - 2.0).abs() < f64::EPSILON);
        assert_eq!(config.jitter, JitterStrategy::None);
    }

    #[test]
    fn test_retry_config_deserialize_defaults() {
        let config: RetryConfig = serde_json::from_str(r#"{"max_attempts": 5}"#).unwrap();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.initial_delay_ms, 1000);

        let config: RetryConfig = serde_json::from_str(r#"{"jitter": "equal"}"#).unwrap();
        assert_eq!(config.jitter, JitterStrategy::Equal);
    }

    #[test]
    fn test_validate() {
        assert!(RetryConfig::default().validate().is_ok());
        assert!(RetryConfig::default().with_max_attempts(0).validate().is_err());
        assert!(RetryConfig::default().with_exponential_base(0.5).validate().is_err());
        assert!(RetryConfig::default()
            .with_initial_delay_ms(10)
            .with_max_delay_ms(5)
            .validate()
            .is_err());
    }

    #[test]
    fn test_backoff_exponential() {
        let config = RetryConfig::new().with_initial_delay_ms(100);
        assert_eq!(config.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(config.backoff_delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_capped_and_non_decreasing() {
        let config = RetryConfig::new()
            .with_initial_delay_ms(1000)
            .with_max_delay_ms(5000);
        let delays: Vec<_> = (1..=40).map(|a| config.backoff_delay(a)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(config.backoff_delay(10), Duration::from_millis(5000));
        assert_eq!(config.backoff_delay(u32::MAX), Duration::from_millis(5000));
    }

    #[test]
    fn test_full_jitter_bounded() {
        let config = RetryConfig::new()
            .with_initial_delay_ms(100)
            .with_jitter(JitterStrategy::Full);
        for _ in 0..20 {
            assert!(config.apply_jitter(Duration::from_millis(100)) <= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_equal_jitter_bounded() {
        let config = RetryConfig::new().with_jitter(JitterStrategy::Equal);
        for _ in 0..20 {
            let d = config.apply_jitter(Duration::from_millis(100));
            assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_retry_after_overrides_backoff() {
        let policy = RetryPolicy::new(RetryConfig::new().with_initial_delay_ms(10));
        let err = StageError::rate_limited("slow down", Duration::from_secs(7));
        assert_eq!(policy.delay_for(1, &err), Duration::from_secs(7));
    }

    #[test]
    fn test_decide() {
        let policy = RetryPolicy::new(RetryConfig::new().with_max_attempts(2).with_initial_delay_ms(5));
        let mut state = RetryState::new();

        state.begin_attempt();
        assert_eq!(
            policy.decide(&state, &StageError::transient("flaky")),
            RetryDecision::Retry(Duration::from_millis(5))
        );

        state.begin_attempt();
        assert_eq!(policy.decide(&state, &StageError::transient("flaky")), RetryDecision::GiveUp);

        assert_eq!(
            policy.decide(&RetryState::new(), &StageError::permanent("bad input")),
            RetryDecision::NotRetryable
        );
    }

    #[test]
    fn test_custom_predicate() {
        let policy = RetryPolicy::default().with_predicate(|e| matches!(e, StageError::Permanent(_)));
        assert!(policy.is_retryable(&StageError::permanent("retry me anyway")));
        assert!(!policy.is_retryable(&StageError::transient("not this one")));
    }
}
