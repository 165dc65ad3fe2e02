//! Per-stage circuit breaker.
//!
//! Closed breakers let calls through and count consecutive failures. Once
//! `failure_threshold` is reached the breaker opens and rejects calls until
//! `recovery_timeout` has elapsed; it then allows exactly one probe
//! (half-open). A successful probe closes the breaker, a failed one re-opens
//! it.

use crate::errors::{CircuitOpenError, ConfigurationError};
use crate::utils::{now_utc, Timestamp};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_ms() -> u64 {
    60_000
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Time spent open before a probe is allowed, in milliseconds.
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Sets the failure threshold.
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Sets the recovery timeout.
    #[must_use]
    pub fn with_recovery_timeout_ms(mut self, timeout: u64) -> Self {
        self.recovery_timeout_ms = timeout;
        self
    }

    /// Recovery timeout as a duration.
    #[must_use]
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.failure_threshold < 1 {
            return Err(ConfigurationError::new(
                "circuit_breaker.failure_threshold must be >= 1",
            ));
        }
        Ok(())
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through.
    #[default]
    Closed,
    /// Calls are rejected.
    Open,
    /// A single probe call is allowed.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    /// Stage name.
    pub stage: String,
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures.
    pub consecutive_failures: u32,
    /// Most recent failure.
    pub last_failure: Option<Timestamp>,
}

#[derive(Debug, Default)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Timestamp>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// A circuit breaker scoped to one stage name.
#[derive(Debug)]
pub struct CircuitBreaker {
    stage: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    #[must_use]
    pub fn new(stage: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            stage: stage.into(),
            config,
            inner: Mutex::new(BreakerInner::default()),
        }
    }

    /// Returns the breaker configuration.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Asks permission to make a call.
    ///
    /// Fails with [`CircuitOpenError`] while open, or while half-open with
    /// the single probe already taken. A granted probe stays taken until a
    /// result is recorded or [`release_probe`](Self::release_probe) is
    /// called; prefer [`permit`](Self::permit) when the call may be dropped.
    pub fn acquire(&self) -> Result<(), CircuitOpenError> {
        self.admit().map(|_| ())
    }

    /// Like [`acquire`](Self::acquire), but returns a permit that gives the
    /// half-open probe back if it is dropped without a recorded result.
    pub fn permit(&self) -> Result<CircuitPermit<'_>, CircuitOpenError> {
        let probe = self.admit()?;
        Ok(CircuitPermit {
            breaker: self,
            probe,
            settled: false,
        })
    }

    /// Returns the rejection a call would get right now, without taking the
    /// probe.
    pub fn check(&self) -> Result<(), CircuitOpenError> {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map_or(Duration::MAX, |t| t.elapsed());
                let timeout = self.config.recovery_timeout();
                if elapsed >= timeout {
                    Ok(())
                } else {
                    Err(self.open_error(&inner, timeout.saturating_sub(elapsed)))
                }
            }
            CircuitState::HalfOpen if inner.probe_in_flight => {
                Err(self.open_error(&inner, Duration::ZERO))
            }
            CircuitState::HalfOpen => Ok(()),
        }
    }

    /// Admits a call; `Ok(true)` means the caller holds the half-open probe.
    fn admit(&self) -> Result<bool, CircuitOpenError> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map_or(Duration::MAX, |t| t.elapsed());
                let timeout = self.config.recovery_timeout();
                if elapsed >= timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    tracing::info!(stage = %self.stage, "Circuit half-open, allowing probe");
                    Ok(true)
                } else {
                    Err(self.open_error(&inner, timeout.saturating_sub(elapsed)))
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(self.open_error(&inner, Duration::ZERO))
                } else {
                    inner.probe_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    /// Records a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            tracing::info!(stage = %self.stage, "Circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    /// Records a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(now_utc());
        inner.probe_in_flight = false;

        let should_open = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            CircuitState::Open => false,
        };
        if should_open {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            tracing::warn!(
                stage = %self.stage,
                consecutive_failures = inner.consecutive_failures,
                recovery_timeout_ms = self.config.recovery_timeout_ms,
                "Circuit opened"
            );
        }
    }

    /// Gives back a half-open probe without counting a result.
    pub fn release_probe(&self) {
        self.inner.lock().probe_in_flight = false;
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Returns a snapshot of the breaker.
    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        CircuitSnapshot {
            stage: self.stage.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_failure: inner.last_failure,
        }
    }

    /// Forces the breaker back to closed.
    pub fn reset(&self) {
        *self.inner.lock() = BreakerInner::default();
    }

    fn open_error(&self, inner: &BreakerInner, retry_in: Duration) -> CircuitOpenError {
        CircuitOpenError {
            stage: self.stage.clone(),
            consecutive_failures: inner.consecutive_failures,
            last_failure: inner.last_failure,
            retry_in,
        }
    }
}

/// Admission to one call through a [`CircuitBreaker`].
///
/// Consume it with [`success`](Self::success), [`failure`](Self::failure)
/// or [`release`](Self::release). Dropping it unsettled releases a held
/// half-open probe.
#[derive(Debug)]
#[must_use = "dropping a permit discards the call result"]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl CircuitPermit<'_> {
    /// True if this call is the half-open probe.
    #[must_use]
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Records a successful call.
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    /// Records a failed call.
    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }

    /// Gives the permit back without counting a result.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.release_probe();
            tracing::debug!(stage = %self.breaker.stage, "Released unsettled probe");
        }
    }
}

/// Process-wide registry handing out one breaker per stage name.
///
/// Share it between orchestrators (as `Arc<CircuitBreakerRegistry>`) to keep
/// failure history across runs in the same process.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the breaker for `stage`, creating it with `config` on first use.
    ///
    /// The configuration of the first caller wins.
    pub fn get_or_create(&self, stage: &str, config: &CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(stage.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(stage, config.clone())))
            .clone()
    }

    /// Returns a snapshot of the breaker for `stage`, if one exists.
    #[must_use]
    pub fn snapshot(&self, stage: &str) -> Option<CircuitSnapshot> {
        self.breakers.get(stage).map(|b| b.snapshot())
    }

    /// Resets the breaker for `stage`. Returns false if none exists.
    pub fn reset(&self, stage: &str) -> bool {
        self.breakers.get(stage).map(|b| b.reset()).is_some()
    }

    /// Number of breakers created so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Returns true if no breaker has been created.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "transform",
            CircuitBreakerConfig::default()
                .with_failure_threshold(threshold)
                .with_recovery_timeout_ms(recovery_ms),
        )
    }

    #[test]
    fn test_opens_after_threshold() {
        let cb = breaker(3, 60_000);
        for _ in 0..2 {
            assert!(cb.acquire().is_ok());
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Closed);

        assert!(cb.acquire().is_ok());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        let err = cb.acquire().unwrap_err();
        assert_eq!(err.stage, "transform");
        assert_eq!(err.consecutive_failures, 3);
        assert!(err.last_failure.is_some());
        assert!(err.retry_in > Duration::ZERO);
    }

    #[test]
    fn test_success_resets_counter() {
        let cb = breaker(2, 60_000);
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().consecutive_failures, 1);
    }

    #[test]
    fn test_half_open_allows_single_probe() {
        let cb = breaker(1, 10);
        cb.record_failure();
        assert!(cb.acquire().is_err());

        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.acquire().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.acquire().is_err());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.acquire().is_ok());
    }

    #[test]
    fn test_failed_probe_reopens() {
        let cb = breaker(1, 10);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));

        assert!(cb.acquire().is_ok());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.acquire().is_err());
    }

    #[test]
    fn test_released_probe_can_be_retaken() {
        let cb = breaker(1, 10);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));

        assert!(cb.acquire().is_ok());
        cb.release_probe();
        assert!(cb.acquire().is_ok());
    }

    #[test]
    fn test_dropped_probe_permit_is_released() {
        let cb = breaker(1, 10);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));

        let permit = cb.permit().unwrap();
        assert!(permit.is_probe());
        assert!(cb.check().is_err());
        drop(permit);

        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.check().is_ok());
        let permit = cb.permit().unwrap();
        permit.success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_closed_permit_drop_keeps_probe_of_other_caller() {
        let cb = breaker(1, 10);
        let closed = cb.permit().unwrap();
        assert!(!closed.is_probe());

        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        let probe = cb.permit().unwrap();
        drop(closed);

        assert!(cb.permit().is_err());
        probe.failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_check_does_not_take_probe() {
        let cb = breaker(1, 60_000);
        assert!(cb.check().is_ok());
        cb.record_failure();
        let err = cb.check().unwrap_err();
        assert!(err.retry_in > Duration::from_secs(59));
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_registry_shares_breakers() {
        let registry = CircuitBreakerRegistry::new();
        let config = CircuitBreakerConfig::default().with_failure_threshold(1);

        let a = registry.get_or_create("ingest", &config);
        let b = registry.get_or_create("ingest", &CircuitBreakerConfig::default());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.config().failure_threshold, 1);

        a.record_failure();
        assert_eq!(registry.snapshot("ingest").unwrap().state, CircuitState::Open);

        assert!(registry.reset("ingest"));
        assert_eq!(registry.snapshot("ingest").unwrap().state, CircuitState::Closed);
        assert!(!registry.reset("missing"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_config_validate() {
        assert!(CircuitBreakerConfig::default().validate().is_ok());
        assert!(CircuitBreakerConfig::default()
            .with_failure_threshold(0)
            .validate()
            .is_err());
    }
}
