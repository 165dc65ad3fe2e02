//! The guarded attempt loop: circuit breaker first, then bounded retry.

use super::{CircuitBreaker, RetryDecision, RetryPolicy, RetryState};
use crate::cancellation::CancellationToken;
use crate::errors::{CircuitOpenError, StageError};
use std::future::Future;
use thiserror::Error;
use tracing::{debug, warn};

/// Why a guarded invocation did not produce a value.
#[derive(Debug, Error)]
pub enum GuardError {
    /// The last attempt failed and no further attempt is allowed.
    #[error(transparent)]
    Stage(StageError),
    /// The breaker rejected the call before the body ran.
    #[error(transparent)]
    CircuitOpen(CircuitOpenError),
    /// Cancellation was requested.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

/// Result of a guarded invocation plus the number of attempts made.
#[derive(Debug)]
pub struct GuardedOutcome<T> {
    /// The final result.
    pub result: Result<T, GuardError>,
    /// Attempts that actually invoked the body.
    pub attempts: u32,
}

impl<T> GuardedOutcome<T> {
    fn new(result: Result<T, GuardError>, state: &RetryState) -> Self {
        Self {
            result,
            attempts: state.attempt,
        }
    }
}

/// Runs `attempt_fn` under `breaker` and `policy`.
///
/// Before every attempt the cancellation token and the breaker are
/// consulted. Each failure is counted by the breaker and each success resets
/// it. Non-retryable errors end the loop after the attempt that raised them;
/// retryable ones are retried up to `max_attempts` and the last error is
/// returned on exhaustion. The wait between attempts wakes on cancellation,
/// and is skipped when the breaker would still reject the next attempt.
///
/// Dropping the returned future mid-attempt gives a held half-open probe
/// back to the breaker.
pub async fn run_guarded<T, F, Fut>(
    stage: &str,
    policy: &RetryPolicy,
    breaker: &CircuitBreaker,
    cancel: &CancellationToken,
    mut attempt_fn: F,
) -> GuardedOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, StageError>>,
{
    let mut state = RetryState::new();

    loop {
        if cancel.is_cancelled() {
            return GuardedOutcome::new(
                Err(GuardError::Cancelled(cancel.reason_or_default())),
                &state,
            );
        }

        let permit = match breaker.permit() {
            Ok(permit) => permit,
            Err(open) => {
                warn!(stage, consecutive_failures = open.consecutive_failures, "Circuit open, not attempting");
                return GuardedOutcome::new(Err(GuardError::CircuitOpen(open)), &state);
            }
        };

        let attempt = state.begin_attempt();
        debug!(stage, attempt, probe = permit.is_probe(), "Attempt starting");

        let error = match attempt_fn(attempt).await {
            Ok(value) => {
                permit.success();
                return GuardedOutcome::new(Ok(value), &state);
            }
            Err(error) => error,
        };

        if error.is_cancellation() {
            permit.release();
            return GuardedOutcome::new(
                Err(GuardError::Cancelled(cancel.reason_or_default())),
                &state,
            );
        }

        permit.failure();

        match policy.decide(&state, &error) {
            RetryDecision::Retry(delay) => {
                if let Err(open) = breaker.check() {
                    if open.retry_in >= delay {
                        warn!(stage, attempt, error = %error, "Circuit opened, abandoning retries");
                        return GuardedOutcome::new(Err(GuardError::CircuitOpen(open)), &state);
                    }
                }
                state.last_delay = Some(delay);
                warn!(
                    stage,
                    attempt,
                    max_attempts = policy.config().max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error_kind = error.kind(),
                    error = %error,
                    "Attempt failed, retrying"
                );
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.cancelled() => {
                        return GuardedOutcome::new(
                            Err(GuardError::Cancelled(cancel.reason_or_default())),
                            &state,
                        );
                    }
                }
            }
            RetryDecision::GiveUp => {
                warn!(stage, attempt, error = %error, "Retries exhausted");
                return GuardedOutcome::new(Err(GuardError::Stage(error)), &state);
            }
            RetryDecision::NotRetryable => {
                warn!(stage, attempt, error_kind = error.kind(), error = %error, "Non-retryable failure");
                return GuardedOutcome::new(Err(GuardError::Stage(error)), &state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::{CircuitBreakerConfig, CircuitState, RetryConfig};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            RetryConfig::new()
                .with_max_attempts(max_attempts)
                .with_initial_delay_ms(1)
                .with_max_delay_ms(5),
        )
    }

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "stage",
            CircuitBreakerConfig::default().with_failure_threshold(threshold),
        )
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let outcome = run_guarded("stage", &fast_policy(3), &breaker(10), &CancellationToken::new(), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(StageError::transient("flaky"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(outcome.result.unwrap(), 3);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_bound_respected() {
        let calls = AtomicU32::new(0);
        let outcome: GuardedOutcome<()> =
            run_guarded("stage", &fast_policy(4), &breaker(100), &CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(StageError::transient("down")) }
            })
            .await;

        assert!(matches!(outcome.result, Err(GuardError::Stage(StageError::Transient(_)))));
        assert_eq!(outcome.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_on_first_attempt() {
        let outcome: GuardedOutcome<()> =
            run_guarded("stage", &fast_policy(5), &breaker(10), &CancellationToken::new(), |_| async {
                Err(StageError::permanent("bad input"))
            })
            .await;

        assert!(matches!(outcome.result, Err(GuardError::Stage(StageError::Permanent(_)))));
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_open_circuit_skips_body() {
        let cb = breaker(2);
        let outcome: GuardedOutcome<()> =
            run_guarded("stage", &fast_policy(5), &cb, &CancellationToken::new(), |_| async {
                Err(StageError::transient("down"))
            })
            .await;
        assert!(matches!(outcome.result, Err(GuardError::CircuitOpen(_))));
        assert_eq!(outcome.attempts, 2);
        assert_eq!(cb.state(), CircuitState::Open);

        let calls = AtomicU32::new(0);
        let outcome: GuardedOutcome<()> =
            run_guarded("stage", &fast_policy(5), &cb, &CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        assert!(matches!(outcome.result, Err(GuardError::CircuitOpen(_))));
        assert_eq!(outcome.attempts, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let token = Arc::new(CancellationToken::new());
        let policy = RetryPolicy::new(
            RetryConfig::new()
                .with_max_attempts(5)
                .with_initial_delay_ms(60_000)
                .with_max_delay_ms(60_000),
        );

        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                token.cancel("operator abort");
            })
        };

        let outcome: GuardedOutcome<()> = tokio::time::timeout(
            Duration::from_secs(5),
            run_guarded("stage", &policy, &breaker(10), &token, |_| async {
                Err(StageError::transient("down"))
            }),
        )
        .await
        .expect("backoff should wake on cancellation");
        canceller.await.unwrap();

        match outcome.result {
            Err(GuardError::Cancelled(reason)) => assert_eq!(reason, "operator abort"),
            other => panic!("expected cancellation, got {other:?}"),
        }
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let token = CancellationToken::new();
        token.cancel("stop");
        let outcome: GuardedOutcome<()> =
            run_guarded("stage", &fast_policy(3), &breaker(10), &token, |_| async { Ok(()) }).await;
        assert!(matches!(outcome.result, Err(GuardError::Cancelled(_))));
        assert_eq!(outcome.attempts, 0);
    }

    #[tokio::test]
    async fn test_dropped_probe_attempt_frees_breaker() {
        let cb = CircuitBreaker::new(
            "stage",
            CircuitBreakerConfig::default()
                .with_failure_threshold(1)
                .with_recovery_timeout_ms(10),
        );
        cb.record_failure();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            run_guarded("stage", &fast_policy(1), &cb, &CancellationToken::new(), |_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<(), StageError>(())
            }),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let outcome =
            run_guarded("stage", &fast_policy(1), &cb, &CancellationToken::new(), |_| async {
                Ok::<_, StageError>("recovered")
            })
            .await;
        assert_eq!(outcome.result.unwrap(), "recovered");
        assert_eq!(outcome.attempts, 1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_breaker_opening_skips_backoff() {
        let cb = CircuitBreaker::new(
            "stage",
            CircuitBreakerConfig::default()
                .with_failure_threshold(1)
                .with_recovery_timeout_ms(60_000),
        );
        let policy = RetryPolicy::new(
            RetryConfig::new()
                .with_max_attempts(5)
                .with_initial_delay_ms(30_000)
                .with_max_delay_ms(30_000),
        );

        let outcome: GuardedOutcome<()> = tokio::time::timeout(
            Duration::from_secs(5),
            run_guarded("stage", &policy, &cb, &CancellationToken::new(), |_| async {
                Err(StageError::transient("down"))
            }),
        )
        .await
        .expect("open breaker should not wait out the backoff");

        assert!(matches!(outcome.result, Err(GuardError::CircuitOpen(_))));
        assert_eq!(outcome.attempts, 1);
    }
}
