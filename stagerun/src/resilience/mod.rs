//! Retry and circuit-breaker failure handling around a single stage.
//!
//! - [`RetryPolicy`] bounds the attempt loop with exponential backoff
//! - [`CircuitBreaker`] fails fast once a stage is persistently broken
//! - [`run_guarded`] composes both around one stage invocation

mod circuit_breaker;
mod guard;
mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitPermit, CircuitSnapshot,
    CircuitState,
};
pub use guard::{run_guarded, GuardError, GuardedOutcome};
pub use retry::{JitterStrategy, RetryConfig, RetryDecision, RetryPolicy, RetryPredicate, RetryState};
