//! Mock stages for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::core::StageOutput;
use crate::errors::StageError;
use crate::stages::{Stage, StageContext};

/// A stage that records calls and returns a configurable output.
#[derive(Debug)]
pub struct MockStage {
    output: Mutex<StageOutput>,
    calls: Mutex<Vec<StageContext>>,
}

impl MockStage {
    /// Creates a mock returning an empty output.
    #[must_use]
    pub fn new() -> Self {
        Self::with_output(StageOutput::empty())
    }

    /// Creates a mock returning `output`.
    #[must_use]
    pub fn with_output(output: StageOutput) -> Self {
        Self {
            output: Mutex::new(output),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Creates a shared mock, so tests can inspect it after registration.
    #[must_use]
    pub fn shared(output: StageOutput) -> Arc<Self> {
        Arc::new(Self::with_output(output))
    }

    /// Sets the output to return.
    pub fn set_output(&self, output: StageOutput) {
        *self.output.lock() = output;
    }

    /// Returns the number of times the stage was called.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Returns the context of every call.
    #[must_use]
    pub fn recorded_contexts(&self) -> Vec<StageContext> {
        self.calls.lock().clone()
    }

    /// Resets call tracking.
    pub fn reset(&self) {
        self.calls.lock().clear();
    }
}

impl Default for MockStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Stage for MockStage {
    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput, StageError> {
        self.calls.lock().push(ctx.clone());
        Ok(self.output.lock().clone())
    }
}

/// Fails with a transient error a fixed number of times, then succeeds.
#[derive(Debug)]
pub struct ScriptedStage {
    failures: u32,
    output: StageOutput,
    calls: AtomicU32,
}

impl ScriptedStage {
    /// Creates a stage that fails `failures` times before succeeding.
    #[must_use]
    pub fn new(failures: u32, output: StageOutput) -> Self {
        Self {
            failures,
            output,
            calls: AtomicU32::new(0),
        }
    }

    /// Returns the number of times the stage was called.
    #[must_use]
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Stage for ScriptedStage {
    async fn execute(&self, _ctx: &StageContext) -> Result<StageOutput, StageError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(StageError::transient(format!("scripted failure {call}")));
        }
        Ok(self.output.clone())
    }
}

/// A stage that always fails.
#[derive(Debug)]
pub struct FailingStage {
    message: String,
    retryable: bool,
    calls: AtomicU32,
}

impl FailingStage {
    /// Creates a stage failing with a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            calls: AtomicU32::new(0),
        }
    }

    /// Creates a stage failing with a permanent error.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            calls: AtomicU32::new(0),
        }
    }

    /// Returns the number of times the stage was called.
    #[must_use]
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Stage for FailingStage {
    async fn execute(&self, _ctx: &StageContext) -> Result<StageOutput, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.retryable {
            Err(StageError::transient(self.message.clone()))
        } else {
            Err(StageError::permanent(self.message.clone()))
        }
    }
}

/// A stage that sleeps before succeeding, returning early on cancellation.
#[derive(Debug)]
pub struct SlowStage {
    delay: Duration,
}

impl SlowStage {
    /// Creates a slow stage.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Stage for SlowStage {
    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput, StageError> {
        tokio::select! {
            () = tokio::time::sleep(self.delay) => Ok(StageOutput::empty()),
            () = ctx.cancellation.cancelled() => {
                Err(StageError::permanent(ctx.cancellation.reason_or_default()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_stage() {
        let stage = ScriptedStage::new(2, StageOutput::artifact("out"));
        let ctx = StageContext::for_test("transform");
        assert!(stage.execute(&ctx).await.is_err());
        assert!(stage.execute(&ctx).await.is_err());
        assert_eq!(
            stage.execute(&ctx).await.unwrap().artifact_ref.as_deref(),
            Some("out")
        );
        assert_eq!(stage.call_count(), 3);
    }

    #[tokio::test]
    async fn test_mock_stage_records_contexts() {
        let stage = MockStage::new();
        stage.execute(&StageContext::for_test("ingest").with_attempt(2)).await.unwrap();
        assert_eq!(stage.call_count(), 1);
        assert_eq!(stage.recorded_contexts()[0].attempt, 2);
        stage.reset();
        assert_eq!(stage.call_count(), 0);
    }

    #[tokio::test]
    async fn test_failing_stage_classification() {
        let ctx = StageContext::for_test("export");
        let transient = FailingStage::transient("503");
        assert!(transient.execute(&ctx).await.unwrap_err().is_retryable());
        let permanent = FailingStage::permanent("bad input");
        assert!(!permanent.execute(&ctx).await.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn test_slow_stage_observes_cancellation() {
        let stage = SlowStage::new(Duration::from_secs(30));
        let ctx = StageContext::for_test("render");
        ctx.cancellation.cancel("shutdown");
        assert!(stage.execute(&ctx).await.is_err());
    }
}
