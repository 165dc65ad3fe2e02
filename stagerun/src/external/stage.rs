//! A stage that delegates its body to a worker process.

use super::ExternalProcessExecutor;
use crate::core::StageOutput;
use crate::errors::{truncate_diagnostics, ExternalProcessError, StageError};
use crate::stages::{Stage, StageContext};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Default per-invocation worker timeout.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(300);

/// Runs a stage by invoking a worker task.
///
/// The worker receives `{run_id, stage, attempt, options, inputs}` as its
/// arguments and must return a result shaped like a [`StageOutput`].
#[derive(Debug, Clone)]
pub struct ExternalStage {
    task: String,
    executor: Arc<ExternalProcessExecutor>,
    timeout: Duration,
}

impl ExternalStage {
    /// Creates a stage running `task` on `executor`.
    #[must_use]
    pub fn new(task: impl Into<String>, executor: Arc<ExternalProcessExecutor>) -> Self {
        Self {
            task: task.into(),
            executor,
            timeout: DEFAULT_TASK_TIMEOUT,
        }
    }

    /// Sets the worker timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The task name.
    #[must_use]
    pub fn task(&self) -> &str {
        &self.task
    }
}

#[async_trait]
impl Stage for ExternalStage {
    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput, StageError> {
        let arguments = serde_json::json!({
            "run_id": ctx.run_id,
            "stage": ctx.stage,
            "attempt": ctx.attempt,
            "options": ctx.options,
            "inputs": ctx.inputs.to_json(),
        });

        let result = self
            .executor
            .execute_with_cancel(&self.task, arguments, self.timeout, &ctx.cancellation)
            .await?;

        serde_json::from_value(result.clone()).map_err(|e| {
            StageError::External(ExternalProcessError::MalformedOutput {
                task: self.task.clone(),
                reason: format!("result is not a stage output: {e}"),
                stdout: truncate_diagnostics(result.to_string().as_bytes()),
            })
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::external::PROTOCOL;
    use serde_json::json;
    use tempfile::TempDir;

    fn stage_for(dir: &TempDir, body: &str) -> ExternalStage {
        let path = dir.path().join("worker.sh");
        std::fs::write(&path, body).unwrap();
        let executor = ExternalProcessExecutor::new("sh").with_arg(path.display().to_string());
        ExternalStage::new("render", Arc::new(executor)).with_timeout(Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_external_stage_output() {
        let dir = TempDir::new().unwrap();
        let body = format!(
            "req=$(cat)\nprintf '{{\"protocol\":\"{PROTOCOL}\",\"correlation_id\":\"%s\",\"task\":\"render\",\"result\":{{\"artifact_ref\":\"frames/1\",\"data\":%s}}}}' \"$STAGERUN_CORRELATION_ID\" \"$req\"\n"
        );
        let stage = stage_for(&dir, &body);
        let ctx = StageContext::for_test("render").with_options(json!({"fps": 24}));

        let output = stage.execute(&ctx).await.unwrap();
        assert_eq!(output.artifact_ref.as_deref(), Some("frames/1"));
        assert_eq!(output.data["arguments"]["stage"], json!("render"));
        assert_eq!(output.data["arguments"]["options"], json!({"fps": 24}));
        assert_eq!(output.data["arguments"]["run_id"], json!("test-run"));
    }

    #[tokio::test]
    async fn test_external_stage_failure_is_retryable() {
        let dir = TempDir::new().unwrap();
        let stage = stage_for(&dir, "exit 1\n");

        let err = stage.execute(&StageContext::for_test("render")).await.unwrap_err();
        assert!(matches!(err, StageError::External(ExternalProcessError::NonZeroExit { .. })));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_external_stage_rejects_non_output_result() {
        let dir = TempDir::new().unwrap();
        let body = format!(
            "cat > /dev/null\nprintf '{{\"protocol\":\"{PROTOCOL}\",\"correlation_id\":\"%s\",\"task\":\"render\",\"result\":{{\"artifact_ref\":7}}}}' \"$STAGERUN_CORRELATION_ID\"\n"
        );
        let stage = stage_for(&dir, &body);

        let err = stage.execute(&StageContext::for_test("render")).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
