//! Built-in hooks: structured logging and in-memory recording.

use super::LifecycleHook;
use crate::core::{PipelineRun, StageResult};
use crate::errors::StagerunError;
use parking_lot::RwLock;
use tracing::{debug, info, warn, Level};

/// A hook that logs lifecycle events using the tracing framework.
#[derive(Debug, Clone)]
pub struct LoggingHook {
    /// The log level used for stage progress.
    level: Level,
}

impl Default for LoggingHook {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingHook {
    /// Creates a new logging hook with the specified level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging hook.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn progress(&self, event: &str, run_id: &str, stage: &StageResult) {
        if self.level == Level::DEBUG {
            debug!(
                run_id,
                stage = %stage.name,
                status = %stage.status,
                attempts = stage.attempt_count,
                "Stage {}", event
            );
        } else {
            info!(
                run_id,
                stage = %stage.name,
                status = %stage.status,
                attempts = stage.attempt_count,
                "Stage {}", event
            );
        }
    }
}

impl LifecycleHook for LoggingHook {
    fn on_run_start(&self, run: &PipelineRun) {
        info!(run_id = %run.run_id, pipeline = %run.pipeline, stages = run.stages.len(), "Run started");
    }

    fn on_stage_start(&self, run_id: &str, stage: &StageResult) {
        self.progress("started", run_id, stage);
    }

    fn on_stage_complete(&self, run_id: &str, stage: &StageResult) {
        self.progress("completed", run_id, stage);
    }

    fn on_stage_skip(&self, run_id: &str, stage: &StageResult) {
        self.progress("skipped", run_id, stage);
    }

    fn on_stage_restored(&self, run_id: &str, stage: &StageResult) {
        self.progress("restored from checkpoint", run_id, stage);
    }

    fn on_stage_error(&self, run_id: &str, stage: &StageResult, error: &StagerunError) {
        warn!(
            run_id,
            stage = %stage.name,
            attempts = stage.attempt_count,
            error = %error,
            "Stage failed"
        );
    }

    fn on_run_finish(&self, run: &PipelineRun) {
        info!(
            run_id = %run.run_id,
            status = %run.status,
            abort_reason = ?run.abort_reason,
            "Run finished"
        );
    }
}

/// A hook that records event labels, for tests.
///
/// Stage events are recorded as `<stage>-<event>` (`ingest-start`,
/// `ingest-complete`, `export-skip`, `ingest-restored`, `export-error`); run
/// events as `run-start` and `run-finish:<status>`.
#[derive(Debug, Default)]
pub struct RecordingHook {
    events: RwLock<Vec<String>>,
}

impl RecordingHook {
    /// Creates a new recording hook.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all recorded labels.
    #[must_use]
    pub fn events(&self) -> Vec<String> {
        self.events.read().clone()
    }

    /// Returns recorded labels excluding run-level events.
    #[must_use]
    pub fn stage_events(&self) -> Vec<String> {
        self.events
            .read()
            .iter()
            .filter(|e| !e.starts_with("run-"))
            .cloned()
            .collect()
    }

    /// Clears all recorded labels.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    fn push(&self, label: String) {
        self.events.write().push(label);
    }
}

impl LifecycleHook for RecordingHook {
    fn on_run_start(&self, _run: &PipelineRun) {
        self.push("run-start".to_string());
    }

    fn on_stage_start(&self, _run_id: &str, stage: &StageResult) {
        self.push(format!("{}-start", stage.name));
    }

    fn on_stage_complete(&self, _run_id: &str, stage: &StageResult) {
        self.push(format!("{}-complete", stage.name));
    }

    fn on_stage_skip(&self, _run_id: &str, stage: &StageResult) {
        self.push(format!("{}-skip", stage.name));
    }

    fn on_stage_restored(&self, _run_id: &str, stage: &StageResult) {
        self.push(format!("{}-restored", stage.name));
    }

    fn on_stage_error(&self, _run_id: &str, stage: &StageResult, _error: &StagerunError) {
        self.push(format!("{}-error", stage.name));
    }

    fn on_run_finish(&self, run: &PipelineRun) {
        self.push(format!("run-finish:{}", run.status));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Checkpoint;

    #[test]
    fn test_recording_hook_labels() {
        let hook = RecordingHook::new();
        let run = Checkpoint::new("run-1", "p").to_run();

        hook.on_run_start(&run);
        hook.on_stage_start("run-1", &StageResult::pending("A"));
        hook.on_stage_complete("run-1", &StageResult::pending("A"));
        hook.on_stage_skip("run-1", &StageResult::pending("B"));
        hook.on_run_finish(&run);

        assert_eq!(hook.stage_events(), vec!["A-start", "A-complete", "B-skip"]);
        assert_eq!(hook.events().first().map(String::as_str), Some("run-start"));
        assert_eq!(hook.events().last().map(String::as_str), Some("run-finish:initialized"));

        hook.clear();
        assert!(hook.events().is_empty());
    }

    #[test]
    fn test_logging_hook_does_not_panic() {
        let hook = LoggingHook::debug();
        let stage = StageResult::pending("A");
        hook.on_stage_start("run-1", &stage);
        hook.on_stage_error("run-1", &stage, &StagerunError::Cancelled("stop".into()));
        LoggingHook::default().on_stage_complete("run-1", &stage);
    }
}
