//! Lifecycle hooks notified as a run progresses.
//!
//! Hooks are observers: they cannot change the outcome of a stage, and a
//! panicking hook is logged and ignored.

mod sinks;

pub use sinks::{LoggingHook, RecordingHook};

use crate::core::{PipelineRun, StageResult};
use crate::errors::StagerunError;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Observer of run and stage lifecycle events.
///
/// Every method has an empty default so implementors override only what
/// they need.
#[allow(unused_variables)]
pub trait LifecycleHook: Send + Sync {
    /// The run moved to `Running`.
    fn on_run_start(&self, run: &PipelineRun) {}

    /// A stage is about to execute.
    fn on_stage_start(&self, run_id: &str, stage: &StageResult) {}

    /// A stage succeeded and its checkpoint entry was persisted.
    fn on_stage_complete(&self, run_id: &str, stage: &StageResult) {}

    /// A disabled stage was recorded as skipped.
    fn on_stage_skip(&self, run_id: &str, stage: &StageResult) {}

    /// A stage already succeeded in the checkpoint and was not re-executed.
    fn on_stage_restored(&self, run_id: &str, stage: &StageResult) {}

    /// A stage failed terminally.
    fn on_stage_error(&self, run_id: &str, stage: &StageResult, error: &StagerunError) {}

    /// The run reached its final status.
    fn on_run_finish(&self, run: &PipelineRun) {}
}

/// An ordered collection of hooks, invoked in registration order.
#[derive(Clone, Default)]
pub struct HookSet {
    hooks: Vec<Arc<dyn LifecycleHook>>,
}

impl HookSet {
    /// Creates an empty hook set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a hook.
    pub fn push(&mut self, hook: Arc<dyn LifecycleHook>) {
        self.hooks.push(hook);
    }

    /// Number of hooks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Returns true if there are no hooks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    fn each(&self, event: &str, f: impl Fn(&dyn LifecycleHook)) {
        for hook in &self.hooks {
            if let Err(e) = catch_unwind(AssertUnwindSafe(|| f(hook.as_ref()))) {
                tracing::warn!(event, "Lifecycle hook panicked: {:?}", e);
            }
        }
    }

    /// Notifies `on_run_start`.
    pub fn run_start(&self, run: &PipelineRun) {
        self.each("run_start", |h| h.on_run_start(run));
    }

    /// Notifies `on_stage_start`.
    pub fn stage_start(&self, run_id: &str, stage: &StageResult) {
        self.each("stage_start", |h| h.on_stage_start(run_id, stage));
    }

    /// Notifies `on_stage_complete`.
    pub fn stage_complete(&self, run_id: &str, stage: &StageResult) {
        self.each("stage_complete", |h| h.on_stage_complete(run_id, stage));
    }

    /// Notifies `on_stage_skip`.
    pub fn stage_skip(&self, run_id: &str, stage: &StageResult) {
        self.each("stage_skip", |h| h.on_stage_skip(run_id, stage));
    }

    /// Notifies `on_stage_restored`.
    pub fn stage_restored(&self, run_id: &str, stage: &StageResult) {
        self.each("stage_restored", |h| h.on_stage_restored(run_id, stage));
    }

    /// Notifies `on_stage_error`.
    pub fn stage_error(&self, run_id: &str, stage: &StageResult, error: &StagerunError) {
        self.each("stage_error", |h| h.on_stage_error(run_id, stage, error));
    }

    /// Notifies `on_run_finish`.
    pub fn run_finish(&self, run: &PipelineRun) {
        self.each("run_finish", |h| h.on_run_finish(run));
    }
}

impl std::fmt::Debug for HookSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookSet").field("hooks", &self.hooks.len()).finish()
    }
}
