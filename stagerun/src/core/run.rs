//! Pipeline run view.

use super::{AbortReason, RunStatus, StageResult, StageStatus};
use crate::utils::Timestamp;
use serde::{Deserialize, Serialize};

/// A snapshot of one run: its status and the ordered stage results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Run id.
    pub run_id: String,
    /// Pipeline name.
    pub pipeline: String,
    /// When the run was first started.
    pub started_at: Timestamp,
    /// When the run last finished.
    pub finished_at: Option<Timestamp>,
    /// Overall status.
    pub status: RunStatus,
    /// Why the run was aborted, if it was.
    pub abort_reason: Option<AbortReason>,
    /// Stage results in declared order.
    pub stages: Vec<StageResult>,
}

impl PipelineRun {
    /// Looks up a stage result by name.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Returns the status of a stage, or `None` if unknown.
    #[must_use]
    pub fn stage_status(&self, name: &str) -> Option<StageStatus> {
        self.stage(name).map(|s| s.status)
    }

    /// Returns true if the run completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Process exit code for this run.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }

    /// Names of stages that ended in the given status.
    #[must_use]
    pub fn stages_with_status(&self, status: StageStatus) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| s.status == status)
            .map(|s| s.name.as_str())
            .collect()
    }

    /// One line per stage, suitable for an inspect-status listing.
    #[must_use]
    pub fn summary_lines(&self) -> Vec<String> {
        self.stages
            .iter()
            .map(|s| {
                let mut line = format!("{:<24} {:<10} attempts={}", s.name, s.status, s.attempt_count);
                if let Some(ref err) = s.last_error {
                    line.push_str(&format!(" error={err}"));
                }
                if let Some(ref output_ref) = s.output_ref {
                    line.push_str(&format!(" output={output_ref}"));
                }
                line
            })
            .collect()
    }
}
