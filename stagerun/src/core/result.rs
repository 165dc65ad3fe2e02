//! Per-stage result record.

use super::{StageOutput, StageStatus};
use crate::utils::{now_utc, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// The recorded outcome of one stage within a run.
///
/// This is both the in-memory state machine record and the per-stage entry
/// of the persisted checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    /// Stage name.
    pub name: String,
    /// Stage status.
    #[serde(default)]
    pub status: StageStatus,
    /// Number of attempts made by the last execution.
    #[serde(default)]
    pub attempt_count: u32,
    /// Error from the last failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Opaque reference to the stage's artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_ref: Option<String>,
    /// Small structured output handed to downstream stages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Why the stage was skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    /// When the last execution started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    /// When the stage was finalized.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Timestamp>,
    /// Last modification time.
    pub updated_at: Timestamp,
}

impl StageResult {
    /// Creates a pending result.
    #[must_use]
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StageStatus::Pending,
            attempt_count: 0,
            last_error: None,
            output_ref: None,
            output: None,
            skip_reason: None,
            started_at: None,
            finished_at: None,
            updated_at: now_utc(),
        }
    }

    /// Moves the stage to `Running`, clearing the previous execution's outcome.
    pub fn begin(&mut self) {
        let now = now_utc();
        self.status = StageStatus::Running;
        self.attempt_count = 0;
        self.last_error = None;
        self.skip_reason = None;
        self.started_at = Some(now);
        self.finished_at = None;
        self.updated_at = now;
    }

    /// Finalizes the stage as succeeded.
    pub fn succeed(&mut self, attempts: u32, output: &StageOutput) {
        self.status = StageStatus::Succeeded;
        self.attempt_count = attempts;
        self.last_error = None;
        self.output_ref.clone_from(&output.artifact_ref);
        self.output = (!output.data.is_null()).then(|| output.data.clone());
        self.finish();
    }

    /// Finalizes the stage as failed.
    pub fn fail(&mut self, attempts: u32, error: impl Display) {
        self.status = StageStatus::Failed;
        self.attempt_count = attempts;
        self.last_error = Some(error.to_string());
        self.finish();
    }

    /// Finalizes the stage as skipped.
    pub fn skip(&mut self, reason: impl Into<String>) {
        self.status = StageStatus::Skipped;
        self.skip_reason = Some(reason.into());
        self.finish();
    }

    fn finish(&mut self) {
        let now = now_utc();
        self.finished_at = Some(now);
        self.updated_at = now;
    }

    /// Reconstructs the output this stage produced.
    #[must_use]
    pub fn stage_output(&self) -> Option<StageOutput> {
        if self.status != StageStatus::Succeeded {
            return None;
        }
        Some(StageOutput {
            artifact_ref: self.output_ref.clone(),
            data: self.output.clone().unwrap_or(serde_json::Value::Null),
        })
    }

    /// Returns true if the stage succeeded.
    #[must_use]
    pub fn is_succeeded(&self) -> bool {
        self.status == StageStatus::Succeeded
    }

    /// Returns the duration of the last execution in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}
