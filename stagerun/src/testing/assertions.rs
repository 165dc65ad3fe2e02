//! Assertions over finished runs.

use crate::core::{PipelineRun, StageStatus};

/// Asserts that `stage` ended in `expected`.
///
/// # Panics
///
/// Panics if the stage is unknown or has a different status.
#[track_caller]
pub fn assert_stage_status(run: &PipelineRun, stage: &str, expected: StageStatus) {
    let Some(result) = run.stage(stage) else {
        panic!("stage '{stage}' not found in run {}", run.run_id);
    };
    assert_eq!(
        result.status, expected,
        "stage '{stage}' status: expected {expected}, got {}",
        result.status
    );
}

/// Asserts the attempt count of each named stage, in order.
///
/// # Panics
///
/// Panics on the first stage whose attempt count differs.
#[track_caller]
pub fn assert_attempts(run: &PipelineRun, expected: &[(&str, u32)]) {
    for (stage, attempts) in expected {
        let Some(result) = run.stage(stage) else {
            panic!("stage '{stage}' not found in run {}", run.run_id);
        };
        assert_eq!(
            result.attempt_count, *attempts,
            "stage '{stage}' attempts: expected {attempts}, got {}",
            result.attempt_count
        );
    }
}

/// Asserts that `stage` recorded an error containing `needle`.
///
/// # Panics
///
/// Panics if the stage has no error or the error does not match.
#[track_caller]
pub fn assert_stage_error_contains(run: &PipelineRun, stage: &str, needle: &str) {
    let error = run
        .stage(stage)
        .and_then(|s| s.last_error.as_deref())
        .unwrap_or_else(|| panic!("stage '{stage}' recorded no error"));
    assert!(
        error.contains(needle),
        "stage '{stage}' error '{error}' does not contain '{needle}'"
    );
}
