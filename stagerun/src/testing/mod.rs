//! Testing utilities for stagerun pipelines.
//!
//! This module provides:
//! - Mock stages with call counting and scripted failures
//! - Assertions over a finished [`PipelineRun`](crate::core::PipelineRun)

mod assertions;
mod mocks;

pub use assertions::{assert_attempts, assert_stage_error_contains, assert_stage_status};
pub use mocks::{FailingStage, MockStage, ScriptedStage, SlowStage};
