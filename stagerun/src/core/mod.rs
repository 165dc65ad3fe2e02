//! Core domain model types for stagerun.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Stage and run status enums
//! - Stage output and per-stage result records
//! - The pipeline run view

mod output;
mod result;
mod run;
mod status;

pub use output::StageOutput;
pub use result::StageResult;
pub use run::PipelineRun;
pub use status::{AbortReason, RunStatus, StageStatus};
