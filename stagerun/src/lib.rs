//! # Stagerun
//!
//! A checkpointed, retrying pipeline orchestrator.
//!
//! Stagerun sequences named stages in a declared order and provides:
//!
//! - **Stage registry**: bind names to implementations, resolve declarative configuration
//! - **Resilience**: bounded exponential-backoff retry and per-stage circuit breakers
//! - **Checkpoints**: atomic, checksummed persistence so resumed runs skip finished work
//! - **External workers**: run heavy stage bodies as separate processes over a JSON protocol
//! - **Lifecycle hooks**: observe run and stage transitions
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stagerun::prelude::*;
//!
//! let mut registry = StageRegistry::new();
//! registry.register("ingest", IngestStage::new())?;
//! registry.register_with("export", ExportStage::new(), false)?;
//!
//! let config = PipelineConfig::from_path("pipeline.json")?;
//! let orchestrator = PipelineOrchestrator::from_config(
//!     &registry,
//!     &config,
//!     CheckpointManager::file("checkpoints"),
//!     Arc::new(CircuitBreakerRegistry::new()),
//! )?;
//!
//! let run = orchestrator.start(RunOptions::new()).await?;
//! ```

#![deny(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod checkpoint;
pub mod config;
pub mod core;
pub mod errors;
pub mod external;
pub mod hooks;
pub mod observability;
pub mod orchestrator;
pub mod resilience;
pub mod stages;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::checkpoint::{
        Checkpoint, CheckpointManager, CheckpointStore, FileCheckpointStore,
        InMemoryCheckpointStore,
    };
    pub use crate::config::{PipelineConfig, StageConfig};
    pub use crate::core::{
        AbortReason, PipelineRun, RunStatus, StageOutput, StageResult, StageStatus,
    };
    pub use crate::errors::{
        CheckpointCorruptionError, CircuitOpenError, ConfigurationError,
        ExternalProcessError, StageError, StageExecutionError, StagerunError,
    };
    pub use crate::external::{ExternalProcessExecutor, ExternalStage, ExternalTask};
    pub use crate::hooks::{LifecycleHook, LoggingHook, RecordingHook};
    pub use crate::orchestrator::{PipelineOrchestrator, RunOptions};
    pub use crate::resilience::{
        CircuitBreakerConfig, CircuitBreakerRegistry, JitterStrategy, RetryConfig,
        RetryPolicy,
    };
    pub use crate::stages::{Stage, StageContext, StageRegistry};
    pub use std::sync::Arc;
}
