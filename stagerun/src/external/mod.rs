//! Out-of-process workers.
//!
//! Heavy stage bodies (model inference, media processing) run in separate
//! executables. [`ExternalProcessExecutor`] spawns one process per task,
//! speaks the JSON protocol in [`protocol`] over stdin/stdout, and enforces
//! a timeout with graceful termination. [`ExternalStage`] adapts a worker
//! task to the [`Stage`](crate::stages::Stage) trait.

mod executor;
pub mod protocol;
mod signal;
mod stage;

pub use executor::{ExternalProcessExecutor, CORRELATION_ENV, DEFAULT_GRACE_PERIOD, TASK_ENV};
pub use protocol::{ExternalTask, ExternalTaskRequest, ExternalTaskResponse, PROTOCOL};
pub use stage::{ExternalStage, DEFAULT_TASK_TIMEOUT};
