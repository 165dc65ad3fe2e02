//! Error types for the stagerun orchestrator.
//!
//! The taxonomy separates errors that abort before any stage runs
//! (configuration), errors raised by stage bodies (subject to retry and
//! circuit breaking), and errors about persisted run state.

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Maximum number of bytes of worker diagnostics kept on an error.
pub const MAX_DIAGNOSTIC_BYTES: usize = 4096;

/// The main error type for stagerun operations.
#[derive(Debug, Error)]
pub enum StagerunError {
    /// The stage graph or its options are invalid.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// A stage body failed terminally.
    #[error("{0}")]
    StageExecution(#[from] StageExecutionError),

    /// The stage's circuit breaker rejected the call.
    #[error("{0}")]
    CircuitOpen(#[from] CircuitOpenError),

    /// The persisted checkpoint could not be read.
    #[error("{0}")]
    CheckpointCorruption(#[from] CheckpointCorruptionError),

    /// No checkpoint exists for the requested run.
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// Another writer currently owns the run's checkpoint.
    #[error("Run '{0}' already has an active writer")]
    RunActive(String),

    /// Cancellation was requested.
    #[error("Run cancelled: {0}")]
    Cancelled(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StagerunError {
    /// Process exit code for a run that ended with this error.
    ///
    /// Configuration errors mean no stage was ever attempted and get their
    /// own code, as does a corrupted checkpoint that needs operator action.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 3,
            Self::CheckpointCorruption(_) => 4,
            _ => 1,
        }
    }

    /// Returns true if this error must never be retried.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::CheckpointCorruption(_) | Self::Cancelled(_)
        )
    }
}

/// Error raised when the pipeline configuration or stage graph is invalid.
#[derive(Debug, Clone, Error)]
#[error("Configuration error: {message}")]
pub struct ConfigurationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
}

impl ConfigurationError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
        }
    }

    /// Adds a stage involved in the error.
    #[must_use]
    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stages.push(stage.into());
        self
    }
}

/// A stage failed after the retry policy gave up.
#[derive(Debug, Error)]
#[error("Stage '{stage}' failed after {attempts} attempt(s): {source}")]
pub struct StageExecutionError {
    /// The stage name.
    pub stage: String,
    /// Number of attempts made.
    pub attempts: u32,
    /// The last error raised by the stage body.
    #[source]
    pub source: StageError,
}

impl StageExecutionError {
    /// Creates a new stage execution error.
    #[must_use]
    pub fn new(stage: impl Into<String>, attempts: u32, source: StageError) -> Self {
        Self {
            stage: stage.into(),
            attempts,
            source,
        }
    }
}

/// The circuit breaker for a stage is open; the body was not invoked.
#[derive(Debug, Clone, Error)]
#[error(
    "Circuit open for stage '{stage}' after {consecutive_failures} consecutive failure(s); \
     retry in {retry_in:?}"
)]
pub struct CircuitOpenError {
    /// The stage name.
    pub stage: String,
    /// Consecutive failures recorded by the breaker.
    pub consecutive_failures: u32,
    /// When the most recent failure happened.
    pub last_failure: Option<DateTime<Utc>>,
    /// Remaining cooldown before a probe is allowed.
    pub retry_in: Duration,
}

/// The persisted checkpoint for a run cannot be trusted.
#[derive(Debug, Clone, Error)]
#[error("Checkpoint for run '{run_id}' at {location} is corrupt: {reason}")]
pub struct CheckpointCorruptionError {
    /// The run id.
    pub run_id: String,
    /// Where the record lives (a path for file stores).
    pub location: String,
    /// What is wrong with it.
    pub reason: String,
}

impl CheckpointCorruptionError {
    /// Creates a new corruption error.
    #[must_use]
    pub fn new(
        run_id: impl Into<String>,
        location: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            location: location.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised by a stage body.
#[derive(Debug, Error)]
pub enum StageError {
    /// A failure expected to go away on its own.
    #[error("{0}")]
    Transient(String),

    /// A failure that retrying cannot fix.
    #[error("{0}")]
    Permanent(String),

    /// The stage was throttled and told when to come back.
    #[error("Rate limited: {message} (retry after {retry_after:?})")]
    RateLimited {
        /// The error message.
        message: String,
        /// Delay requested by the throttling party.
        retry_after: Duration,
    },

    /// A single attempt exceeded the stage timeout.
    #[error("Attempt timed out after {0:?}")]
    Timeout(Duration),

    /// An upstream output the stage requires is absent.
    #[error("Missing required input from stage '{input}'")]
    MissingInput {
        /// The upstream stage name.
        input: String,
    },

    /// A delegated worker process failed.
    #[error(transparent)]
    External(#[from] ExternalProcessError),

    /// Any other failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StageError {
    /// Creates a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Creates a permanent error.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    /// Creates a rate-limit error.
    #[must_use]
    pub fn rate_limited(message: impl Into<String>, retry_after: Duration) -> Self {
        Self::RateLimited {
            message: message.into(),
            retry_after,
        }
    }

    /// Creates a missing-input error.
    #[must_use]
    pub fn missing_input(input: impl Into<String>) -> Self {
        Self::MissingInput {
            input: input.into(),
        }
    }

    /// Default retry classification.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient(_) | Self::RateLimited { .. } | Self::Timeout(_) | Self::Other(_) => {
                true
            }
            Self::Permanent(_) | Self::MissingInput { .. } => false,
            Self::External(e) => e.is_retryable(),
        }
    }

    /// Explicit delay requested by the error, overriding computed backoff.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Returns true if the error reports a cancellation rather than a fault.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::External(ExternalProcessError::Cancelled { .. }))
    }

    /// Short kind label for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Permanent(_) => "permanent",
            Self::RateLimited { .. } => "rate_limited",
            Self::Timeout(_) => "timeout",
            Self::MissingInput { .. } => "missing_input",
            Self::External(_) => "external",
            Self::Other(_) => "other",
        }
    }
}

/// Errors from invoking an out-of-process worker.
#[derive(Debug, Error)]
pub enum ExternalProcessError {
    /// The worker executable does not exist.
    #[error("Worker program not found: {program}")]
    NotFound {
        /// The program path or name.
        program: String,
    },

    /// The worker could not be started.
    #[error("Failed to spawn worker {program}: {source}")]
    Spawn {
        /// The program path or name.
        program: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The worker exited unsuccessfully.
    #[error("Worker task '{task}' exited unsuccessfully (code {code:?}): {stderr}")]
    NonZeroExit {
        /// The task name.
        task: String,
        /// Exit code, `None` if killed by a signal.
        code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },

    /// The worker did not finish in time and was terminated.
    #[error("Worker task '{task}' timed out after {after:?}")]
    Timeout {
        /// The task name.
        task: String,
        /// The timeout that elapsed.
        after: Duration,
        /// Captured standard error.
        stderr: String,
    },

    /// The worker's result document failed validation.
    #[error("Worker task '{task}' produced malformed output: {reason}")]
    MalformedOutput {
        /// The task name.
        task: String,
        /// What failed validation.
        reason: String,
        /// Captured standard output.
        stdout: String,
    },

    /// The worker was terminated because the run was cancelled.
    #[error("Worker task '{task}' cancelled")]
    Cancelled {
        /// The task name.
        task: String,
    },

    /// Talking to the worker failed.
    #[error("Worker I/O error for task '{task}': {source}")]
    Io {
        /// The task name.
        task: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl ExternalProcessError {
    /// Malformed output points at a bug rather than transience, and a
    /// missing program will not appear on its own.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::MalformedOutput { .. } | Self::NotFound { .. } | Self::Cancelled { .. }
        )
    }

    /// Captured diagnostic text, if any.
    #[must_use]
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Self::NonZeroExit { stderr, .. } | Self::Timeout { stderr, .. } => Some(stderr),
            Self::MalformedOutput { stdout, .. } => Some(stdout),
            _ => None,
        }
    }
}

/// Keeps the tail of captured worker output within [`MAX_DIAGNOSTIC_BYTES`].
#[must_use]
pub fn truncate_diagnostics(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim_end();
    if trimmed.len() <= MAX_DIAGNOSTIC_BYTES {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - MAX_DIAGNOSTIC_BYTES;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &trimmed[start..])
}
