//! Per-invocation stage context and upstream inputs.

use crate::cancellation::CancellationToken;
use crate::core::StageOutput;
use crate::errors::StageError;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Provides an immutable view of prior stage outputs.
///
/// Every succeeded upstream stage is visible; `require` additionally fails
/// with [`StageError::MissingInput`] when a needed output is absent.
#[derive(Debug, Clone, Default)]
pub struct StageInputs {
    /// The available outputs from prior stages.
    outputs: BTreeMap<String, StageOutput>,
    /// The declared dependencies for this stage.
    declared_dependencies: HashSet<String>,
}

impl StageInputs {
    /// Creates new stage inputs.
    #[must_use]
    pub fn new(
        outputs: BTreeMap<String, StageOutput>,
        declared_dependencies: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            outputs,
            declared_dependencies: declared_dependencies.into_iter().collect(),
        }
    }

    /// Gets output from a specific stage.
    #[must_use]
    pub fn get(&self, stage: &str) -> Option<&StageOutput> {
        self.outputs.get(stage)
    }

    /// Gets output from a stage, failing if it is not available.
    pub fn require(&self, stage: &str) -> Result<&StageOutput, StageError> {
        self.outputs
            .get(stage)
            .ok_or_else(|| StageError::missing_input(stage))
    }

    /// Checks if output exists for a stage.
    #[must_use]
    pub fn contains(&self, stage: &str) -> bool {
        self.outputs.contains_key(stage)
    }

    /// Returns all available stage names.
    #[must_use]
    pub fn stages(&self) -> Vec<&str> {
        self.outputs.keys().map(String::as_str).collect()
    }

    /// Returns true if `stage` was declared in `requires`.
    #[must_use]
    pub fn is_declared(&self, stage: &str) -> bool {
        self.declared_dependencies.contains(stage)
    }

    /// Converts all outputs to a JSON object keyed by stage name.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.outputs).unwrap_or(serde_json::Value::Null)
    }
}

/// Execution context handed to a stage body for one attempt.
#[derive(Debug, Clone)]
pub struct StageContext {
    /// The run id.
    pub run_id: String,
    /// The stage name.
    pub stage: String,
    /// The 1-based attempt number.
    pub attempt: u32,
    /// Stage options from the configuration.
    pub options: serde_json::Value,
    /// Outputs of earlier stages.
    pub inputs: StageInputs,
    /// Cooperative cancellation signal.
    pub cancellation: Arc<CancellationToken>,
}

impl StageContext {
    /// Creates a new stage context.
    #[must_use]
    pub fn new(
        run_id: impl Into<String>,
        stage: impl Into<String>,
        inputs: StageInputs,
        cancellation: Arc<CancellationToken>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            stage: stage.into(),
            attempt: 1,
            options: serde_json::Value::Null,
            inputs,
            cancellation,
        }
    }

    /// Creates a context with no inputs and run id `test-run`.
    #[must_use]
    pub fn for_test(stage: impl Into<String>) -> Self {
        Self::new(
            "test-run",
            stage,
            StageInputs::default(),
            Arc::new(CancellationToken::new()),
        )
    }

    /// Sets the options.
    #[must_use]
    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }

    /// Sets the attempt number.
    #[must_use]
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Gets the output of an upstream stage.
    #[must_use]
    pub fn input(&self, stage: &str) -> Option<&StageOutput> {
        self.inputs.get(stage)
    }

    /// Gets the output of an upstream stage, failing if absent.
    pub fn require_input(&self, stage: &str) -> Result<&StageOutput, StageError> {
        self.inputs.require(stage)
    }

    /// Returns true if cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}
