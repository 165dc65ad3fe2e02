//! Stage output type.

use serde::{Deserialize, Serialize};

/// The output of a successful stage execution.
///
/// Heavy artifacts live outside the checkpoint and are referenced by an
/// opaque `artifact_ref`; `data` is a small structured payload handed to
/// downstream stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    /// Opaque reference to the produced artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_ref: Option<String>,

    /// Structured output data.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

impl StageOutput {
    /// Creates an output with neither artifact nor data.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Creates an output referencing an artifact.
    #[must_use]
    pub fn artifact(artifact_ref: impl Into<String>) -> Self {
        Self {
            artifact_ref: Some(artifact_ref.into()),
            data: serde_json::Value::Null,
        }
    }

    /// Creates an output carrying structured data.
    #[must_use]
    pub fn value(data: serde_json::Value) -> Self {
        Self {
            artifact_ref: None,
            data,
        }
    }

    /// Sets the artifact reference.
    #[must_use]
    pub fn with_artifact(mut self, artifact_ref: impl Into<String>) -> Self {
        self.artifact_ref = Some(artifact_ref.into());
        self
    }

    /// Sets the data payload.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Gets a top-level field of the data payload.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    /// Returns true if the output carries nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.artifact_ref.is_none() && self.data.is_null()
    }
}
