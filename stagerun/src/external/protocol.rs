//! Request/response envelopes exchanged with worker processes.
//!
//! The executor writes one request document to the worker's stdin and
//! closes it. A successful worker prints exactly one response document to
//! stdout and exits with status 0.

use crate::errors::ExternalProcessError;
use crate::utils::generate_correlation_id;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Protocol tag carried by every envelope.
pub const PROTOCOL: &str = "stagerun.task/1";

/// Request sent to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalTaskRequest {
    /// Protocol tag.
    pub protocol: String,
    /// Unique id echoed back by the worker.
    pub correlation_id: String,
    /// Task name.
    pub task: String,
    /// Version of the task's argument/result contract.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_version: Option<u32>,
    /// Task arguments.
    pub arguments: serde_json::Value,
}

impl ExternalTaskRequest {
    /// Creates a request with a fresh correlation id.
    #[must_use]
    pub fn new(task: impl Into<String>, task_version: Option<u32>, arguments: serde_json::Value) -> Self {
        Self {
            protocol: PROTOCOL.to_string(),
            correlation_id: generate_correlation_id(),
            task: task.into(),
            task_version,
            arguments,
        }
    }

    /// Checks a worker's stdout against this request and returns the result.
    ///
    /// The output must be exactly one JSON document with the same protocol
    /// tag, correlation id and task name, and an object `result`.
    pub fn validate_response(&self, stdout: &[u8]) -> Result<serde_json::Value, ExternalProcessError> {
        let malformed = |reason: String| ExternalProcessError::MalformedOutput {
            task: self.task.clone(),
            reason,
            stdout: crate::errors::truncate_diagnostics(stdout),
        };

        let mut documents = serde_json::Deserializer::from_slice(stdout).into_iter::<serde_json::Value>();
        let document = match documents.next() {
            None => return Err(malformed("worker produced no output".to_string())),
            Some(Err(e)) => return Err(malformed(format!("output is not JSON: {e}"))),
            Some(Ok(document)) => document,
        };
        if documents.next().is_some() {
            return Err(malformed("worker produced more than one document".to_string()));
        }

        let response: ExternalTaskResponse = serde_json::from_value(document)
            .map_err(|e| malformed(format!("invalid response envelope: {e}")))?;
        if response.protocol != PROTOCOL {
            return Err(malformed(format!("unexpected protocol '{}'", response.protocol)));
        }
        if response.correlation_id != self.correlation_id {
            return Err(malformed(format!(
                "correlation id mismatch: expected {}, got {}",
                self.correlation_id, response.correlation_id
            )));
        }
        if response.task != self.task {
            return Err(malformed(format!("response is for task '{}'", response.task)));
        }
        if !response.result.is_object() {
            return Err(malformed("result must be a JSON object".to_string()));
        }
        Ok(response.result)
    }
}

/// Response printed by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalTaskResponse {
    /// Protocol tag.
    pub protocol: String,
    /// Correlation id from the request.
    pub correlation_id: String,
    /// Task name from the request.
    pub task: String,
    /// Task result.
    pub result: serde_json::Value,
}

/// A typed worker task contract.
///
/// The implementing value is serialized as the request `arguments`; the
/// response `result` is deserialized into [`ExternalTask::Output`].
pub trait ExternalTask: Serialize + Send + Sync {
    /// Task name sent to the worker.
    const NAME: &'static str;
    /// Contract version.
    const VERSION: u32;
    /// Result type.
    type Output: DeserializeOwned;
}
