//! The checkpoint record and its on-disk envelope.

use crate::core::{AbortReason, PipelineRun, RunStatus, StageOutput, StageResult, StageStatus};
use crate::errors::CheckpointCorruptionError;
use crate::utils::{now_utc, Timestamp};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Format tag written into every checkpoint envelope.
pub const CHECKPOINT_FORMAT: &str = "stagerun.checkpoint";

/// Current checkpoint schema version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Durable record of a run's progress.
///
/// Once a stage is recorded as succeeded it stays succeeded: later results
/// for that stage are ignored unless they are successes too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Run id.
    pub run_id: String,
    /// Pipeline name.
    pub pipeline: String,
    /// Overall run status.
    #[serde(default)]
    pub status: RunStatus,
    /// Why the run was aborted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<AbortReason>,
    /// When the run was first started.
    pub started_at: Timestamp,
    /// When the run last finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Timestamp>,
    /// Last modification time.
    pub updated_at: Timestamp,
    /// Declared stage order.
    #[serde(default)]
    pub stage_order: Vec<String>,
    /// Per-stage results.
    #[serde(default)]
    pub stages: BTreeMap<String, StageResult>,
}

impl Checkpoint {
    /// Creates an empty checkpoint.
    #[must_use]
    pub fn new(run_id: impl Into<String>, pipeline: impl Into<String>) -> Self {
        let now = now_utc();
        Self {
            run_id: run_id.into(),
            pipeline: pipeline.into(),
            status: RunStatus::Initialized,
            abort_reason: None,
            started_at: now,
            finished_at: None,
            updated_at: now,
            stage_order: Vec::new(),
            stages: BTreeMap::new(),
        }
    }

    /// Makes `names` the leading stage order, adding pending results for
    /// stages seen for the first time.
    ///
    /// Stages recorded earlier but no longer configured keep their results
    /// and stay at the end of the order.
    pub fn ensure_stages<S: AsRef<str>>(&mut self, names: &[S]) {
        let mut order: Vec<String> = names.iter().map(|n| n.as_ref().to_string()).collect();
        for existing in &self.stage_order {
            if !order.contains(existing) {
                order.push(existing.clone());
            }
        }
        for name in &order {
            self.stages
                .entry(name.clone())
                .or_insert_with(|| StageResult::pending(name.clone()));
        }
        self.stage_order = order;
    }

    /// Looks up a stage result.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.get(name)
    }

    /// Returns true if the stage already produced valid output.
    #[must_use]
    pub fn is_stage_succeeded(&self, name: &str) -> bool {
        self.stages.get(name).is_some_and(StageResult::is_succeeded)
    }

    /// Outputs of all succeeded stages, keyed by name.
    #[must_use]
    pub fn succeeded_outputs(&self) -> BTreeMap<String, StageOutput> {
        self.stages
            .iter()
            .filter_map(|(name, result)| result.stage_output().map(|o| (name.clone(), o)))
            .collect()
    }

    /// Records a stage result. Returns false if it was refused because the
    /// stage had already succeeded.
    pub fn record(&mut self, result: StageResult) -> bool {
        if self.is_stage_succeeded(&result.name) && result.status != StageStatus::Succeeded {
            tracing::warn!(
                run_id = %self.run_id,
                stage = %result.name,
                status = %result.status,
                "Refusing to overwrite a succeeded stage"
            );
            return false;
        }
        if !self.stage_order.contains(&result.name) {
            self.stage_order.push(result.name.clone());
        }
        self.stages.insert(result.name.clone(), result);
        self.touch();
        true
    }

    /// Marks a stage as succeeded with the given output reference.
    pub fn mark_stage_complete(&mut self, stage: &str, output_ref: Option<String>) {
        let mut result = self
            .stages
            .get(stage)
            .cloned()
            .unwrap_or_else(|| StageResult::pending(stage));
        let attempts = result.attempt_count.max(1);
        let output = StageOutput {
            artifact_ref: output_ref,
            data: result.output.clone().unwrap_or(serde_json::Value::Null),
        };
        result.succeed(attempts, &output);
        self.record(result);
    }

    /// Moves the run to `Running`.
    pub fn begin_run(&mut self) {
        self.status = RunStatus::Running;
        self.abort_reason = None;
        self.finished_at = None;
        self.touch();
    }

    /// Sets the final run status.
    pub fn finish(&mut self, status: RunStatus, abort_reason: Option<AbortReason>) {
        self.status = status;
        self.abort_reason = abort_reason;
        self.finished_at = Some(now_utc());
        self.touch();
    }

    /// Builds the run view, stages in declared order.
    #[must_use]
    pub fn to_run(&self) -> PipelineRun {
        let stages = self
            .stage_order
            .iter()
            .filter_map(|name| self.stages.get(name).cloned())
            .collect();
        PipelineRun {
            run_id: self.run_id.clone(),
            pipeline: self.pipeline.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
            status: self.status,
            abort_reason: self.abort_reason.clone(),
            stages,
        }
    }

    fn touch(&mut self) {
        self.updated_at = now_utc();
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    format: String,
    version: u32,
    checksum: String,
    checkpoint: serde_json::Value,
}

fn checksum(value: &serde_json::Value) -> Result<String, serde_json::Error> {
    let canonical = serde_json::to_vec(value)?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

/// Serializes a checkpoint into its checksummed envelope.
pub fn encode(checkpoint: &Checkpoint) -> Result<Vec<u8>, serde_json::Error> {
    let value = serde_json::to_value(checkpoint)?;
    let envelope = Envelope {
        format: CHECKPOINT_FORMAT.to_string(),
        version: CHECKPOINT_VERSION,
        checksum: checksum(&value)?,
        checkpoint: value,
    };
    serde_json::to_vec_pretty(&envelope)
}

/// Parses and verifies a checkpoint envelope.
pub fn decode(
    run_id: &str,
    location: &str,
    bytes: &[u8],
) -> Result<Checkpoint, CheckpointCorruptionError> {
    let corrupt = |reason: String| CheckpointCorruptionError::new(run_id, location, reason);

    let envelope: Envelope =
        serde_json::from_slice(bytes).map_err(|e| corrupt(format!("unreadable envelope: {e}")))?;
    if envelope.format != CHECKPOINT_FORMAT {
        return Err(corrupt(format!("unexpected format tag '{}'", envelope.format)));
    }
    if envelope.version > CHECKPOINT_VERSION {
        return Err(corrupt(format!(
            "unsupported checkpoint version {} (newest known is {CHECKPOINT_VERSION})",
            envelope.version
        )));
    }
    let actual = checksum(&envelope.checkpoint).map_err(|e| corrupt(e.to_string()))?;
    if actual != envelope.checksum {
        return Err(corrupt("checksum mismatch".to_string()));
    }
    let checkpoint: Checkpoint = serde_json::from_value(envelope.checkpoint)
        .map_err(|e| corrupt(format!("invalid checkpoint body: {e}")))?;
    if checkpoint.run_id != run_id {
        return Err(corrupt(format!(
            "record belongs to run '{}'",
            checkpoint.run_id
        )));
    }
    Ok(checkpoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn checkpoint() -> Checkpoint {
        let mut cp = Checkpoint::new("run-1", "video");
        cp.ensure_stages(&["ingest", "transform", "export"]);
        cp
    }

    #[test]
    fn test_ensure_stages_keeps_existing_results() {
        let mut cp = checkpoint();
        cp.mark_stage_complete("ingest", Some("raw/1".into()));
        cp.ensure_stages(&["ingest", "render"]);

        assert_eq!(cp.stage_order, vec!["ingest", "render", "transform", "export"]);
        assert!(cp.is_stage_succeeded("ingest"));
        assert_eq!(cp.stage("render").unwrap().status, StageStatus::Pending);
    }

    #[test]
    fn test_succeeded_stage_never_unmarked() {
        let mut cp = checkpoint();
        cp.mark_stage_complete("ingest", Some("raw/1".into()));

        let mut failed = StageResult::pending("ingest");
        failed.fail(3, "disk full");
        assert!(!cp.record(failed));

        let ingest = cp.stage("ingest").unwrap();
        assert!(ingest.is_succeeded());
        assert_eq!(ingest.output_ref.as_deref(), Some("raw/1"));
    }

    #[test]
    fn test_to_run_follows_declared_order() {
        let mut cp = checkpoint();
        cp.begin_run();
        cp.finish(RunStatus::Aborted, Some(AbortReason::CriticalStageFailed { stage: "transform".into() }));

        let run = cp.to_run();
        let names: Vec<_> = run.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["ingest", "transform", "export"]);
        assert_eq!(run.status, RunStatus::Aborted);
        assert!(run.finished_at.is_some());
    }

    #[test]
    fn test_succeeded_outputs() {
        let mut cp = checkpoint();
        let mut result = StageResult::pending("ingest");
        result.succeed(1, &StageOutput::value(json!({"rows": 10})));
        cp.record(result);

        let outputs = cp.succeeded_outputs();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs["ingest"].get("rows"), Some(&json!(10)));
    }

    #[test]
    fn test_encode_decode() {
        let mut cp = checkpoint();
        cp.mark_stage_complete("ingest", Some("raw/1".into()));
        let bytes = encode(&cp).unwrap();

        let envelope: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(envelope["format"], json!(CHECKPOINT_FORMAT));
        assert_eq!(envelope["version"], json!(CHECKPOINT_VERSION));
        assert_eq!(envelope["checksum"].as_str().unwrap().len(), 64);

        let decoded = decode("run-1", "memory", &bytes).unwrap();
        assert_eq!(decoded, cp);
    }

    #[test]
    fn test_decode_detects_tampering() {
        let bytes = encode(&checkpoint()).unwrap();
        let mut envelope: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        envelope["checkpoint"]["pipeline"] = json!("other");
        let tampered = serde_json::to_vec(&envelope).unwrap();

        let err = decode("run-1", "memory", &tampered).unwrap_err();
        assert_eq!(err.reason, "checksum mismatch");
    }

    #[test]
    fn test_decode_rejects_garbage_and_wrong_run() {
        assert!(decode("run-1", "memory", b"{\"format\": \"stagerun.chec").is_err());

        let bytes = encode(&checkpoint()).unwrap();
        let err = decode("run-2", "memory", &bytes).unwrap_err();
        assert!(err.reason.contains("run-1"));
    }

    #[test]
    fn test_decode_rejects_wrong_format_tag() {
        let bytes = encode(&checkpoint()).unwrap();
        let mut envelope: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        envelope["format"] = json!("something.else");
        let err = decode("run-1", "memory", &serde_json::to_vec(&envelope).unwrap()).unwrap_err();
        assert!(err.reason.contains("format tag"));
    }

    #[test]
    fn test_decode_ignores_unknown_fields() {
        let cp = checkpoint();
        let mut body = serde_json::to_value(&cp).unwrap();
        body["written_by"] = json!("a newer build");
        let envelope = json!({
            "format": CHECKPOINT_FORMAT,
            "version": CHECKPOINT_VERSION,
            "checksum": checksum(&body).unwrap(),
            "checkpoint": body,
            "extra": true
        });
        let decoded = decode("run-1", "memory", &serde_json::to_vec(&envelope).unwrap()).unwrap();
        assert_eq!(decoded.stage_order, cp.stage_order);
    }
}
