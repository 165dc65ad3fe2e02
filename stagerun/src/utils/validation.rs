//! Validation of run ids and stage names.

use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

const RUN_ID_PATTERN: &str = r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$";

fn run_id_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(RUN_ID_PATTERN).ok()).as_ref()
}

/// Error indicating an invalid identifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid name '{value}': {reason}")]
pub struct InvalidNameError {
    /// The rejected value.
    pub value: String,
    /// The reason the value is invalid.
    pub reason: String,
}

/// Validates a run id.
///
/// Run ids become checkpoint file names, so they are restricted to
/// `[A-Za-z0-9._-]`, must start with an alphanumeric character and are at
/// most 128 characters long.
pub fn validate_run_id(run_id: &str) -> Result<(), InvalidNameError> {
    if run_id_regex().is_some_and(|re| re.is_match(run_id)) {
        Ok(())
    } else {
        Err(InvalidNameError {
            value: run_id.to_string(),
            reason: "run ids must match [A-Za-z0-9][A-Za-z0-9._-]{0,127}".to_string(),
        })
    }
}

/// Validates a stage name is not empty or whitespace-only.
pub fn validate_stage_name(name: &str) -> Result<(), InvalidNameError> {
    if name.trim().is_empty() {
        return Err(InvalidNameError {
            value: name.to_string(),
            reason: "stage name cannot be empty or whitespace-only".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_run_id_ok() {
        assert!(validate_run_id("run-1").is_ok());
        assert!(validate_run_id("0192f1a2-7c3e-7b21-9c1d-2f6a3b4c5d6e").is_ok());
        assert!(validate_run_id("nightly.2024_05_01").is_ok());
    }

    #[test]
    fn test_validate_run_id_rejects_paths() {
        assert!(validate_run_id("").is_err());
        assert!(validate_run_id("../etc/passwd").is_err());
        assert!(validate_run_id("a/b").is_err());
        assert!(validate_run_id(".hidden").is_err());
        assert!(validate_run_id(&"x".repeat(129)).is_err());
        assert!(validate_run_id(&"x".repeat(128)).is_ok());
    }

    #[test]
    fn test_validate_stage_name() {
        assert!(validate_stage_name("ingest").is_ok());
        assert!(validate_stage_name("").is_err());
        assert!(validate_stage_name("   ").is_err());
    }

    #[test]
    fn test_invalid_name_display() {
        let err = validate_stage_name(" ").unwrap_err();
        assert!(err.to_string().contains("cannot be empty"));
    }
}
