//! Declarative pipeline configuration.
//!
//! A pipeline is configured as a JSON document listing its stages in
//! execution order, plus global retry and circuit-breaker defaults that each
//! stage may override:
//!
//! ```json
//! {
//!   "name": "video",
//!   "retry": {"max_attempts": 3, "initial_delay_ms": 1000},
//!   "stages": [
//!     {"name": "ingest"},
//!     {"name": "transform", "requires": ["ingest"], "retry": {"max_attempts": 5}},
//!     {"name": "export", "enabled": false}
//!   ]
//! }
//! ```
//!
//! Missing fields take their defaults and unknown fields are ignored.

use crate::errors::ConfigurationError;
use crate::resilience::{CircuitBreakerConfig, JitterStrategy, RetryConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Name used when a configuration does not name its pipeline.
pub const DEFAULT_PIPELINE_NAME: &str = "pipeline";

fn default_pipeline_name() -> String {
    DEFAULT_PIPELINE_NAME.to_string()
}

fn default_enabled() -> bool {
    true
}

/// Configuration for a whole pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name, recorded in every checkpoint.
    #[serde(default = "default_pipeline_name")]
    pub name: String,
    /// Global retry defaults.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Global circuit-breaker defaults.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Stages in execution order.
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: default_pipeline_name(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            stages: Vec::new(),
        }
    }
}

impl PipelineConfig {
    /// Creates an empty configuration.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Creates a configuration with one enabled stage per name.
    #[must_use]
    pub fn from_stage_names<I, S>(name: impl Into<String>, stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        stages
            .into_iter()
            .fold(Self::new(name), |config, stage| config.with_stage(StageConfig::new(stage)))
    }

    /// Parses a configuration from JSON text.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigurationError> {
        let config: Self = serde_json::from_str(json).map_err(|e| {
            ConfigurationError::new(format!("invalid pipeline configuration: {e}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration from a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConfigurationError::new(format!(
                "failed to read pipeline configuration {}: {e}",
                path.display()
            ))
        })?;
        tracing::debug!(path = %path.display(), "Loaded pipeline configuration");
        Self::from_json_str(&content)
    }

    /// Sets the global retry defaults.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the global circuit-breaker defaults.
    #[must_use]
    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }

    /// Appends a stage.
    #[must_use]
    pub fn with_stage(mut self, stage: StageConfig) -> Self {
        self.stages.push(stage);
        self
    }

    /// Looks up a stage by name.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageConfig> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Checks the configuration values that do not depend on registered stages.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.name.trim().is_empty() {
            return Err(ConfigurationError::new("pipeline name cannot be empty"));
        }
        self.retry.validate()?;
        self.circuit_breaker.validate()?;
        for stage in &self.stages {
            crate::utils::validate_stage_name(&stage.name)
                .map_err(|e| ConfigurationError::new(e.to_string()))?;
            stage
                .effective_retry(&self.retry)
                .validate()
                .map_err(|e| e.with_stage(&stage.name))?;
            stage
                .effective_circuit_breaker(&self.circuit_breaker)
                .validate()
                .map_err(|e| e.with_stage(&stage.name))?;
            if stage.timeout_ms == Some(0) {
                return Err(ConfigurationError::new("timeout_ms must be positive").with_stage(&stage.name));
            }
        }
        Ok(())
    }
}

/// Configuration for one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Registered stage name.
    pub name: String,
    /// Disabled stages are recorded as skipped.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Overrides the criticality given at registration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical: Option<bool>,
    /// Earlier stages whose output this stage needs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
    /// Label for the kind of artifact the stage produces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Free-form options handed to the stage.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub options: serde_json::Value,
    /// Per-stage retry overrides.
    #[serde(default)]
    pub retry: RetryOverrides,
    /// Per-stage circuit-breaker overrides.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerOverrides,
    /// Per-attempt timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl StageConfig {
    /// Creates an enabled stage entry with no overrides.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            critical: None,
            requires: Vec::new(),
            output: None,
            options: serde_json::Value::Null,
            retry: RetryOverrides::default(),
            circuit_breaker: CircuitBreakerOverrides::default(),
            timeout_ms: None,
        }
    }

    /// Sets the enabled flag.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Overrides criticality.
    #[must_use]
    pub fn with_critical(mut self, critical: bool) -> Self {
        self.critical = Some(critical);
        self
    }

    /// Adds a required upstream stage.
    #[must_use]
    pub fn with_requires(mut self, stage: impl Into<String>) -> Self {
        self.requires.push(stage.into());
        self
    }

    /// Sets the output kind label.
    #[must_use]
    pub fn with_output(mut self, kind: impl Into<String>) -> Self {
        self.output = Some(kind.into());
        self
    }

    /// Sets the stage options.
    #[must_use]
    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }

    /// Sets the retry overrides.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryOverrides) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the circuit-breaker overrides.
    #[must_use]
    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerOverrides) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Retry config after applying this stage's overrides to `base`.
    #[must_use]
    pub fn effective_retry(&self, base: &RetryConfig) -> RetryConfig {
        self.retry.apply(base)
    }

    /// Breaker config after applying this stage's overrides to `base`.
    #[must_use]
    pub fn effective_circuit_breaker(&self, base: &CircuitBreakerConfig) -> CircuitBreakerConfig {
        self.circuit_breaker.apply(base)
    }
}

/// Optional per-stage retry values layered over the global defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryOverrides {
    /// Maximum attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// Initial delay in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_delay_ms: Option<u64>,
    /// Maximum delay in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
    /// Exponential base.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exponential_base: Option<f64>,
    /// Jitter strategy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<JitterStrategy>,
}

impl RetryOverrides {
    /// Overrides only the attempt limit.
    #[must_use]
    pub fn max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: Some(attempts),
            ..Self::default()
        }
    }

    /// Applies the overrides to `base`.
    #[must_use]
    pub fn apply(&self, base: &RetryConfig) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.unwrap_or(base.max_attempts),
            initial_delay_ms: self.initial_delay_ms.unwrap_or(base.initial_delay_ms),
            max_delay_ms: self.max_delay_ms.unwrap_or(base.max_delay_ms),
            exponential_base: self.exponential_base.unwrap_or(base.exponential_base),
            jitter: self.jitter.unwrap_or(base.jitter),
        }
    }
}

/// Optional per-stage circuit-breaker values layered over the global defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerOverrides {
    /// Consecutive failures before opening.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,
    /// Recovery timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_timeout_ms: Option<u64>,
}

impl CircuitBreakerOverrides {
    /// Applies the overrides to `base`.
    #[must_use]
    pub fn apply(&self, base: &CircuitBreakerConfig) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold.unwrap_or(base.failure_threshold),
            recovery_timeout_ms: self.recovery_timeout_ms.unwrap_or(base.recovery_timeout_ms),
        }
    }
}
