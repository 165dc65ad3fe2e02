//! Stage registry: binds names to implementations and resolves a
//! configuration into an ordered list of stage definitions.

use super::Stage;
use crate::config::PipelineConfig;
use crate::errors::{ConfigurationError, StageError};
use crate::resilience::{CircuitBreakerConfig, RetryConfig, RetryPolicy, RetryPredicate};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A stage resolved from configuration and ready to execute.
#[derive(Clone)]
pub struct StageDefinition {
    /// Unique stage name.
    pub name: String,
    /// Position in execution order.
    pub position: usize,
    /// A terminal failure of a critical stage aborts the run.
    pub critical: bool,
    /// Disabled stages are recorded as skipped.
    pub enabled: bool,
    /// Earlier stages whose output must be present.
    pub requires: Vec<String>,
    /// Kind of artifact the stage produces.
    pub output_kind: Option<String>,
    /// Stage options from the configuration.
    pub options: serde_json::Value,
    /// Effective retry configuration.
    pub retry: RetryConfig,
    /// Effective circuit-breaker configuration.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Per-attempt timeout.
    pub timeout: Option<Duration>,
    /// The implementation.
    pub runner: Arc<dyn Stage>,
    retry_predicate: Option<RetryPredicate>,
}

impl StageDefinition {
    /// Creates an enabled, critical definition with default policies.
    pub fn new(name: impl Into<String>, runner: Arc<dyn Stage>) -> Self {
        Self {
            name: name.into(),
            position: 0,
            critical: true,
            enabled: true,
            requires: Vec::new(),
            output_kind: None,
            options: serde_json::Value::Null,
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            timeout: None,
            runner,
            retry_predicate: None,
        }
    }

    /// Builds the retry policy for this stage.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry.clone()).with_shared_predicate(self.retry_predicate.clone())
    }
}

impl fmt::Debug for StageDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageDefinition")
            .field("name", &self.name)
            .field("position", &self.position)
            .field("critical", &self.critical)
            .field("enabled", &self.enabled)
            .field("requires", &self.requires)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("runner", &self.runner)
            .finish_non_exhaustive()
    }
}

struct Registration {
    stage: Arc<dyn Stage>,
    critical: bool,
    retry_predicate: Option<RetryPredicate>,
}

/// Registry of stage implementations keyed by name.
#[derive(Default)]
pub struct StageRegistry {
    entries: HashMap<String, Registration>,
}

impl StageRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a critical stage.
    pub fn register<S>(&mut self, name: impl Into<String>, stage: S) -> Result<(), ConfigurationError>
    where
        S: Stage + 'static,
    {
        self.register_arc(name, Arc::new(stage), true)
    }

    /// Registers a stage with explicit criticality.
    pub fn register_with<S>(
        &mut self,
        name: impl Into<String>,
        stage: S,
        critical: bool,
    ) -> Result<(), ConfigurationError>
    where
        S: Stage + 'static,
    {
        self.register_arc(name, Arc::new(stage), critical)
    }

    /// Registers a shared stage implementation.
    pub fn register_arc(
        &mut self,
        name: impl Into<String>,
        stage: Arc<dyn Stage>,
        critical: bool,
    ) -> Result<(), ConfigurationError> {
        let name = name.into();
        crate::utils::validate_stage_name(&name)
            .map_err(|e| ConfigurationError::new(e.to_string()))?;
        if self.entries.contains_key(&name) {
            return Err(
                ConfigurationError::new(format!("stage '{name}' is already registered"))
                    .with_stage(name),
            );
        }
        tracing::debug!(stage = %name, critical, "Registered stage");
        self.entries.insert(
            name,
            Registration {
                stage,
                critical,
                retry_predicate: None,
            },
        );
        Ok(())
    }

    /// Replaces the retryable-error predicate for a registered stage.
    pub fn set_retry_predicate<F>(&mut self, name: &str, predicate: F) -> Result<(), ConfigurationError>
    where
        F: Fn(&StageError) -> bool + Send + Sync + 'static,
    {
        let entry = self.entries.get_mut(name).ok_or_else(|| {
            ConfigurationError::new(format!("stage '{name}' is not registered")).with_stage(name)
        })?;
        entry.retry_predicate = Some(Arc::new(predicate));
        Ok(())
    }

    /// Returns true if `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Returns the registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolves `config` into stage definitions in declared order.
    ///
    /// Every configured name, enabled or not, must be registered. Disabled
    /// stages are returned with `enabled = false` and are skipped at run
    /// time. `requires` entries must name stages configured earlier.
    pub fn resolve(&self, config: &PipelineConfig) -> Result<Vec<StageDefinition>, ConfigurationError> {
        config.validate()?;

        let mut seen: HashSet<&str> = HashSet::new();
        let mut definitions = Vec::with_capacity(config.stages.len());

        for (position, stage) in config.stages.iter().enumerate() {
            let name = stage.name.as_str();
            if seen.contains(name) {
                return Err(
                    ConfigurationError::new(format!("stage '{name}' is configured more than once"))
                        .with_stage(name),
                );
            }

            let registration = self.entries.get(name).ok_or_else(|| {
                ConfigurationError::new(format!("stage '{name}' has no registered implementation"))
                    .with_stage(name)
            })?;

            for required in &stage.requires {
                if !seen.contains(required.as_str()) {
                    return Err(ConfigurationError::new(format!(
                        "stage '{name}' requires '{required}', which is not configured before it"
                    ))
                    .with_stage(name)
                    .with_stage(required));
                }
            }

            definitions.push(StageDefinition {
                name: stage.name.clone(),
                position,
                critical: stage.critical.unwrap_or(registration.critical),
                enabled: stage.enabled,
                requires: stage.requires.clone(),
                output_kind: stage.output.clone(),
                options: stage.options.clone(),
                retry: stage.effective_retry(&config.retry),
                circuit_breaker: stage.effective_circuit_breaker(&config.circuit_breaker),
                timeout: stage.timeout_ms.map(Duration::from_millis),
                runner: registration.stage.clone(),
                retry_predicate: registration.retry_predicate.clone(),
            });
            seen.insert(name);
        }

        tracing::debug!(
            pipeline = %config.name,
            stages = definitions.len(),
            enabled = definitions.iter().filter(|d| d.enabled).count(),
            "Resolved pipeline"
        );
        Ok(definitions)
    }
}

impl fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageRegistry")
            .field("stages", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RetryOverrides, StageConfig};
    use crate::stages::NoOpStage;
    use pretty_assertions::assert_eq;

    fn registry() -> StageRegistry {
        let mut registry = StageRegistry::new();
        registry.register("ingest", NoOpStage).unwrap();
        registry.register("transform", NoOpStage).unwrap();
        registry.register_with("export", NoOpStage, false).unwrap();
        registry
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = registry();
        let err = registry.register("ingest", NoOpStage).unwrap_err();
        assert!(err.message.contains("already registered"));
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_empty_name_rejected() {
        assert!(StageRegistry::new().register("", NoOpStage).is_err());
    }

    #[test]
    fn test_resolve_in_declared_order() {
        let config = PipelineConfig::new("video")
            .with_stage(StageConfig::new("ingest"))
            .with_stage(
                StageConfig::new("transform")
                    .with_requires("ingest")
                    .with_retry(RetryOverrides::max_attempts(5))
                    .with_timeout_ms(250),
            )
            .with_stage(StageConfig::new("export").with_enabled(false));

        let defs = registry().resolve(&config).unwrap();
        let names: Vec<_> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["ingest", "transform", "export"]);
        assert_eq!(defs[1].position, 1);
        assert_eq!(defs[1].retry.max_attempts, 5);
        assert_eq!(defs[1].timeout, Some(Duration::from_millis(250)));
        assert!(defs[1].critical);
        assert!(!defs[2].critical);
        assert!(!defs[2].enabled);
    }

    #[test]
    fn test_config_overrides_criticality() {
        let config = PipelineConfig::new("p").with_stage(StageConfig::new("export").with_critical(true));
        let defs = registry().resolve(&config).unwrap();
        assert!(defs[0].critical);
    }

    #[test]
    fn test_unregistered_stage_rejected() {
        let config = PipelineConfig::from_stage_names("p", ["ingest", "upload"]);
        let err = registry().resolve(&config).unwrap_err();
        assert_eq!(err.stages, vec!["upload".to_string()]);
    }

    #[test]
    fn test_unregistered_disabled_stage_rejected() {
        let config = PipelineConfig::new("p").with_stage(StageConfig::new("upload").with_enabled(false));
        assert!(registry().resolve(&config).is_err());
    }

    #[test]
    fn test_duplicate_configured_stage_rejected() {
        let config = PipelineConfig::from_stage_names("p", ["ingest", "ingest"]);
        let err = registry().resolve(&config).unwrap_err();
        assert!(err.message.contains("more than once"));
    }

    #[test]
    fn test_requires_must_name_earlier_stage() {
        let config = PipelineConfig::new("p")
            .with_stage(StageConfig::new("transform").with_requires("ingest"))
            .with_stage(StageConfig::new("ingest"));
        let err = registry().resolve(&config).unwrap_err();
        assert_eq!(err.stages, vec!["transform".to_string(), "ingest".to_string()]);

        let config = PipelineConfig::new("p").with_stage(StageConfig::new("ingest").with_requires("ingest"));
        assert!(registry().resolve(&config).is_err());
    }

    #[test]
    fn test_retry_predicate_carried_into_policy() {
        let mut registry = registry();
        registry
            .set_retry_predicate("transform", |e| matches!(e, StageError::Permanent(_)))
            .unwrap();
        assert!(registry.set_retry_predicate("missing", |_| true).is_err());

        let defs = registry
            .resolve(&PipelineConfig::from_stage_names("p", ["transform"]))
            .unwrap();
        assert!(defs[0].retry_policy().is_retryable(&StageError::permanent("x")));
        assert!(!defs[0].retry_policy().is_retryable(&StageError::transient("x")));
    }
}
