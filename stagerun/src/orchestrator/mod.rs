//! Pipeline orchestrator: the run state machine.
//!
//! A [`PipelineOrchestrator`] drives one run at a time through its stage
//! definitions in declared order. Progress is persisted through the
//! [`CheckpointManager`] after every stage finalization, so a restarted
//! process resumes where the previous one stopped without re-executing
//! succeeded stages.
//!
//! ```rust,ignore
//! let orchestrator = PipelineOrchestrator::from_config(
//!     &registry,
//!     &config,
//!     CheckpointManager::file("/var/lib/stagerun"),
//!     Arc::new(CircuitBreakerRegistry::new()),
//! )?
//! .with_hook(Arc::new(LoggingHook::default()));
//!
//! let run = orchestrator.start(RunOptions::new()).await?;
//! std::process::exit(run.exit_code());
//! ```


use crate::cancellation::CancellationToken;
use crate::checkpoint::{Checkpoint, CheckpointManager};
use crate::config::PipelineConfig;
use crate::core::{AbortReason, PipelineRun, RunStatus, StageResult};
use crate::errors::{ConfigurationError, StageError, StageExecutionError, StagerunError};
use crate::hooks::{HookSet, LifecycleHook};
use crate::observability::{run_span, stage_span};
use crate::resilience::{run_guarded, CircuitBreakerRegistry, GuardError};
use crate::stages::{StageContext, StageDefinition, StageInputs, StageRegistry};
use crate::utils::generate_run_id;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn, Instrument};

/// Per-invocation options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Run id for [`PipelineOrchestrator::start`]; generated when absent.
    pub run_id: Option<String>,
    /// Cooperative cancellation signal for the run.
    pub cancellation: Arc<CancellationToken>,
    /// Quarantine a corrupt checkpoint and start the run fresh.
    pub restart_on_corruption: bool,
}

impl RunOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the run id.
    #[must_use]
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Sets the cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: Arc<CancellationToken>) -> Self {
        self.cancellation = token;
        self
    }

    /// Confirms that a corrupt checkpoint may be set aside.
    #[must_use]
    pub fn with_restart_on_corruption(mut self, restart: bool) -> Self {
        self.restart_on_corruption = restart;
        self
    }
}

/// How one stage ended in this run.
enum StageOutcome {
    Succeeded(StageResult),
    Skipped(StageResult),
    Failed(StageResult, StagerunError),
}

impl StageOutcome {
    fn result(&self) -> &StageResult {
        match self {
            Self::Succeeded(r) | Self::Skipped(r) | Self::Failed(r, _) => r,
        }
    }
}

/// Drives pipeline runs.
#[derive(Clone)]
pub struct PipelineOrchestrator {
    name: String,
    stages: Vec<StageDefinition>,
    checkpoints: CheckpointManager,
    breakers: Arc<CircuitBreakerRegistry>,
    hooks: HookSet,
}

impl PipelineOrchestrator {
    /// Creates an orchestrator over resolved stage definitions.
    #[must_use]
    pub fn new(
        stages: Vec<StageDefinition>,
        checkpoints: CheckpointManager,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Self {
        Self {
            name: crate::config::DEFAULT_PIPELINE_NAME.to_string(),
            stages,
            checkpoints,
            breakers,
            hooks: HookSet::new(),
        }
    }

    /// Resolves `config` against `registry` and builds an orchestrator.
    pub fn from_config(
        registry: &StageRegistry,
        config: &PipelineConfig,
        checkpoints: CheckpointManager,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Result<Self, ConfigurationError> {
        let stages = registry.resolve(config)?;
        Ok(Self::new(stages, checkpoints, breakers).with_name(config.name.clone()))
    }

    /// Sets the pipeline name stored in checkpoints.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Adds a lifecycle hook.
    #[must_use]
    pub fn with_hook(mut self, hook: Arc<dyn LifecycleHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Adds several lifecycle hooks.
    #[must_use]
    pub fn with_hooks(mut self, hooks: impl IntoIterator<Item = Arc<dyn LifecycleHook>>) -> Self {
        for hook in hooks {
            self.hooks.push(hook);
        }
        self
    }

    /// The pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The stage definitions in execution order.
    #[must_use]
    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    /// The checkpoint manager.
    #[must_use]
    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// The shared circuit breakers.
    #[must_use]
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Starts a run, generating a run id unless `options` carries one.
    pub async fn start(&self, options: RunOptions) -> Result<PipelineRun, StagerunError> {
        let run_id = options.run_id.clone().unwrap_or_else(generate_run_id);
        info!(run_id = %run_id, pipeline = %self.name, "Starting run");
        self.execute(&run_id, &options, false).await
    }

    /// Resumes an existing run.
    ///
    /// Fails with [`StagerunError::RunNotFound`] if no checkpoint exists.
    pub async fn resume(&self, run_id: &str, options: RunOptions) -> Result<PipelineRun, StagerunError> {
        info!(run_id, pipeline = %self.name, "Resuming run");
        self.execute(run_id, &options, true).await
    }

    /// Runs `run_id`, resuming its checkpoint if one exists.
    ///
    /// `options.run_id` is ignored.
    pub async fn run(&self, run_id: &str, options: RunOptions) -> Result<PipelineRun, StagerunError> {
        self.execute(run_id, &options, false).await
    }

    /// Reads the stored state of a run without executing anything.
    pub async fn status(&self, run_id: &str) -> Result<PipelineRun, StagerunError> {
        self.checkpoints
            .load(run_id)
            .await?
            .map(|checkpoint| checkpoint.to_run())
            .ok_or_else(|| StagerunError::RunNotFound(run_id.to_string()))
    }

    async fn execute(
        &self,
        run_id: &str,
        options: &RunOptions,
        must_exist: bool,
    ) -> Result<PipelineRun, StagerunError> {
        let _claim = self.checkpoints.claim(run_id)?;
        let mut checkpoint = self.open(run_id, options, must_exist).await?;
        self.drive(&mut checkpoint, &options.cancellation)
            .instrument(run_span(run_id, &self.name))
            .await
    }

    /// Loads the run's checkpoint or creates a fresh one.
    async fn open(
        &self,
        run_id: &str,
        options: &RunOptions,
        must_exist: bool,
    ) -> Result<Checkpoint, StagerunError> {
        let existing = match self.checkpoints.load(run_id).await {
            Ok(existing) => existing,
            Err(StagerunError::CheckpointCorruption(err)) if options.restart_on_corruption => {
                warn!(
                    run_id,
                    location = %err.location,
                    reason = %err.reason,
                    "Checkpoint corrupt, restarting run fresh"
                );
                self.checkpoints.quarantine(run_id).await?;
                return Ok(Checkpoint::new(run_id, &self.name));
            }
            Err(e) => return Err(e),
        };

        match existing {
            Some(checkpoint) if checkpoint.pipeline != self.name => Err(ConfigurationError::new(
                format!(
                    "run '{run_id}' belongs to pipeline '{}', not '{}'",
                    checkpoint.pipeline, self.name
                ),
            )
            .into()),
            Some(checkpoint) => {
                debug!(
                    run_id,
                    previous_status = %checkpoint.status,
                    succeeded = checkpoint.succeeded_outputs().len(),
                    "Loaded existing checkpoint"
                );
                Ok(checkpoint)
            }
            None if must_exist => Err(StagerunError::RunNotFound(run_id.to_string())),
            None => Ok(Checkpoint::new(run_id, &self.name)),
        }
    }

    async fn drive(
        &self,
        checkpoint: &mut Checkpoint,
        cancel: &Arc<CancellationToken>,
    ) -> Result<PipelineRun, StagerunError> {
        let run_id = checkpoint.run_id.clone();
        let names: Vec<&str> = self.stages.iter().map(|s| s.name.as_str()).collect();
        checkpoint.ensure_stages(&names);
        checkpoint.begin_run();
        if let Err(e) = self.checkpoints.save(checkpoint).await {
            return self.fail_run(checkpoint, e).await;
        }
        self.hooks.run_start(&checkpoint.to_run());

        let mut abort: Option<AbortReason> = None;

        for def in &self.stages {
            if cancel.is_cancelled() {
                let reason = cancel.reason_or_default();
                warn!(run_id = %run_id, stage = %def.name, reason = %reason, "Run cancelled before stage");
                abort = Some(AbortReason::Cancelled { reason });
                break;
            }

            if let Some(existing) = checkpoint.stage(&def.name).filter(|s| s.is_succeeded()) {
                debug!(run_id = %run_id, stage = %def.name, "Stage already succeeded, not re-executing");
                self.hooks.stage_restored(&run_id, existing);
                continue;
            }

            let outcome = if def.enabled {
                self.execute_stage(def, checkpoint, cancel)
                    .instrument(stage_span(&run_id, &def.name))
                    .await
            } else {
                let mut result = StageResult::pending(&def.name);
                result.skip("stage disabled");
                StageOutcome::Skipped(result)
            };

            checkpoint.record(outcome.result().clone());
            if let Err(e) = self.checkpoints.save(checkpoint).await {
                return self.fail_run(checkpoint, e).await;
            }

            match outcome {
                StageOutcome::Succeeded(result) => self.hooks.stage_complete(&run_id, &result),
                StageOutcome::Skipped(result) => {
                    info!(run_id = %run_id, stage = %def.name, "Stage disabled, skipped");
                    self.hooks.stage_skip(&run_id, &result);
                }
                StageOutcome::Failed(result, err) => {
                    self.hooks.stage_error(&run_id, &result, &err);
                    match err {
                        StagerunError::Cancelled(reason) => {
                            abort = Some(AbortReason::Cancelled { reason });
                            break;
                        }
                        err if def.critical => {
                            error!(run_id = %run_id, stage = %def.name, error = %err, "Critical stage failed, aborting run");
                            abort = Some(AbortReason::CriticalStageFailed {
                                stage: def.name.clone(),
                            });
                            break;
                        }
                        err => {
                            warn!(run_id = %run_id, stage = %def.name, error = %err, "Non-critical stage failed, continuing");
                        }
                    }
                }
            }
        }

        let status = if abort.is_some() {
            RunStatus::Aborted
        } else {
            RunStatus::Completed
        };
        checkpoint.finish(status, abort);
        if let Err(e) = self.checkpoints.save(checkpoint).await {
            return self.fail_run(checkpoint, e).await;
        }

        let run = checkpoint.to_run();
        info!(
            run_id = %run_id,
            status = %run.status,
            failed = run.stages_with_status(crate::core::StageStatus::Failed).len(),
            "Run finished"
        );
        self.hooks.run_finish(&run);
        Ok(run)
    }

    async fn execute_stage(
        &self,
        def: &StageDefinition,
        checkpoint: &Checkpoint,
        cancel: &Arc<CancellationToken>,
    ) -> StageOutcome {
        let run_id = checkpoint.run_id.as_str();
        let mut result = checkpoint
            .stage(&def.name)
            .cloned()
            .unwrap_or_else(|| StageResult::pending(&def.name));
        result.begin();

        if let Some(missing) = def
            .requires
            .iter()
            .find(|name| !checkpoint.is_stage_succeeded(name))
        {
            let error = StageError::missing_input(missing.clone());
            warn!(run_id, stage = %def.name, input = %missing, "Required input missing, not executing");
            result.fail(0, &error);
            return StageOutcome::Failed(result, StageExecutionError::new(&def.name, 0, error).into());
        }

        self.hooks.stage_start(run_id, &result);

        let inputs = StageInputs::new(checkpoint.succeeded_outputs(), def.requires.iter().cloned());
        let ctx = StageContext::new(run_id, &def.name, inputs, Arc::clone(cancel))
            .with_options(def.options.clone());
        let policy = def.retry_policy();
        let breaker = self.breakers.get_or_create(&def.name, &def.circuit_breaker);
        let timeout = def.timeout;

        let guarded = run_guarded(&def.name, &policy, &breaker, cancel, |attempt| {
            let runner = Arc::clone(&def.runner);
            let ctx = ctx.clone().with_attempt(attempt);
            async move {
                match timeout {
                    Some(limit) => tokio::time::timeout(limit, runner.execute(&ctx))
                        .await
                        .unwrap_or_else(|_| Err(StageError::Timeout(limit))),
                    None => runner.execute(&ctx).await,
                }
            }
        })
        .await;

        let attempts = guarded.attempts;
        match guarded.result {
            Ok(output) => {
                result.succeed(attempts, &output);
                info!(
                    run_id,
                    stage = %def.name,
                    attempts,
                    duration_ms = result.duration_ms(),
                    output_ref = output.artifact_ref.as_deref(),
                    "Stage succeeded"
                );
                StageOutcome::Succeeded(result)
            }
            Err(GuardError::Stage(error)) => {
                result.fail(attempts, &error);
                StageOutcome::Failed(result, StageExecutionError::new(&def.name, attempts, error).into())
            }
            Err(GuardError::CircuitOpen(open)) => {
                result.fail(attempts, &open);
                StageOutcome::Failed(result, open.into())
            }
            Err(GuardError::Cancelled(reason)) => {
                result.fail(attempts, format!("cancelled: {reason}"));
                StageOutcome::Failed(result, StagerunError::Cancelled(reason))
            }
        }
    }

    /// Marks the run failed after a checkpoint write error and returns it.
    async fn fail_run(
        &self,
        checkpoint: &mut Checkpoint,
        error: StagerunError,
    ) -> Result<PipelineRun, StagerunError> {
        error!(run_id = %checkpoint.run_id, error = %error, "Checkpoint write failed, failing run");
        checkpoint.finish(RunStatus::Failed, None);
        if let Err(e) = self.checkpoints.save(checkpoint).await {
            warn!(run_id = %checkpoint.run_id, error = %e, "Could not record failed status");
        }
        self.hooks.run_finish(&checkpoint.to_run());
        Err(error)
    }
}

impl fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("name", &self.name)
            .field("stages", &self.stages.iter().map(|s| s.name.as_str()).collect::<Vec<_>>())
            .field("hooks", &self.hooks.len())
            .finish_non_exhaustive()
    }
}
