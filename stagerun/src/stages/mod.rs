//! Stage trait and implementations.
//!
//! Stages are the units of work a pipeline sequences. Each is registered by
//! name in a [`StageRegistry`] and invoked with a [`StageContext`] carrying
//! its options and the outputs of earlier stages.

mod context;
mod registry;

pub use context::{StageContext, StageInputs};
pub use registry::{StageDefinition, StageRegistry};

use crate::core::StageOutput;
use crate::errors::StageError;
use async_trait::async_trait;
use std::fmt::Debug;
use std::future::Future;
use std::marker::PhantomData;

/// Trait for pipeline stages.
///
/// A stage consumes the context built from prior stage outputs and returns
/// its own output, or a [`StageError`] which the retry policy classifies.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Executes the stage.
    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput, StageError>;
}

/// A simple function-based stage.
pub struct FnStage<F>
where
    F: Fn(&StageContext) -> Result<StageOutput, StageError> + Send + Sync,
{
    label: String,
    func: F,
}

impl<F> FnStage<F>
where
    F: Fn(&StageContext) -> Result<StageOutput, StageError> + Send + Sync,
{
    /// Creates a new function-based stage.
    pub fn new(label: impl Into<String>, func: F) -> Self {
        Self {
            label: label.into(),
            func,
        }
    }
}

impl<F> Debug for FnStage<F>
where
    F: Fn(&StageContext) -> Result<StageOutput, StageError> + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStage").field("label", &self.label).finish()
    }
}

#[async_trait]
impl<F> Stage for FnStage<F>
where
    F: Fn(&StageContext) -> Result<StageOutput, StageError> + Send + Sync,
{
    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput, StageError> {
        (self.func)(ctx)
    }
}

/// An async function-based stage.
pub struct AsyncFnStage<F, Fut>
where
    F: Fn(StageContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StageOutput, StageError>> + Send,
{
    label: String,
    func: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> AsyncFnStage<F, Fut>
where
    F: Fn(StageContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StageOutput, StageError>> + Send,
{
    /// Creates a new async function-based stage.
    pub fn new(label: impl Into<String>, func: F) -> Self {
        Self {
            label: label.into(),
            func,
            _phantom: PhantomData,
        }
    }
}

impl<F, Fut> Debug for AsyncFnStage<F, Fut>
where
    F: Fn(StageContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StageOutput, StageError>> + Send,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncFnStage").field("label", &self.label).finish()
    }
}

#[async_trait]
impl<F, Fut> Stage for AsyncFnStage<F, Fut>
where
    F: Fn(StageContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StageOutput, StageError>> + Send,
{
    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput, StageError> {
        (self.func)(ctx.clone()).await
    }
}

/// A stage that succeeds with an empty output.
#[derive(Debug, Clone, Default)]
pub struct NoOpStage;

#[async_trait]
impl Stage for NoOpStage {
    async fn execute(&self, _ctx: &StageContext) -> Result<StageOutput, StageError> {
        Ok(StageOutput::empty())
    }
}
