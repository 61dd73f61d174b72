//! The component contract shared by leaf steps and composites.

use super::{ProcessState, RunControl};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use thiserror::Error;
use tracing::Instrument;

/// A rollback that could not be completed. Recorded, never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackFailure {
    pub step: String,
    pub error: SyncError,
}

/// Terminal failure of a process tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{step} failed: {error}")]
pub struct ProcessFailure {
    #[source]
    pub error: SyncError,
    /// Deepest component that failed.
    pub step: String,
    /// Names from the root down to `step`.
    pub path: Vec<String>,
    pub rollback_failures: Vec<RollbackFailure>,
}

impl ProcessFailure {
    pub fn new(error: SyncError, step: impl Into<String>) -> Self {
        let step = step.into();
        Self {
            error,
            path: vec![step.clone()],
            step,
            rollback_failures: Vec::new(),
        }
    }

    pub(crate) fn within(mut self, parent: &str) -> Self {
        self.path.insert(0, parent.to_string());
        self
    }

    pub fn kind(&self) -> &'static str {
        self.error.kind()
    }

    pub fn is_cancelled(&self) -> bool {
        self.error == SyncError::Cancelled
    }
}

/// A node in an executable, rollback-capable operation tree.
#[async_trait]
pub trait ProcessComponent<C>: Send {
    fn name(&self) -> &str;

    fn state(&self) -> ProcessState;

    fn children(&self) -> &[Box<dyn ProcessComponent<C>>] {
        &[]
    }

    async fn execute(&mut self, ctx: &mut C, control: &RunControl) -> Result<(), ProcessFailure>;

    /// Best-effort inverse of a successful `execute`. Failures are appended
    /// to `failures`; only components in `Succeeded` are affected.
    async fn rollback(
        &mut self,
        ctx: &mut C,
        control: &RunControl,
        failures: &mut Vec<RollbackFailure>,
    );
}

/// One externally visible action and its inverse.
#[async_trait]
pub trait Step<C: Send>: Send {
    fn name(&self) -> &'static str;

    async fn execute(&mut self, ctx: &mut C) -> Result<()>;

    async fn rollback(&mut self, _ctx: &mut C) -> Result<()> {
        Ok(())
    }
}

/// Adapts a [`Step`] into a leaf [`ProcessComponent`].
pub struct StepComponent<S> {
    step: S,
    state: ProcessState,
}

impl<S> StepComponent<S> {
    pub fn new(step: S) -> Self {
        Self {
            step,
            state: ProcessState::Unstarted,
        }
    }

    pub fn step(&self) -> &S {
        &self.step
    }
}

#[async_trait]
impl<C, S> ProcessComponent<C> for StepComponent<S>
where
    C: Send,
    S: Step<C>,
{
    fn name(&self) -> &str {
        self.step.name()
    }

    fn state(&self) -> ProcessState {
        self.state
    }

    async fn execute(&mut self, ctx: &mut C, control: &RunControl) -> Result<(), ProcessFailure> {
        let name = self.step.name();
        if self.state != ProcessState::Unstarted {
            return Err(ProcessFailure::new(
                SyncError::precondition(format!("step {name} is already {}", self.state)),
                name,
            ));
        }

        self.state = ProcessState::Running;
        let span = tracing::debug_span!(parent: control.span(), "step", name);
        match self.step.execute(ctx).instrument(span.clone()).await {
            Ok(()) => {
                self.state = ProcessState::Succeeded;
                tracing::debug!(parent: &span, "step succeeded");
                Ok(())
            }
            Err(err) => {
                self.state = ProcessState::Failed;
                tracing::warn!(parent: &span, kind = err.kind(), "step failed: {}", err);
                Err(ProcessFailure::new(err, name))
            }
        }
    }

    async fn rollback(
        &mut self,
        ctx: &mut C,
        control: &RunControl,
        failures: &mut Vec<RollbackFailure>,
    ) {
        if self.state != ProcessState::Succeeded {
            return;
        }
        let name = self.step.name();
        let span = tracing::debug_span!(parent: control.span(), "rollback", name);
        if let Err(err) = self.step.rollback(ctx).instrument(span.clone()).await {
            tracing::warn!(parent: &span, "rollback failed: {}", err);
            failures.push(RollbackFailure {
                step: name.to_string(),
                error: err,
            });
        }
        self.state = ProcessState::RolledBack;
    }
}
