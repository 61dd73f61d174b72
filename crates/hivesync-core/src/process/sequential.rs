use super::{
    ProcessComponent, ProcessFailure, ProcessState, RollbackFailure, RunControl, Step,
    StepComponent,
};
use crate::error::SyncError;
use async_trait::async_trait;

/// Runs children strictly in order. The first failure halts forward
/// progress and compensates every child that already succeeded, last first.
pub struct SequentialProcess<C> {
    name: String,
    state: ProcessState,
    children: Vec<Box<dyn ProcessComponent<C>>>,
}

impl<C: Send + 'static> SequentialProcess<C> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: ProcessState::Unstarted,
            children: Vec::new(),
        }
    }

    pub fn with(mut self, child: impl ProcessComponent<C> + 'static) -> Self {
        self.children.push(Box::new(child));
        self
    }

    pub fn with_step<S: Step<C> + 'static>(self, step: S) -> Self {
        self.with(StepComponent::new(step))
    }

    pub fn push(&mut self, child: Box<dyn ProcessComponent<C>>) {
        self.children.push(child);
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

#[async_trait]
impl<C: Send> ProcessComponent<C> for SequentialProcess<C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> ProcessState {
        self.state
    }

    fn children(&self) -> &[Box<dyn ProcessComponent<C>>] {
        &self.children
    }

    async fn execute(&mut self, ctx: &mut C, control: &RunControl) -> Result<(), ProcessFailure> {
        if self.state != ProcessState::Unstarted {
            return Err(ProcessFailure::new(
                SyncError::precondition(format!("{} is already {}", self.name, self.state)),
                self.name.clone(),
            ));
        }
        self.state = ProcessState::Running;

        for i in 0..self.children.len() {
            let outcome = match control.checkpoint().await {
                Ok(()) => self.children[i].execute(ctx, control).await,
                Err(err) => Err(ProcessFailure::new(err, self.children[i].name())),
            };

            if let Err(mut failure) = outcome {
                tracing::info!(
                    parent: control.span(),
                    "{} halted at {}, compensating {} step(s)",
                    self.name,
                    failure.step,
                    i
                );
                for child in self.children[..i].iter_mut().rev() {
                    child
                        .rollback(ctx, control, &mut failure.rollback_failures)
                        .await;
                }
                self.state = ProcessState::Failed;
                return Err(failure.within(&self.name));
            }
        }

        self.state = ProcessState::Succeeded;
        Ok(())
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
        for child in self.children.iter_mut().rev() {
            child.rollback(ctx, control, failures).await;
        }
        self.state = ProcessState::RolledBack;
    }
}
