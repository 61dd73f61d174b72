use super::{
    ListenerId, ProcessComponent, ProcessFailure, ProcessState, ResultListeners, RollbackFailure,
    RunControl, SequentialProcess,
};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

type Extractor<C, T> = Box<dyn Fn(&mut C) -> Result<T> + Send>;

/// A sequential process that computes a typed result from its context on
/// success and hands it to every attached listener exactly once.
pub struct ResultProcess<C, T> {
    inner: SequentialProcess<C>,
    extract: Extractor<C, T>,
    listeners: Arc<ResultListeners<T>>,
    extraction_failed: bool,
}

impl<C, T> ResultProcess<C, T>
where
    C: Send + 'static,
    T: Send + 'static,
{
    pub fn new<F>(inner: SequentialProcess<C>, extract: F) -> Self
    where
        F: Fn(&mut C) -> Result<T> + Send + 'static,
    {
        Self {
            inner,
            extract: Box::new(extract),
            listeners: Arc::new(ResultListeners::new()),
            extraction_failed: false,
        }
    }

    pub fn attach<F>(&self, listener: F) -> Option<ListenerId>
    where
        F: FnOnce(&T) + Send + 'static,
    {
        self.listeners.attach(listener)
    }

    pub fn detach(&self, id: ListenerId) -> bool {
        self.listeners.detach(id)
    }

    /// Shared registry, usable after the process was handed to a manager.
    pub fn listeners(&self) -> Arc<ResultListeners<T>> {
        self.listeners.clone()
    }
}

#[async_trait]
impl<C, T> ProcessComponent<C> for ResultProcess<C, T>
where
    C: Send,
    T: Send + 'static,
{
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn state(&self) -> ProcessState {
        if self.extraction_failed {
            ProcessState::Failed
        } else {
            self.inner.state()
        }
    }

    fn children(&self) -> &[Box<dyn ProcessComponent<C>>] {
        self.inner.children()
    }

    async fn execute(&mut self, ctx: &mut C, control: &RunControl) -> Result<(), ProcessFailure> {
        self.inner.execute(ctx, control).await?;

        let extracted = (self.extract)(&mut *ctx);
        match extracted {
            Ok(value) => {
                let delivered = self.listeners.notify(&value);
                tracing::debug!(parent: control.span(), "result delivered to {} listener(s)", delivered);
                Ok(())
            }
            Err(err) => {
                let mut failure = ProcessFailure::new(err, self.inner.name());
                self.inner
                    .rollback(ctx, control, &mut failure.rollback_failures)
                    .await;
                self.extraction_failed = true;
                Err(failure)
            }
        }
    }

    async fn rollback(
        &mut self,
        ctx: &mut C,
        control: &RunControl,
        failures: &mut Vec<RollbackFailure>,
    ) {
        self.inner.rollback(ctx, control, failures).await;
    }
}
