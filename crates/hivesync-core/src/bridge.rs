//! Async result bridge.
//!
//! Every data access call is dispatched onto the runtime immediately and
//! handed back as a [`PendingOperation`]: a single-fulfillment future whose
//! outcome is already translated into [`SyncError`]. Callers either `.await`
//! it, attach a continuation with [`PendingOperation::on_complete`], or do a
//! bounded wait with [`PendingOperation::wait`]. Nothing here retries.

use crate::error::{Result, SyncError};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::task::JoinHandle;

enum Pending<T> {
    Ready(Option<Result<T>>),
    InFlight(JoinHandle<Result<T>>),
}

#[must_use = "a pending operation does nothing observable unless awaited"]
pub struct PendingOperation<T> {
    operation: &'static str,
    state: Pending<T>,
}

// No field is structurally pinned: the join handle is itself `Unpin`.
impl<T> Unpin for PendingOperation<T> {}

impl<T: Send + 'static> PendingOperation<T> {
    /// Start `fut` on the runtime's worker pool.
    pub(crate) fn spawn<F>(operation: &'static str, fut: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            operation,
            state: Pending::InFlight(tokio::spawn(fut)),
        }
    }

    /// An operation that was refused before reaching the network.
    pub(crate) fn failed(operation: &'static str, err: SyncError) -> Self {
        Self {
            operation,
            state: Pending::Ready(Some(Err(err))),
        }
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    pub fn is_finished(&self) -> bool {
        match &self.state {
            Pending::Ready(_) => true,
            Pending::InFlight(handle) => handle.is_finished(),
        }
    }

    /// Wait at most `timeout`. Expiry is reported as a network failure.
    ///
    /// An expired operation is aborted and settled before this returns: once
    /// the caller sees the timeout, the operation can no longer take effect.
    /// If it finished in the meantime its outcome is returned instead.
    pub async fn wait(mut self, timeout: Duration) -> Result<T> {
        let operation = self.operation;
        if let Ok(outcome) = tokio::time::timeout(timeout, &mut self).await {
            return outcome;
        }

        if self.is_finished() {
            return self.await;
        }
        tracing::warn!(operation, ?timeout, "bounded wait expired, aborting");
        if let Pending::InFlight(handle) = &self.state {
            handle.abort();
        }
        match self.await {
            Ok(value) => Ok(value),
            Err(_) => Err(SyncError::network(format!(
                "{operation} timed out after {timeout:?}"
            ))),
        }
    }

    /// Run `f` with the outcome once it is known, without blocking the caller.
    pub fn on_complete<F>(self, f: F)
    where
        F: FnOnce(Result<T>) + Send + 'static,
    {
        tokio::spawn(async move { f(self.await) });
    }
}

impl<T> Future for PendingOperation<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let operation = self.operation;
        let outcome = match &mut self.state {
            Pending::Ready(slot) => slot.take().unwrap_or_else(|| {
                Err(SyncError::precondition(format!(
                    "{operation} polled after completion"
                )))
            }),
            Pending::InFlight(handle) => match Pin::new(handle).poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(outcome)) => outcome,
                Poll::Ready(Err(join)) => {
                    Err(SyncError::network(format!("{operation} aborted: {join}")))
                }
            },
        };
        self.state = Pending::Ready(None);

        if let Err(err) = &outcome {
            tracing::debug!(operation, kind = err.kind(), "operation failed: {}", err);
        }
        Poll::Ready(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_await_outcome() {
        let op = PendingOperation::spawn("test", async { Ok(7u32) });
        assert_eq!(op.await, Ok(7));

        let refused: PendingOperation<u32> =
            PendingOperation::failed("test", SyncError::precondition("offline"));
        assert!(refused.is_finished());
        assert!(matches!(refused.await, Err(SyncError::PreconditionViolation(_))));
    }

    #[tokio::test]
    async fn test_bounded_wait_times_out() {
        let op = PendingOperation::spawn("slow", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        });
        let err = op.wait(Duration::from_millis(20)).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_expired_operation_has_no_effect() {
        let landed = Arc::new(AtomicBool::new(false));
        let flag = landed.clone();
        let op = PendingOperation::spawn("late-write", async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        let err = op.wait(Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(err.kind(), "network");
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!landed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_continuation_receives_outcome() {
        let (tx, rx) = oneshot::channel();
        PendingOperation::spawn("cont", async { Err::<(), _>(SyncError::network("no route")) })
            .on_complete(move |outcome| {
                let _ = tx.send(outcome);
            });
        let outcome = rx.await.unwrap();
        assert_eq!(outcome, Err(SyncError::network("no route")));
    }
}
