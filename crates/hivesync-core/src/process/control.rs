//! Run control shared between a running tree and whoever started it.

use super::ProcessState;
use crate::error::{Result, SyncError};
use std::fmt;
use tokio::sync::watch;
use tracing::Span;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub u64);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Requested run mode, observed cooperatively at step boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunSignal {
    Run,
    Pause,
    Cancel,
}

/// Per-tree control block: pause/resume/cancel requests flowing down, root
/// state flowing up, and the tracing span every component logs under.
pub struct RunControl {
    id: ProcessId,
    signal: watch::Sender<RunSignal>,
    state: watch::Sender<ProcessState>,
    span: Span,
}

impl RunControl {
    pub fn new(id: ProcessId, name: &str) -> Self {
        let (signal, _) = watch::channel(RunSignal::Run);
        let (state, _) = watch::channel(ProcessState::Unstarted);
        Self {
            id,
            signal,
            state,
            span: tracing::info_span!("process", id = id.0, name = %name),
        }
    }

    /// Control for a tree driven directly, outside a manager.
    pub fn detached(name: &str) -> Self {
        Self::new(ProcessId(0), name)
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ProcessState> {
        self.state.subscribe()
    }

    pub(crate) fn set_state(&self, state: ProcessState) {
        self.state.send_replace(state);
    }

    pub fn signal(&self) -> RunSignal {
        *self.signal.borrow()
    }

    pub fn pause(&self) -> Result<()> {
        self.ensure_live("pause")?;
        let changed = self.signal.send_if_modified(|s| {
            let run = *s == RunSignal::Run;
            if run {
                *s = RunSignal::Pause;
            }
            run
        });
        if !changed {
            return Err(SyncError::precondition(format!(
                "process {} cannot pause while {:?}",
                self.id,
                self.signal()
            )));
        }
        tracing::info!(parent: &self.span, "pause requested");
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        self.ensure_live("resume")?;
        let changed = self.signal.send_if_modified(|s| {
            let paused = *s == RunSignal::Pause;
            if paused {
                *s = RunSignal::Run;
            }
            paused
        });
        if !changed {
            return Err(SyncError::precondition(format!(
                "process {} is not paused",
                self.id
            )));
        }
        tracing::info!(parent: &self.span, "resume requested");
        Ok(())
    }

    pub fn cancel(&self) -> Result<()> {
        self.ensure_live("cancel")?;
        let changed = self.signal.send_if_modified(|s| {
            let live = *s != RunSignal::Cancel;
            *s = RunSignal::Cancel;
            live
        });
        if !changed {
            return Err(SyncError::precondition(format!(
                "process {} is already cancelled",
                self.id
            )));
        }
        tracing::info!(parent: &self.span, "cancel requested");
        Ok(())
    }

    fn ensure_live(&self, action: &str) -> Result<()> {
        let state = self.state();
        if state.is_terminal() {
            return Err(SyncError::precondition(format!(
                "cannot {action} process {}: already {state}",
                self.id
            )));
        }
        Ok(())
    }

    /// Step boundary. Returns immediately while running, parks while paused
    /// and fails with [`SyncError::Cancelled`] once cancellation is requested.
    pub async fn checkpoint(&self) -> Result<()> {
        let mut signals = self.signal.subscribe();
        loop {
            let signal = *signals.borrow_and_update();
            match signal {
                RunSignal::Run => {
                    if self.state() == ProcessState::Paused {
                        self.set_state(ProcessState::Running);
                        tracing::info!(parent: &self.span, "resumed");
                    }
                    return Ok(());
                }
                RunSignal::Cancel => return Err(SyncError::Cancelled),
                RunSignal::Pause => {
                    if self.state() != ProcessState::Paused {
                        self.set_state(ProcessState::Paused);
                        tracing::info!(parent: &self.span, "paused at step boundary");
                    }
                    if signals.changed().await.is_err() {
                        return Err(SyncError::Cancelled);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_checkpoint_parks_until_resumed() -> anyhow::Result<()> {
        let control = std::sync::Arc::new(RunControl::detached("test"));
        control.set_state(ProcessState::Running);
        control.pause()?;
        assert!(control.pause().is_err());

        let parked = {
            let control = control.clone();
            tokio::spawn(async move { control.checkpoint().await })
        };
        let mut states = control.subscribe_state();
        states.wait_for(|s| *s == ProcessState::Paused).await?;
        assert!(!parked.is_finished());

        control.resume()?;
        parked.await??;
        assert_eq!(control.state(), ProcessState::Running);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_wins_over_pause() -> anyhow::Result<()> {
        let control = RunControl::detached("test");
        control.set_state(ProcessState::Running);
        control.pause()?;
        control.cancel()?;
        let outcome = tokio::time::timeout(Duration::from_secs(1), control.checkpoint()).await?;
        assert_eq!(outcome, Err(SyncError::Cancelled));
        assert!(control.cancel().is_err());
        Ok(())
    }

    #[test]
    fn test_terminal_rejects_requests() {
        let control = RunControl::detached("test");
        control.set_state(ProcessState::Succeeded);
        assert!(matches!(control.pause(), Err(SyncError::PreconditionViolation(_))));
        assert!(matches!(control.cancel(), Err(SyncError::PreconditionViolation(_))));
    }
}
